//! Output rendering and formatting

use crate::simulation::{ScenarioReport, SimulationReport};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, ContentArrangement, Table};
use prm_types::{OutputFormat, NONE_WAITING};
use serde::Serialize;
use std::io;

/// Output renderer for CLI results
#[derive(Clone, Copy)]
pub struct OutputRenderer {
    format: OutputFormat,
}

impl OutputRenderer {
    /// Create new output renderer
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn render_scenario(&self, report: &ScenarioReport) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            return Self::render_json(report);
        }

        println!("Scenario with {} priority levels", report.levels);
        let mut table = self.table(&["Actor", "Action", "Handoff"]);
        for step in &report.steps {
            let handoff = match step.handoff {
                None => "-".to_string(),
                Some(NONE_WAITING) => "NONE_WAITING".to_string(),
                Some(priority) => format!("priority {priority}"),
            };
            table.add_row(vec![
                Cell::new(step.actor),
                Cell::new(&step.action),
                Cell::new(handoff),
            ]);
        }
        println!("{table}");
        Ok(())
    }

    pub fn render_simulation(&self, report: &SimulationReport) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            return Self::render_json(report);
        }

        println!(
            "{} workers x {} rounds over {} levels in {}ms",
            report.workers, report.rounds, report.levels, report.elapsed_ms
        );
        let mut table = self.table(&["Priority", "Grants", "Handed over to"]);
        for level in (0..report.levels).rev() {
            table.add_row(vec![
                Cell::new(level),
                Cell::new(report.grants.get(level).copied().unwrap_or(0)),
                Cell::new(report.handoffs.get(level).copied().unwrap_or(0)),
            ]);
        }
        println!("{table}");
        println!(
            "Releases with nobody waiting: {}",
            report.releases_without_waiters
        );
        if report.timeouts > 0 {
            println!("Abandoned after timeout: {}", report.timeouts);
        }
        if report.exhausted_workers > 0 {
            println!(
                "Workers stopped by the use budget: {}",
                report.exhausted_workers
            );
        }
        println!("Max concurrent holders: {}", report.max_concurrent_holders);
        Ok(())
    }

    pub fn render_text(&self, text: &str) {
        if self.format == OutputFormat::Json {
            println!("{}", serde_json::json!({ "config": text }));
        } else {
            print!("{text}");
        }
    }

    fn render_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        println!("{json}");
        Ok(())
    }

    fn table(&self, headers: &[&str]) -> Table {
        let mut table = Table::new();
        if self.format == OutputFormat::Tty {
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);
        } else {
            table.load_preset(comfy_table::presets::NOTHING);
        }
        table.set_header(
            headers
                .iter()
                .map(|header| Cell::new(header).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
        table
    }
}
