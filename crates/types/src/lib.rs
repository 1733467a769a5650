#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Core type definitions for the prm resource arbiter
//!
//! This crate provides the small value types shared by the arbiter, its
//! configuration and the CLI: validated priorities, the level count they are
//! validated against, and the outcome of a release.

pub mod priority;

// Re-export commonly used types
pub use priority::{Handoff, Priority, PriorityLevels, MAX_LEVELS, NONE_WAITING};

use serde::{Deserialize, Serialize};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Plain,
    Tty,
    Json,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Tty
    }
}

impl clap::ValueEnum for OutputFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Plain, Self::Tty, Self::Json]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Plain => clap::builder::PossibleValue::new("plain"),
            Self::Tty => clap::builder::PossibleValue::new("tty"),
            Self::Json => clap::builder::PossibleValue::new("json"),
        })
    }
}
