//! Scenario and load simulation against a live arbiter
//!
//! Both run on plain OS threads; call them from a blocking context.

use crate::error::CliError;
use prm_errors::ResourceError;
use parking_lot::Mutex;
use prm_resources::{CancellationToken, PriorityResourceManager};
use prm_types::{Handoff, PriorityLevels};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// One step of the scripted scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioStep {
    pub actor: &'static str,
    pub action: String,
    /// Signaled level, or -1 when nobody was waiting
    pub handoff: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub levels: usize,
    pub steps: Vec<ScenarioStep>,
}

/// Settings for one simulation run
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub levels: PriorityLevels,
    pub workers: usize,
    pub rounds: usize,
    pub hold: Duration,
    pub timeout: Option<Duration>,
    /// Total grants before the arbiter refuses further requests
    pub max_uses: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub levels: usize,
    pub workers: usize,
    pub rounds: usize,
    /// Grants per level, lowest level first
    pub grants: Vec<usize>,
    /// Handoffs that woke a waiter, per level
    pub handoffs: Vec<usize>,
    pub releases_without_waiters: usize,
    pub timeouts: usize,
    /// Workers that stopped early because the use budget was spent
    pub exhausted_workers: usize,
    pub max_concurrent_holders: usize,
    pub elapsed_ms: u128,
}

#[derive(Default)]
struct Tally {
    grants: Vec<usize>,
    handoffs: Vec<usize>,
    releases_without_waiters: usize,
    timeouts: usize,
    exhausted_workers: usize,
}

/// Block until the arbiter reports exactly `expected` waiters per level
fn await_waiting<R>(manager: &PriorityResourceManager<R>, expected: &[usize]) {
    while manager.snapshot().waiting != expected {
        thread::sleep(Duration::from_millis(1));
    }
}

/// Run the four-level handoff walk-through
///
/// A takes the resource at level 1, B queues at level 3 and C at level 0.
/// Each release must hand the resource to the most urgent remaining waiter.
///
/// # Errors
///
/// Returns an error if a thread panics or any release reports the wrong
/// waiter.
pub fn run_scenario() -> Result<ScenarioReport, CliError> {
    let levels = PriorityLevels::new(4)?;
    let manager = &PriorityResourceManager::new(Arc::new(()), levels);

    manager.request_resource(1)?;
    info!(actor = "A", priority = 1, "granted");

    // Cancelled when the walk-through fails, so no waiter is left blocked
    // and the scope can join.
    let abort = CancellationToken::new();

    let (from_a, from_b, from_c) =
        thread::scope(|s| -> Result<(Handoff, Handoff, Handoff), CliError> {
            let spawn_waiter = |actor: &'static str, priority: i64| {
                let abort = &abort;
                thread::Builder::new()
                    .name(format!("scenario-{actor}"))
                    .spawn_scoped(s, move || -> Result<Handoff, ResourceError> {
                        manager.request_resource_cancellable(priority, abort)?;
                        info!(actor, priority, "resumed holding the resource");
                        manager.release_resource()
                    })
            };

            let handed_over = (|| -> Result<_, CliError> {
                let b = spawn_waiter("B", 3)?;
                await_waiting(manager, &[0, 0, 0, 1]);
                let c = spawn_waiter("C", 0)?;
                await_waiting(manager, &[1, 0, 0, 1]);
                let from_a = manager.release_resource()?;
                Ok((b, c, from_a))
            })();
            let (b, c, from_a) = match handed_over {
                Ok(started) => started,
                Err(err) => {
                    warn!(error = %err, "scenario aborted, cancelling waiters");
                    abort.cancel();
                    return Err(err);
                }
            };

            let from_b = b
                .join()
                .map_err(|_| CliError::Simulation("scenario thread B panicked".to_string()))??;
            let from_c = c
                .join()
                .map_err(|_| CliError::Simulation("scenario thread C panicked".to_string()))??;
            Ok((from_a, from_b, from_c))
        })?;

    expect_handoff("A", from_a, 3)?;
    expect_handoff("B", from_b, 0)?;
    expect_handoff("C", from_c, prm_types::NONE_WAITING)?;

    let step = |actor, action: &str, handoff: Option<Handoff>| ScenarioStep {
        actor,
        action: action.to_string(),
        handoff: handoff.map(Handoff::code),
    };
    Ok(ScenarioReport {
        levels: levels.count(),
        steps: vec![
            step("A", "request priority 1: granted immediately", None),
            step("B", "request priority 3: waiting", None),
            step("C", "request priority 0: waiting", None),
            step("A", "release", Some(from_a)),
            step("B", "resume holding the resource, then release", Some(from_b)),
            step("C", "resume holding the resource, then release", Some(from_c)),
        ],
    })
}

fn expect_handoff(actor: &str, handoff: Handoff, expected: i64) -> Result<(), CliError> {
    if handoff.code() == expected {
        Ok(())
    } else {
        Err(CliError::Simulation(format!(
            "{actor} released to {}, expected {expected}",
            handoff.code()
        )))
    }
}

/// Hammer one arbiter from several threads
///
/// Worker `n` always requests at level `n % levels`. The run fails if two
/// workers ever hold the resource at once. With a use budget, workers stop
/// once it is spent.
///
/// # Errors
///
/// Returns an error if a worker thread cannot be spawned, panics, hits an
/// arbitration error other than a timeout, or observes a second holder.
pub fn run_simulation(params: &SimulationParams) -> Result<SimulationReport, CliError> {
    let levels = params.levels;
    let manager = PriorityResourceManager::new(Arc::new(AtomicUsize::new(0)), levels);
    let manager = match params.max_uses {
        Some(max_uses) => manager.with_max_uses(max_uses),
        None => manager,
    };
    let holders = AtomicUsize::new(0);
    let max_holders = AtomicUsize::new(0);
    let tally = Mutex::new(Tally {
        grants: vec![0; levels.count()],
        handoffs: vec![0; levels.count()],
        ..Tally::default()
    });
    let started = Instant::now();

    info!(
        levels = levels.count(),
        workers = params.workers,
        rounds = params.rounds,
        "starting simulation"
    );

    thread::scope(|s| -> Result<(), CliError> {
        let mut handles = Vec::with_capacity(params.workers);
        for worker in 0..params.workers {
            let manager = &manager;
            let holders = &holders;
            let max_holders = &max_holders;
            let tally = &tally;
            let priority = worker % levels.count();

            let handle = thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn_scoped(s, move || -> Result<(), ResourceError> {
                    let raw = i64::try_from(priority).unwrap_or(0);
                    for round in 0..params.rounds {
                        let requested = match params.timeout {
                            Some(timeout) => manager.request_resource_timeout(raw, timeout),
                            None => manager.request_resource(raw),
                        };
                        match requested {
                            Ok(()) => {}
                            Err(err @ ResourceError::TimedOut { .. }) => {
                                debug!(worker, round, error = %err, "request abandoned");
                                tally.lock().timeouts += 1;
                                continue;
                            }
                            Err(ResourceError::UsesExhausted { max_uses }) => {
                                debug!(worker, round, max_uses, "use budget spent, stopping");
                                tally.lock().exhausted_workers += 1;
                                break;
                            }
                            Err(err) => return Err(err),
                        }

                        let now_holding = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        max_holders.fetch_max(now_holding, Ordering::SeqCst);
                        manager.resource().fetch_add(1, Ordering::Relaxed);
                        thread::sleep(params.hold);
                        holders.fetch_sub(1, Ordering::SeqCst);

                        let handoff = manager.release_resource()?;
                        let mut tally = tally.lock();
                        tally.grants[priority] += 1;
                        match handoff {
                            Handoff::Signaled(next) => tally.handoffs[next.index()] += 1,
                            Handoff::NoneWaiting => tally.releases_without_waiters += 1,
                        }
                    }
                    Ok(())
                })?;
            handles.push(handle);
        }

        for handle in handles {
            handle
                .join()
                .map_err(|_| CliError::Simulation("worker thread panicked".to_string()))??;
        }
        Ok(())
    })?;

    let max_concurrent_holders = max_holders.load(Ordering::SeqCst);
    if max_concurrent_holders > 1 {
        warn!(max_concurrent_holders, "mutual exclusion violated");
        return Err(CliError::Simulation(format!(
            "{max_concurrent_holders} workers held the resource at once"
        )));
    }

    let tally = tally.into_inner();
    let uses = manager.resource().load(Ordering::SeqCst);
    debug!(uses, "simulation finished");

    Ok(SimulationReport {
        levels: levels.count(),
        workers: params.workers,
        rounds: params.rounds,
        grants: tally.grants,
        handoffs: tally.handoffs,
        releases_without_waiters: tally.releases_without_waiters,
        timeouts: tally.timeouts,
        exhausted_workers: tally.exhausted_workers,
        max_concurrent_holders,
        elapsed_ms: started.elapsed().as_millis(),
    })
}
