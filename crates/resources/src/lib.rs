#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Priority-aware mutual exclusion for prm
//!
//! This crate arbitrates exclusive use of one shared resource among
//! competing threads. Each request carries a priority level, and whenever
//! the resource is released the most urgent waiter is handed it next.

pub mod cancel;
pub mod counter;
pub mod guard;
pub mod manager;

pub use cancel::CancellationToken;
pub use counter::WaitingCounter;
pub use guard::ResourceGuard;
pub use manager::{ManagerSnapshot, PriorityResourceManager};
