//! Action memory: which repair strategy to try next for a class of failure.
//!
//! - [`action`] - the `RepairAction` vocabulary
//! - [`bandit`] - `ActionMemory`, Beta-posterior Thompson sampling over the
//!   persisted outcome log

pub mod action;
pub mod bandit;

pub use action::RepairAction;
pub use bandit::{ActionMemory, ActionSelection, BanditConfig, Posterior};
