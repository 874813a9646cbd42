//! The three resource controllers and the timeout monitor.
//!
//! Each controller drives one resource kind through its job-token cycle:
//! re-entrant, idempotent, and safe to re-run at any point. Controllers are
//! constructed with explicit references to the store cluster and the
//! propagation broker; there are no ambient singletons.

pub mod deploy_item;
pub mod execution;
pub mod installation;
pub mod monitor;

#[cfg(test)]
mod flow_tests;

pub use deploy_item::DeployItemController;
pub use execution::ExecutionController;
pub use installation::InstallationController;
pub use monitor::{MonitorConfig, TimeoutMonitor, TimeoutVerdict};

use crate::types::Phase;

/// Result of one reconcile invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do: no pending token, or the resource no longer exists.
    Idle,

    /// The cycle advanced but is not terminal; the worker will be re-triggered
    /// by a watch event or the resync tick.
    InProgress,

    /// The cycle completed in the given terminal phase.
    Finished(Phase),

    /// The resource (and everything it owned) was removed from the store.
    Removed,
}
