//! Structured error records surfaced on resource status.
//!
//! Failures are always attached to the specific resource instance rather
//! than only logged: the newest error is kept in `last_error`, the first
//! error of the current cycle in `first_error`, and a bounded history drops
//! the oldest entries first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of entries kept in a resource's error history.
pub const MAX_ERROR_HISTORY: usize = 5;

/// Classification of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// Unresolvable or invalid configuration (bad template, unresolved
    /// import). Permanent; never auto-retried.
    ConfigurationProblem,

    /// The declared dependencies of sibling units form a cycle. Permanent.
    DependencyCycle,

    /// No deployer claimed the item before the pickup deadline.
    PickupTimeout,

    /// The claiming deployer did not report a terminal outcome in time.
    ProgressingTimeout,

    /// Opaque failure reported by a deployer, passed through unchanged.
    DeployerFailure,

    /// A child resource finished in a failure phase.
    ChildFailed,

    /// Unexpected internal condition.
    Internal,
}

impl ErrorReason {
    /// Permanent errors are not retried by any automatic policy.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorReason::ConfigurationProblem | ErrorReason::DependencyCycle
        )
    }
}

/// One structured failure, attached to a resource's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The operation during which the error occurred (e.g. "resolve_imports").
    pub operation: String,

    /// Machine-readable classification.
    pub reason: ErrorReason,

    /// Human-readable message.
    pub message: String,

    /// When the error was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        operation: impl Into<String>,
        reason: ErrorReason,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        ErrorRecord {
            operation: operation.into(),
            reason,
            message: message.into(),
            occurred_at,
        }
    }
}
