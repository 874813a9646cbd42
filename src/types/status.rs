//! The status block shared by all reconciled resource kinds.
//!
//! Installations, executions and deploy items carry the same job-token and
//! error bookkeeping. Rather than duplicating getters across the three
//! status types, each embeds a [`WorkStatus`] and exposes it through
//! [`HasWorkStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ErrorRecord, MAX_ERROR_HISTORY};
use super::ids::JobId;
use super::phase::Phase;

/// Job-token, phase and error bookkeeping common to all resource kinds.
///
/// INVARIANT: `phase` is terminal only if `job_id == job_id_finished`.
/// All mutations that establish a terminal phase go through
/// [`crate::jobs::finish`], which writes both fields together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStatus {
    /// Current lifecycle phase.
    pub phase: Phase,

    /// The spec generation this status was computed from.
    pub observed_generation: u64,

    /// Token of the current working request, if any was ever issued.
    pub job_id: Option<JobId>,

    /// Token of the last fully completed request.
    pub job_id_finished: Option<JobId>,

    /// When the last request completed.
    pub job_finished_at: Option<DateTime<Utc>>,

    /// When the current token was issued. Anchors the pickup timeout.
    pub job_id_issued_at: Option<DateTime<Utc>>,

    /// Whether the current cycle was explicitly forced. A forced cycle
    /// bypasses the update-on-change-only short circuit.
    pub job_forced: bool,

    /// The most recent error of the current cycle.
    pub last_error: Option<ErrorRecord>,

    /// The first error since the current token was issued.
    pub first_error: Option<ErrorRecord>,

    /// Bounded history of recent errors, oldest dropped first.
    pub error_history: Vec<ErrorRecord>,
}

impl WorkStatus {
    pub fn new() -> Self {
        WorkStatus {
            phase: Phase::Init,
            observed_generation: 0,
            job_id: None,
            job_id_finished: None,
            job_finished_at: None,
            job_id_issued_at: None,
            job_forced: false,
            last_error: None,
            first_error: None,
            error_history: Vec::new(),
        }
    }

    /// A cycle is pending while the current token differs from the finished one.
    pub fn is_pending(&self) -> bool {
        self.job_id != self.job_id_finished
    }

    /// Returns true if the given token has been fully processed.
    pub fn is_finished(&self) -> bool {
        self.job_id.is_some() && !self.is_pending()
    }

    /// Records a failure: appends to the capped history, updates `last_error`
    /// and sets `first_error` if this is the first failure of the cycle.
    pub fn record_failure(&mut self, error: ErrorRecord) {
        if self.first_error.is_none() {
            self.first_error = Some(error.clone());
        }
        self.last_error = Some(error.clone());
        self.error_history.push(error);
        if self.error_history.len() > MAX_ERROR_HISTORY {
            let excess = self.error_history.len() - MAX_ERROR_HISTORY;
            self.error_history.drain(..excess);
        }
    }
}

impl Default for WorkStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability set giving uniform access to the shared status block.
pub trait HasWorkStatus {
    fn work(&self) -> &WorkStatus;
    fn work_mut(&mut self) -> &mut WorkStatus;
}

impl HasWorkStatus for WorkStatus {
    fn work(&self) -> &WorkStatus {
        self
    }

    fn work_mut(&mut self) -> &mut WorkStatus {
        self
    }
}
