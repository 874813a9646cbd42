//! The deploy item phase machine.
//!
//! The engine issues tokens and enforces deadlines; an external deployer
//! performs the actual work. This module provides both sides:
//!
//! - the deployer contract ([`claim`], [`report_progress`],
//!   [`report_succeeded`], [`report_failed`], [`report_deleted`]): pure
//!   transition functions a deployer applies to an item before writing it
//!   back, enforcing claim exclusivity and phase monotonicity;
//! - the engine-side [`DeployItemController`], which applies the timeout
//!   monitor's verdicts and re-confirms the invariants on every wake-up.
//!
//! Once a deployer has claimed an item for the current token, only that
//! deployer advances the phase until the cycle completes or a timeout
//! forces failure.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::jobs;
use crate::store::{update_with_retry, Cluster, RetryConfig, StoreResult};
use crate::types::{
    DataObjectId, DeployItem, DeployItemId, DeployerInfo, ErrorReason, ErrorRecord, Phase,
};

use super::monitor::{check_item, MonitorConfig};
use super::Outcome;

/// Errors raised by invalid deployer-side transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The item has no pending cycle; there is nothing to work on.
    #[error("item {0} has no pending cycle")]
    NotPending(DeployItemId),

    /// Another deployer already claimed the item for this cycle.
    #[error("item {item} is already claimed by {claimed_by:?}")]
    AlreadyClaimed {
        item: DeployItemId,
        claimed_by: String,
    },

    /// The reporting deployer is not the claimant.
    #[error("deployer {identity:?} is not the claimant of item {item}")]
    NotClaimant {
        item: DeployItemId,
        identity: String,
    },

    /// The operation is not valid in the item's current phase.
    #[error("item {item} is in phase {phase}, cannot {operation}")]
    WrongPhase {
        item: DeployItemId,
        phase: Phase,
        operation: &'static str,
    },
}

/// Claims a pending item: records the deployer's identity and moves the
/// phase to `Progressing` (or `Deleting` on the deletion path).
///
/// Must happen before the pickup timeout elapses, or the monitor force-fails
/// the item regardless of any later deployer action.
pub fn claim(
    item: &mut DeployItem,
    deployer: DeployerInfo,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    if !item.status.work.is_pending() {
        return Err(TransitionError::NotPending(item.id.clone()));
    }
    if !item.status.work.phase.awaits_pickup() {
        match &item.status.deployer {
            Some(existing) if existing.identity != deployer.identity => {
                return Err(TransitionError::AlreadyClaimed {
                    item: item.id.clone(),
                    claimed_by: existing.identity.clone(),
                })
            }
            _ => {
                return Err(TransitionError::WrongPhase {
                    item: item.id.clone(),
                    phase: item.status.work.phase,
                    operation: "claim",
                })
            }
        }
    }

    item.status.work.phase = if item.status.work.phase.is_deletion() {
        Phase::Deleting
    } else {
        Phase::Progressing
    };
    item.status.deployer = Some(deployer);
    item.status.last_progress_at = Some(now);
    Ok(())
}

/// Refreshes the progressing deadline and optionally the provider status.
pub fn report_progress(
    item: &mut DeployItem,
    identity: &str,
    provider_status: Option<Value>,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    verify_claimant(item, identity)?;
    require_in_progress(item, "report progress")?;

    item.status.last_progress_at = Some(now);
    if let Some(status) = provider_status {
        item.status.provider_status = Some(status);
    }
    Ok(())
}

/// Moves a claimed creation-path item into `Completing` before the final
/// report.
pub fn start_completing(
    item: &mut DeployItem,
    identity: &str,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    verify_claimant(item, identity)?;
    if item.status.work.phase != Phase::Progressing {
        return Err(TransitionError::WrongPhase {
            item: item.id.clone(),
            phase: item.status.work.phase,
            operation: "start completing",
        });
    }

    item.status.work.phase = Phase::Completing;
    item.status.last_progress_at = Some(now);
    Ok(())
}

/// Reports a successful creation/update cycle, optionally referencing the
/// data object holding exported values.
pub fn report_succeeded(
    item: &mut DeployItem,
    identity: &str,
    export_ref: Option<DataObjectId>,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    verify_claimant(item, identity)?;
    if !matches!(
        item.status.work.phase,
        Phase::Progressing | Phase::Completing
    ) {
        return Err(TransitionError::WrongPhase {
            item: item.id.clone(),
            phase: item.status.work.phase,
            operation: "report success",
        });
    }

    item.status.export_ref = export_ref;
    item.status.last_progress_at = Some(now);
    item.status.work.observed_generation = item.meta.generation;
    jobs::finish(item, Phase::Succeeded);
    Ok(())
}

/// Reports a failed cycle. The deployer's error payload is passed through
/// unchanged into the item's error record.
pub fn report_failed(
    item: &mut DeployItem,
    identity: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    verify_claimant(item, identity)?;
    require_in_progress(item, "report failure")?;

    let phase = if item.status.work.phase.is_deletion() {
        Phase::DeleteFailed
    } else {
        Phase::Failed
    };
    item.status.work.record_failure(ErrorRecord::new(
        "deploy",
        ErrorReason::DeployerFailure,
        message,
        now,
    ));
    jobs::finish(item, phase);
    Ok(())
}

/// Reports completed teardown on the deletion path. The owning execution
/// removes the item from the store on observing this.
pub fn report_deleted(
    item: &mut DeployItem,
    identity: &str,
    now: DateTime<Utc>,
) -> Result<(), TransitionError> {
    verify_claimant(item, identity)?;
    if item.status.work.phase != Phase::Deleting {
        return Err(TransitionError::WrongPhase {
            item: item.id.clone(),
            phase: item.status.work.phase,
            operation: "report deleted",
        });
    }

    item.status.last_progress_at = Some(now);
    jobs::finish(item, Phase::Deleted);
    Ok(())
}

fn verify_claimant(item: &DeployItem, identity: &str) -> Result<(), TransitionError> {
    if !item.status.work.is_pending() {
        return Err(TransitionError::NotPending(item.id.clone()));
    }
    match &item.status.deployer {
        Some(info) if info.identity == identity => Ok(()),
        Some(info) => Err(TransitionError::NotClaimant {
            item: item.id.clone(),
            identity: info.identity.clone(),
        }),
        None => Err(TransitionError::WrongPhase {
            item: item.id.clone(),
            phase: item.status.work.phase,
            operation: "report before claim",
        }),
    }
}

fn require_in_progress(item: &DeployItem, operation: &'static str) -> Result<(), TransitionError> {
    if item.status.work.phase.in_progress() {
        Ok(())
    } else {
        Err(TransitionError::WrongPhase {
            item: item.id.clone(),
            phase: item.status.work.phase,
            operation,
        })
    }
}

/// Engine-side controller: applies the timeout monitor's verdicts against
/// the store.
#[derive(Clone)]
pub struct DeployItemController {
    cluster: Cluster,
    monitor: MonitorConfig,
    retry: RetryConfig,
}

impl DeployItemController {
    pub fn new(cluster: Cluster, monitor: MonitorConfig, retry: RetryConfig) -> Self {
        DeployItemController {
            cluster,
            monitor,
            retry,
        }
    }

    /// Checks the item against the two deadlines and force-fails it if one
    /// has elapsed. The verdict is re-evaluated inside the write loop, so a
    /// deployer report racing the verdict wins or loses atomically on the
    /// item's version.
    #[instrument(skip(self), fields(item = %id))]
    pub async fn reconcile(&self, id: &DeployItemId) -> StoreResult<Outcome> {
        let Some(item) = self.cluster.items.get(id).await? else {
            return Ok(Outcome::Idle);
        };
        if !item.status.work.is_pending() {
            return Ok(Outcome::Idle);
        }

        let now = Utc::now();
        let Some(verdict) = check_item(&item, now, &self.monitor) else {
            return Ok(Outcome::InProgress);
        };

        let monitor = self.monitor.clone();
        let mut forced_phase = None;
        update_with_retry(self.cluster.items.as_ref(), id, &self.retry, |item| {
            // The item may have advanced since the scan; only a still-valid
            // verdict is applied.
            let Some(verdict) = check_item(item, now, &monitor) else {
                return false;
            };

            let phase = if item.status.work.phase.is_deletion() {
                Phase::DeleteFailed
            } else {
                Phase::Failed
            };
            item.status
                .work
                .record_failure(verdict.to_error(now));
            jobs::finish(item, phase);
            forced_phase = Some(phase);
            true
        })
        .await?;

        match forced_phase {
            Some(phase) => {
                warn!(item = %id, verdict = ?verdict, phase = %phase, "force-failed timed-out item");
                Ok(Outcome::Finished(phase))
            }
            None => {
                debug!(item = %id, "timeout verdict no longer applies");
                Ok(Outcome::InProgress)
            }
        }
    }
}
