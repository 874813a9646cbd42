//! Deployer liveness monitoring.
//!
//! Watch events only arrive when somebody writes; a deployer that died
//! writes nothing. The monitor periodically scans all deploy items for
//! pickup and progressing staleness and hands the verdicts to the
//! [`DeployItemController`](super::DeployItemController) to apply.
//!
//! # Deadlines
//!
//! - **Pickup**: from token issue until a deployer claims the item
//!   (`Init`/`InitDelete`). Default 5 minutes.
//! - **Progressing**: from the deployer's last progress report until a
//!   terminal report (`Progressing`/`Completing`/`Deleting`). Per-item
//!   configurable; `"none"` disables it; default ten minutes.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::store::{Cluster, StoreResult};
use crate::types::{DeployItem, ErrorReason, ErrorRecord};

use super::deploy_item::DeployItemController;

/// Default interval between staleness scans (30 seconds).
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;

/// Default deadline for a deployer to claim an item (5 minutes).
const DEFAULT_PICKUP_TIMEOUT_SECS: u64 = 300;

/// Default deadline for a claiming deployer to report a terminal outcome
/// (ten minutes), applied when an item does not specify its own.
const DEFAULT_PROGRESSING_TIMEOUT_SECS: u64 = 600;

/// Configuration for the timeout monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between scans over all deploy items.
    pub scan_interval: Duration,

    /// Deadline for a deployer to claim an eligible item.
    pub pickup_timeout: Duration,

    /// Default progressing deadline for items that do not specify one.
    pub default_progressing_timeout: Duration,
}

impl MonitorConfig {
    pub fn new() -> Self {
        MonitorConfig {
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            pickup_timeout: Duration::from_secs(DEFAULT_PICKUP_TIMEOUT_SECS),
            default_progressing_timeout: Duration::from_secs(DEFAULT_PROGRESSING_TIMEOUT_SECS),
        }
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_pickup_timeout(mut self, timeout: Duration) -> Self {
        self.pickup_timeout = timeout;
        self
    }

    pub fn with_default_progressing_timeout(mut self, timeout: Duration) -> Self {
        self.default_progressing_timeout = timeout;
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A staleness finding for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// No deployer claimed the item before the pickup deadline.
    Pickup,

    /// The claiming deployer went silent past the progressing deadline.
    Progressing,
}

impl TimeoutVerdict {
    /// Builds the structured error this verdict surfaces on the item.
    pub fn to_error(self, now: DateTime<Utc>) -> ErrorRecord {
        match self {
            TimeoutVerdict::Pickup => ErrorRecord::new(
                "pickup",
                ErrorReason::PickupTimeout,
                "no deployer claimed the item before the pickup deadline",
                now,
            ),
            TimeoutVerdict::Progressing => ErrorRecord::new(
                "progressing",
                ErrorReason::ProgressingTimeout,
                "deployer did not report a terminal outcome before the deadline",
                now,
            ),
        }
    }
}

/// Checks one item against both deadlines. Pure; the caller applies the
/// verdict through the store.
pub fn check_item(
    item: &DeployItem,
    now: DateTime<Utc>,
    config: &MonitorConfig,
) -> Option<TimeoutVerdict> {
    let work = &item.status.work;
    if !work.is_pending() {
        return None;
    }
    let issued_at = work.job_id_issued_at?;

    if work.phase.awaits_pickup() {
        if elapsed(issued_at, now) > config.pickup_timeout {
            return Some(TimeoutVerdict::Pickup);
        }
        return None;
    }

    if work.phase.in_progress() {
        let timeout = item
            .spec
            .timeout
            .resolve(config.default_progressing_timeout)?;
        let anchor = item.status.last_progress_at.unwrap_or(issued_at);
        if elapsed(anchor, now) > timeout {
            return Some(TimeoutVerdict::Progressing);
        }
    }

    None
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// The periodic scan loop.
pub struct TimeoutMonitor {
    cluster: Cluster,
    controller: DeployItemController,
    config: MonitorConfig,
}

impl TimeoutMonitor {
    pub fn new(cluster: Cluster, controller: DeployItemController, config: MonitorConfig) -> Self {
        TimeoutMonitor {
            cluster,
            controller,
            config,
        }
    }

    /// Scans all items once, applying verdicts via the item controller.
    /// Returns the number of items it touched.
    pub async fn scan_once(&self) -> StoreResult<usize> {
        let now = Utc::now();
        let mut touched = 0;

        for item in self.cluster.items.list().await? {
            if check_item(&item, now, &self.config).is_some() {
                self.controller.reconcile(&item.id).await?;
                touched += 1;
            }
        }

        if touched > 0 {
            debug!(touched, "timeout scan applied verdicts");
        }
        Ok(touched)
    }

    /// Runs the scan loop until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.config.scan_interval, "timeout monitor started");
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("timeout monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "timeout scan failed");
                    }
                }
            }
        }
    }
}
