//! The watch-driven reconcile loops.
//!
//! One loop per resource kind processes reconcile requests serially per
//! identity. Loops are fed by the stores' watch streams (with owner
//! fan-out: an item event wakes its owning execution, an execution event
//! its owning installation) plus a periodic resync tick that re-enqueues
//! every resource with pending work. The resync is the correctness
//! backstop; the watch stream is only the fast path, so lost or coalesced
//! events merely delay a cycle by at most one tick.
//!
//! [`Orchestrator`] wires the controllers, the monitor and the loops
//! together from an explicit [`Cluster`] reference.

pub mod queue;

use async_trait::async_trait;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, trace};

use crate::controllers::{
    DeployItemController, ExecutionController, InstallationController, MonitorConfig,
    TimeoutMonitor,
};
use crate::dataflow::Broker;
use crate::jobs;
use crate::store::{Cluster, RetryConfig, StoreEvent};
use crate::types::{DeployItemId, ExecutionId, InstallationId};

pub use queue::WorkQueue;

/// Default interval for the pending-work resync tick (2 seconds).
const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 2;

/// Capacity of each loop's request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the reconcile loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval of the resync tick that re-enqueues pending resources.
    /// This bounds the requeue delay after any missed event.
    pub resync_interval: Duration,
}

impl WorkerConfig {
    pub fn new() -> Self {
        WorkerConfig {
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
        }
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One reconcile loop's view of its controller.
#[async_trait]
trait ReconcileTarget: Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Ord + Display + Send + Sync + 'static;

    const NAME: &'static str;

    /// Runs one reconcile step; errors are logged, the resync retries.
    async fn reconcile(&self, id: &Self::Id);

    /// Identities with pending work, re-enqueued on every resync tick.
    async fn pending_ids(&self) -> Vec<Self::Id>;
}

struct InstallationTarget {
    cluster: Cluster,
    controller: InstallationController,
}

#[async_trait]
impl ReconcileTarget for InstallationTarget {
    type Id = InstallationId;
    const NAME: &'static str = "installations";

    async fn reconcile(&self, id: &InstallationId) {
        if let Err(e) = self.controller.reconcile(id).await {
            error!(installation = %id, error = %e, "reconcile failed");
        }
    }

    async fn pending_ids(&self) -> Vec<InstallationId> {
        match self.cluster.installations.list().await {
            Ok(installations) => installations
                .into_iter()
                .filter(|inst| jobs::is_pending(inst))
                .map(|inst| inst.id)
                .collect(),
            Err(e) => {
                error!(error = %e, "resync list failed");
                Vec::new()
            }
        }
    }
}

struct ExecutionTarget {
    cluster: Cluster,
    controller: ExecutionController,
}

#[async_trait]
impl ReconcileTarget for ExecutionTarget {
    type Id = ExecutionId;
    const NAME: &'static str = "executions";

    async fn reconcile(&self, id: &ExecutionId) {
        if let Err(e) = self.controller.reconcile(id).await {
            error!(execution = %id, error = %e, "reconcile failed");
        }
    }

    async fn pending_ids(&self) -> Vec<ExecutionId> {
        match self.cluster.executions.list().await {
            Ok(executions) => executions
                .into_iter()
                .filter(|exec| jobs::is_pending(exec))
                .map(|exec| exec.id)
                .collect(),
            Err(e) => {
                error!(error = %e, "resync list failed");
                Vec::new()
            }
        }
    }
}

struct DeployItemTarget {
    cluster: Cluster,
    controller: DeployItemController,
}

#[async_trait]
impl ReconcileTarget for DeployItemTarget {
    type Id = DeployItemId;
    const NAME: &'static str = "deploy_items";

    async fn reconcile(&self, id: &DeployItemId) {
        if let Err(e) = self.controller.reconcile(id).await {
            error!(item = %id, error = %e, "reconcile failed");
        }
    }

    async fn pending_ids(&self) -> Vec<DeployItemId> {
        match self.cluster.items.list().await {
            Ok(items) => items
                .into_iter()
                .filter(|item| item.status.work.is_pending())
                .map(|item| item.id)
                .collect(),
            Err(e) => {
                error!(error = %e, "resync list failed");
                Vec::new()
            }
        }
    }
}

/// Wires controllers, monitor and loops together over one cluster.
pub struct Orchestrator {
    cluster: Cluster,
    installations: InstallationController,
    executions: ExecutionController,
    items: DeployItemController,
    monitor_config: MonitorConfig,
    worker_config: WorkerConfig,
}

impl Orchestrator {
    /// Builds an orchestrator with default configuration.
    pub fn new(cluster: Cluster) -> Self {
        Self::with_config(cluster, WorkerConfig::new(), MonitorConfig::new())
    }

    /// Builds an orchestrator with explicit worker and monitor configuration.
    pub fn with_config(
        cluster: Cluster,
        worker_config: WorkerConfig,
        monitor_config: MonitorConfig,
    ) -> Self {
        let retry = RetryConfig::DEFAULT;
        let broker = Broker::new(cluster.clone(), retry);
        Orchestrator {
            installations: InstallationController::new(cluster.clone(), broker.clone(), retry),
            executions: ExecutionController::new(cluster.clone(), broker, retry),
            items: DeployItemController::new(cluster.clone(), monitor_config.clone(), retry),
            cluster,
            monitor_config,
            worker_config,
        }
    }

    /// Runs all loops until the token is cancelled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("orchestrator started");

        let (inst_tx, inst_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (exec_tx, exec_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (item_tx, item_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Fast-path wake-ups from the watch streams.
        tasks.push(tokio::spawn(forward(
            self.cluster.installations.watch(),
            inst_tx.clone(),
            shutdown.clone(),
            |event| Some(event.id().clone()),
        )));
        // An execution reuses its owner's identity string, so execution
        // events map to the owning installation without a store read.
        tasks.push(tokio::spawn(forward(
            self.cluster.executions.watch(),
            inst_tx.clone(),
            shutdown.clone(),
            |event| Some(InstallationId::new(event.id().as_str())),
        )));
        tasks.push(tokio::spawn(forward(
            self.cluster.executions.watch(),
            exec_tx.clone(),
            shutdown.clone(),
            |event| Some(event.id().clone()),
        )));
        tasks.push(tokio::spawn(forward(
            self.cluster.items.watch(),
            item_tx.clone(),
            shutdown.clone(),
            |event| Some(event.id().clone()),
        )));
        tasks.push(tokio::spawn(forward_item_owners(
            self.cluster.clone(),
            exec_tx.clone(),
            shutdown.clone(),
        )));

        // The reconcile loops.
        tasks.push(tokio::spawn(run_loop(
            Arc::new(InstallationTarget {
                cluster: self.cluster.clone(),
                controller: self.installations,
            }),
            inst_rx,
            self.worker_config.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_loop(
            Arc::new(ExecutionTarget {
                cluster: self.cluster.clone(),
                controller: self.executions.clone(),
            }),
            exec_rx,
            self.worker_config.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_loop(
            Arc::new(DeployItemTarget {
                cluster: self.cluster.clone(),
                controller: self.items.clone(),
            }),
            item_rx,
            self.worker_config.clone(),
            shutdown.clone(),
        )));

        // Deployer staleness scanning.
        let monitor = TimeoutMonitor::new(
            self.cluster.clone(),
            self.items,
            self.monitor_config,
        );
        tasks.push(tokio::spawn(monitor.run(shutdown.clone())));

        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }
}

/// Forwards mapped watch events into a loop's request channel. A lagged
/// receiver just continues; the resync tick covers anything dropped.
async fn forward<IdIn, IdOut, F>(
    mut watch: broadcast::Receiver<StoreEvent<IdIn>>,
    tx: mpsc::Sender<IdOut>,
    shutdown: CancellationToken,
    map: F,
) where
    IdIn: Clone + Send + 'static,
    IdOut: Send + 'static,
    F: Fn(&StoreEvent<IdIn>) -> Option<IdOut> + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = watch.recv() => match result {
                Ok(event) => {
                    if let Some(id) = map(&event) {
                        if tx.send(id).await.is_err() {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "watch receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// Maps deploy item events to their owning executions. Created/updated
/// items are resolved by a store read; a deleted item is gone, so every
/// pending execution is woken instead (deletion is exactly the state the
/// owner is waiting to observe).
async fn forward_item_owners(
    cluster: Cluster,
    tx: mpsc::Sender<ExecutionId>,
    shutdown: CancellationToken,
) {
    let mut watch = cluster.items.watch();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = watch.recv() => match result {
                Ok(StoreEvent::Created(id)) | Ok(StoreEvent::Updated(id)) => {
                    if let Ok(Some(item)) = cluster.items.get(&id).await {
                        if tx.send(item.owner).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(StoreEvent::Deleted(_)) => {
                    if let Ok(executions) = cluster.executions.list().await {
                        for execution in executions {
                            if jobs::is_pending(&execution)
                                && tx.send(execution.id).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "item watch receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

/// One reconcile loop: drains its dedupe queue serially, fed by the request
/// channel and the resync tick.
async fn run_loop<T: ReconcileTarget>(
    target: Arc<T>,
    mut rx: mpsc::Receiver<T::Id>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    info!(loop_name = T::NAME, "reconcile loop started");
    let mut queue: WorkQueue<T::Id> = WorkQueue::new();
    let mut ticker = tokio::time::interval(config.resync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(loop_name = T::NAME, "reconcile loop stopped");
                return;
            }
            maybe = rx.recv() => match maybe {
                Some(id) => {
                    queue.push(id);
                }
                None => {
                    info!(loop_name = T::NAME, "request channel closed");
                    return;
                }
            },
            _ = ticker.tick() => {
                for id in target.pending_ids().await {
                    queue.push(id);
                }
            }
        }

        while let Some(id) = queue.pop() {
            trace!(loop_name = T::NAME, id = %id, "reconciling");
            target.reconcile(&id).await;
        }
    }
}
