//! Shared fixtures for integration-style tests: an in-memory cluster with
//! the full orchestrator running, a scripted deployer that fulfils the
//! deployer contract deterministically, and poll/wait helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controllers::deploy_item::{claim, report_deleted, report_failed, report_succeeded};
use crate::controllers::MonitorConfig;
use crate::store::{put, update_with_retry, Cluster, RetryConfig};
use crate::types::{
    ContextId, DataLabels, DataObject, DeployItem, DeployItemId, DeployerInfo, InstallationId,
    Phase, SourceKind, SourceRef,
};
use crate::worker::{Orchestrator, WorkerConfig};

/// How long end-to-end tests wait for convergence before failing.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for wait helpers and the scripted deployer.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Cancels the engine and any deployers when the test ends.
pub struct EngineGuard {
    pub shutdown: CancellationToken,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Starts the orchestrator with fast test timings and a default monitor.
pub fn start_engine(cluster: &Cluster) -> EngineGuard {
    start_engine_with(cluster, MonitorConfig::new())
}

/// Starts the orchestrator with fast test timings and the given monitor
/// configuration.
pub fn start_engine_with(cluster: &Cluster, monitor: MonitorConfig) -> EngineGuard {
    init_tracing();
    let shutdown = CancellationToken::new();
    let worker = WorkerConfig::new().with_resync_interval(Duration::from_millis(25));
    let orchestrator = Orchestrator::with_config(cluster.clone(), worker, monitor);
    tokio::spawn(orchestrator.run(shutdown.clone()));
    EngineGuard { shutdown }
}

/// What the scripted deployer does with a claimed creation-path item.
#[derive(Debug, Clone)]
pub enum DeployBehavior {
    /// Succeed; export the JSON object found under `config.export`, if any.
    Echo,

    /// Read the data object named `import_key` in the owning installation's
    /// scope and export `prefix + value` under `export_key`.
    MapImport {
        import_key: String,
        export_key: String,
        prefix: String,
    },

    /// Fail every attempt with this message.
    Fail(String),

    /// Fail the first `n` attempts per item, then succeed like `Echo`.
    FailTimes(u32),

    /// Never claim anything. Items run into the pickup timeout.
    Ignore,

    /// Claim, then never report. Items run into the progressing timeout.
    Stall,
}

/// An in-process deployer fulfilling the external-deployer contract:
/// claim before the pickup deadline, then report a terminal outcome
/// (optionally with an export reference), or tear down on the deletion
/// path. Runs as a polling task over the item store, like a real deployer
/// watching its item type.
pub struct ScriptedDeployer {
    cluster: Cluster,
    item_type: String,
    identity: String,
    behavior: DeployBehavior,
    retry: RetryConfig,
    /// Claims performed, for asserting (non-)re-dispatch.
    pub claims: Arc<AtomicUsize>,
    /// Item names in claim order, for asserting dependency ordering.
    pub claim_log: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<HashMap<DeployItemId, u32>>>,
}

impl ScriptedDeployer {
    pub fn new(cluster: Cluster, item_type: impl Into<String>, behavior: DeployBehavior) -> Self {
        let item_type = item_type.into();
        ScriptedDeployer {
            identity: format!("scripted-{}", item_type),
            cluster,
            item_type,
            behavior,
            retry: RetryConfig::DEFAULT,
            claims: Arc::new(AtomicUsize::new(0)),
            claim_log: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        self.scan().await;
                    }
                }
            }
        })
    }

    async fn scan(&self) {
        let Ok(items) = self.cluster.items.list().await else {
            return;
        };
        for item in items {
            if item.spec.item_type == self.item_type {
                self.process(item).await;
            }
        }
    }

    async fn process(&self, item: DeployItem) {
        if !item.status.work.is_pending() {
            return;
        }

        match item.status.work.phase {
            Phase::Init | Phase::InitDelete => {
                if matches!(self.behavior, DeployBehavior::Ignore) {
                    return;
                }
                self.claim_item(&item).await;
            }
            Phase::Progressing => {
                if !self.is_claimant(&item) || matches!(self.behavior, DeployBehavior::Stall) {
                    return;
                }
                self.finish_creation(&item).await;
            }
            Phase::Deleting => {
                if !self.is_claimant(&item) || matches!(self.behavior, DeployBehavior::Stall) {
                    return;
                }
                let identity = self.identity.clone();
                let _ = update_with_retry(
                    self.cluster.items.as_ref(),
                    &item.id,
                    &self.retry,
                    |it| report_deleted(it, &identity, Utc::now()).is_ok(),
                )
                .await;
            }
            _ => {}
        }
    }

    fn is_claimant(&self, item: &DeployItem) -> bool {
        item.status
            .deployer
            .as_ref()
            .is_some_and(|d| d.identity == self.identity)
    }

    async fn claim_item(&self, item: &DeployItem) {
        let info = DeployerInfo::new(&self.identity, "scripted", "0.1.0");
        let mut claimed = false;
        let _ = update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
            claimed = claim(it, info.clone(), Utc::now()).is_ok();
            claimed
        })
        .await;

        if claimed {
            self.claims.fetch_add(1, Ordering::SeqCst);
            self.claim_log
                .lock()
                .unwrap()
                .push(item.spec.name.clone());
        }
    }

    async fn finish_creation(&self, item: &DeployItem) {
        match &self.behavior {
            DeployBehavior::Fail(message) => {
                self.report_failure(item, message.clone()).await;
            }
            DeployBehavior::FailTimes(n) => {
                let failed_so_far = {
                    let mut failures = self.failures.lock().unwrap();
                    let entry = failures.entry(item.id.clone()).or_insert(0);
                    if *entry < *n {
                        *entry += 1;
                        true
                    } else {
                        false
                    }
                };
                if failed_so_far {
                    self.report_failure(item, "scripted failure".to_string()).await;
                } else {
                    let exports = echo_exports(item);
                    self.report_success(item, exports).await;
                }
            }
            DeployBehavior::Echo => {
                let exports = echo_exports(item);
                self.report_success(item, exports).await;
            }
            DeployBehavior::MapImport {
                import_key,
                export_key,
                prefix,
            } => {
                let owner_scope = Some(ContextId::of_installation(&InstallationId::new(
                    item.owner.as_str(),
                )));
                let Ok(objects) = self.cluster.data_in_scope(&owner_scope, import_key).await
                else {
                    return;
                };
                let Some(object) = objects.into_iter().next() else {
                    // Import not published yet; try again next tick.
                    return;
                };
                let value = object.data.as_str().unwrap_or_default();
                let exports = json!({ export_key.as_str(): format!("{}{}", prefix, value) });
                self.report_success(item, Some(exports)).await;
            }
            DeployBehavior::Ignore | DeployBehavior::Stall => {}
        }
    }

    async fn report_success(&self, item: &DeployItem, exports: Option<Value>) {
        let export_ref = match exports {
            Some(payload) if payload.as_object().is_some_and(|m| !m.is_empty()) => {
                let labels = DataLabels::new(
                    &item.spec.name,
                    SourceRef::deploy_item(&item.id),
                    SourceKind::Export,
                    Some(ContextId::of_execution(&item.owner)),
                );
                let object = DataObject::labeled(labels, payload);
                match put(self.cluster.data_objects.as_ref(), &self.retry, object).await {
                    Ok(written) => Some(written.id),
                    Err(_) => None,
                }
            }
            _ => None,
        };

        let identity = self.identity.clone();
        let _ = update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
            report_succeeded(it, &identity, export_ref.clone(), Utc::now()).is_ok()
        })
        .await;
    }

    async fn report_failure(&self, item: &DeployItem, message: String) {
        let identity = self.identity.clone();
        let _ = update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
            report_failed(it, &identity, message.clone(), Utc::now()).is_ok()
        })
        .await;
    }
}

fn echo_exports(item: &DeployItem) -> Option<Value> {
    item.spec.config.get("export").cloned()
}

/// Polls until the condition holds or the timeout elapses. Returns whether
/// the condition was met.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits until the installation has finished its cycle in the given phase.
pub async fn wait_for_installation_phase(
    cluster: &Cluster,
    id: &InstallationId,
    phase: Phase,
) -> bool {
    wait_for(WAIT_TIMEOUT, || async {
        match cluster.installations.get(id).await {
            Ok(Some(inst)) => {
                inst.status.work.phase == phase && !inst.status.work.is_pending()
            }
            _ => false,
        }
    })
    .await
}

/// Waits until the installation no longer exists.
pub async fn wait_for_installation_gone(cluster: &Cluster, id: &InstallationId) -> bool {
    wait_for(WAIT_TIMEOUT, || async {
        matches!(cluster.installations.get(id).await, Ok(None))
    })
    .await
}
