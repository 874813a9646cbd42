//! The execution controller.
//!
//! Materializes the deploy item set from the execution's spec each cycle,
//! issues derived tokens in dependency order, applies the retry policy, and
//! aggregates the items' terminal phases into the execution's own result.
//! Deletion cascades: the execution only reports its own deletion complete
//! after every owned item is confirmed gone.

use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

use crate::dataflow::Broker;
use crate::graph::{DependencyGraph, GraphNode};
use crate::jobs;
use crate::store::{purge, update_with_retry, Cluster, RetryConfig, StoreError, StoreResult};
use crate::types::{
    DeployItem, DeployItemId, ErrorReason, ErrorRecord, Execution, ExecutionId, JobId, Phase,
    SourceRef,
};

use super::Outcome;

/// Drives executions through their job-token cycles.
#[derive(Clone)]
pub struct ExecutionController {
    cluster: Cluster,
    broker: Broker,
    retry: RetryConfig,
}

impl ExecutionController {
    pub fn new(cluster: Cluster, broker: Broker, retry: RetryConfig) -> Self {
        ExecutionController {
            cluster,
            broker,
            retry,
        }
    }

    /// Runs one reconcile cycle step. Idempotent and re-entrant: with no
    /// token change this is a no-op, and a pending cycle resumes from
    /// current store state.
    #[instrument(skip(self), fields(execution = %id))]
    pub async fn reconcile(&self, id: &ExecutionId) -> StoreResult<Outcome> {
        let Some(exec) = self.cluster.executions.get(id).await? else {
            return Ok(Outcome::Idle);
        };
        if !exec.status.work.is_pending() {
            return Ok(Outcome::Idle);
        }
        let Some(job) = exec.status.work.job_id.clone() else {
            return Ok(Outcome::Idle);
        };

        if exec.meta.is_deletion_requested() {
            self.reconcile_delete(exec, job).await
        } else {
            self.reconcile_apply(exec, job).await
        }
    }

    async fn reconcile_delete(&self, exec: Execution, job: JobId) -> StoreResult<Outcome> {
        let items = self.cluster.items_of(&exec.id).await?;
        if items.is_empty() {
            // Everything owned is confirmed gone; remove the execution and
            // what it published.
            self.broker
                .purge_published(&SourceRef::execution(&exec.id))
                .await?;
            purge(self.cluster.executions.as_ref(), &self.retry, &exec.id).await?;
            info!(execution = %exec.id, "execution deleted");
            return Ok(Outcome::Removed);
        }

        let now = Utc::now();
        let forced = exec.status.work.job_forced;
        let mut delete_failed: Option<DeployItemId> = None;

        for item in &items {
            let work = &item.status.work;
            if work.phase == Phase::Deleted && !work.is_pending() {
                self.broker
                    .purge_published(&SourceRef::deploy_item(&item.id))
                    .await?;
                purge(self.cluster.items.as_ref(), &self.retry, &item.id).await?;
                continue;
            }
            if work.phase == Phase::DeleteFailed && item.cycle_of(&job) && !work.is_pending() {
                delete_failed = Some(item.id.clone());
                continue;
            }
            let job = job.clone();
            update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
                if it.meta.is_deletion_requested()
                    && it.cycle_of(&job)
                    && it.status.work.phase.is_deletion()
                {
                    return false;
                }
                it.meta.request_deletion(now);
                jobs::request_delete(it, job.clone(), forced, now);
                if it.spec.skips_uninstall() {
                    // Teardown is confirmed without a deployer.
                    jobs::finish(it, Phase::Deleted);
                }
                true
            })
            .await?;
        }

        if let Some(failed_item) = delete_failed {
            return self
                .finish_with_error(
                    &exec.id,
                    Phase::DeleteFailed,
                    ErrorRecord::new(
                        "delete",
                        ErrorReason::ChildFailed,
                        format!("deploy item {} failed to delete", failed_item),
                        now,
                    ),
                )
                .await;
        }

        self.ensure_phase(&exec.id, Phase::Deleting).await?;
        Ok(Outcome::InProgress)
    }

    async fn reconcile_apply(&self, exec: Execution, job: JobId) -> StoreResult<Outcome> {
        let now = Utc::now();
        let forced = exec.status.work.job_forced;

        // Validate the template set before touching anything.
        let names: BTreeSet<&str> = exec.spec.items.iter().map(|t| t.name.as_str()).collect();
        for template in &exec.spec.items {
            for dep in &template.depends_on {
                if !names.contains(dep.as_str()) {
                    return self
                        .finish_with_error(
                            &exec.id,
                            Phase::Failed,
                            ErrorRecord::new(
                                "validate",
                                ErrorReason::ConfigurationProblem,
                                format!(
                                    "item {:?} depends on unknown item {:?}",
                                    template.name, dep
                                ),
                                now,
                            ),
                        )
                        .await;
                }
            }
        }

        let nodes: Vec<GraphNode> = exec
            .spec
            .items
            .iter()
            .map(|t| {
                GraphNode::new(
                    t.name.clone(),
                    t.depends_on.iter().cloned(),
                    [t.name.clone()],
                )
            })
            .collect();
        let graph = match DependencyGraph::new(&nodes) {
            Ok(graph) => graph,
            Err(err) => {
                return self
                    .finish_with_error(
                        &exec.id,
                        Phase::Failed,
                        ErrorRecord::new(
                            "validate",
                            ErrorReason::ConfigurationProblem,
                            err.to_string(),
                            now,
                        ),
                    )
                    .await;
            }
        };
        if let Err(err) = graph.order() {
            return self
                .finish_with_error(
                    &exec.id,
                    Phase::Failed,
                    ErrorRecord::new(
                        "validate",
                        ErrorReason::DependencyCycle,
                        err.to_string(),
                        now,
                    ),
                )
                .await;
        }

        // First pass of a fresh token: record what we are working on.
        if exec.status.work.phase == Phase::Init {
            let generation = exec.meta.generation;
            update_with_retry(self.cluster.executions.as_ref(), &exec.id, &self.retry, |e| {
                e.status.work.phase = Phase::Progressing;
                e.status.work.observed_generation = generation;
                true
            })
            .await?;
        }

        let has_orphans = self.materialize_items(&exec, &job, &names).await?;

        // Work from a fresh view after materialization.
        let items = self.cluster.items_of(&exec.id).await?;
        let by_name: BTreeMap<&str, &DeployItem> = items
            .iter()
            .map(|item| (item.spec.name.as_str(), item))
            .collect();

        let completed: BTreeSet<String> = exec
            .spec
            .items
            .iter()
            .filter(|t| {
                by_name.get(t.name.as_str()).is_some_and(|item| {
                    item.cycle_of(&job)
                        && item.status.work.is_finished()
                        && item.status.work.phase == Phase::Succeeded
                })
            })
            .map(|t| t.name.clone())
            .collect();

        self.trigger_ready(&exec, &job, forced, &graph, &completed, &by_name)
            .await?;
        self.dispatch_retries(&exec, &job, forced, &by_name).await?;

        self.aggregate(&exec, &job, has_orphans, &completed, &by_name)
            .await
    }

    /// Creates missing items, updates changed ones and requests deletion of
    /// items whose template is gone. Returns whether orphans still exist.
    async fn materialize_items(
        &self,
        exec: &Execution,
        job: &JobId,
        template_names: &BTreeSet<&str>,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let forced = exec.status.work.job_forced;
        let existing = self.cluster.items_of(&exec.id).await?;
        let existing_names: BTreeSet<&str> =
            existing.iter().map(|i| i.spec.name.as_str()).collect();

        for template in &exec.spec.items {
            if !existing_names.contains(template.name.as_str()) {
                let item = DeployItem::from_template(&exec.id, template.clone());
                match self.cluster.items.create(item).await {
                    Ok(_) => {}
                    // Concurrent pass created it already.
                    Err(StoreError::AlreadyExists { .. }) => {}
                    Err(err) => return Err(err),
                }
                continue;
            }

            let id = DeployItemId::for_template(&exec.id, &template.name);
            update_with_retry(self.cluster.items.as_ref(), &id, &self.retry, |it| {
                if it.spec == *template {
                    return false;
                }
                it.spec = template.clone();
                it.meta.generation += 1;
                true
            })
            .await?;
        }

        // Items whose template disappeared are deleted through the regular
        // deletion path so their deployers can tear down.
        let mut has_orphans = false;
        for item in &existing {
            if template_names.contains(item.spec.name.as_str()) {
                continue;
            }
            has_orphans = true;

            if item.status.work.phase == Phase::Deleted && !item.status.work.is_pending() {
                self.broker
                    .purge_published(&SourceRef::deploy_item(&item.id))
                    .await?;
                purge(self.cluster.items.as_ref(), &self.retry, &item.id).await?;
                continue;
            }
            let job = job.clone();
            update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
                if it.meta.is_deletion_requested()
                    && it.cycle_of(&job)
                    && it.status.work.phase.is_deletion()
                {
                    return false;
                }
                it.meta.request_deletion(now);
                jobs::request_delete(it, job.clone(), forced, now);
                if it.spec.skips_uninstall() {
                    jobs::finish(it, Phase::Deleted);
                }
                true
            })
            .await?;
        }

        // Keep the status references in sync with the materialized set.
        let refs: Vec<DeployItemId> = exec
            .spec
            .items
            .iter()
            .map(|t| DeployItemId::for_template(&exec.id, &t.name))
            .collect();
        update_with_retry(self.cluster.executions.as_ref(), &exec.id, &self.retry, |e| {
            if e.status.items == refs {
                return false;
            }
            e.status.items = refs.clone();
            true
        })
        .await?;

        Ok(has_orphans)
    }

    /// Issues the execution's token to every item whose prerequisites have
    /// succeeded. Unchanged already-succeeded items are re-confirmed in
    /// place when `update_on_change_only` is set and the cycle is not
    /// forced; a forced cycle takes precedence and re-dispatches.
    async fn trigger_ready(
        &self,
        exec: &Execution,
        job: &JobId,
        forced: bool,
        graph: &DependencyGraph,
        completed: &BTreeSet<String>,
        by_name: &BTreeMap<&str, &DeployItem>,
    ) -> StoreResult<()> {
        let now = Utc::now();

        for name in graph.ready(completed) {
            let Some(item) = by_name.get(name.as_str()) else {
                // Creation raced this pass; the next wake-up triggers it.
                continue;
            };
            if item.cycle_of(job) {
                continue;
            }
            let Some(template) = exec.spec.items.iter().find(|t| t.name == name) else {
                continue;
            };

            let update_on_change_only = template.update_on_change_only;
            let job = job.clone();
            update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
                if it.cycle_of(&job) {
                    return false;
                }
                let unchanged_success = it.status.work.phase == Phase::Succeeded
                    && it.status.work.is_finished()
                    && it.status.work.observed_generation == it.meta.generation;
                if update_on_change_only && !forced && unchanged_success {
                    // Short circuit: re-confirm the previous success for the
                    // new token without re-dispatching the deployer.
                    it.status.work.job_id = Some(job.clone());
                    it.status.work.job_id_finished = Some(job.clone());
                    it.status.work.job_id_issued_at = Some(now);
                    it.status.work.job_forced = false;
                } else {
                    jobs::request(it, job.clone(), forced, now);
                }
                true
            })
            .await?;
            debug!(execution = %exec.id, item = %name, "triggered item");
        }

        Ok(())
    }

    /// Re-dispatches failed items that still have retries left. The attempt
    /// number is encoded in the derived token, so a crashed and re-entered
    /// pass never double-counts.
    async fn dispatch_retries(
        &self,
        exec: &Execution,
        job: &JobId,
        forced: bool,
        by_name: &BTreeMap<&str, &DeployItem>,
    ) -> StoreResult<()> {
        let now = Utc::now();

        for template in &exec.spec.items {
            let Some(item) = by_name.get(template.name.as_str()) else {
                continue;
            };
            if !(item.cycle_of(job)
                && item.status.work.is_finished()
                && item.status.work.phase == Phase::Failed)
            {
                continue;
            }

            let attempts = item
                .status
                .work
                .job_id
                .as_ref()
                .and_then(|j| j.derivation_attempt(job))
                .unwrap_or(0);
            if attempts >= template.retries {
                continue;
            }

            let retry_job = job.derived(attempts + 1);
            warn!(
                execution = %exec.id,
                item = %template.name,
                attempt = attempts + 1,
                "re-dispatching failed item"
            );
            update_with_retry(self.cluster.items.as_ref(), &item.id, &self.retry, |it| {
                if it.status.work.job_id.as_ref() == Some(&retry_job) {
                    return false;
                }
                jobs::request(it, retry_job.clone(), forced, now);
                true
            })
            .await?;
        }

        Ok(())
    }

    /// Folds the items' terminal phases into the execution's own result.
    async fn aggregate(
        &self,
        exec: &Execution,
        job: &JobId,
        has_orphans: bool,
        completed: &BTreeSet<String>,
        by_name: &BTreeMap<&str, &DeployItem>,
    ) -> StoreResult<Outcome> {
        let now = Utc::now();

        for template in &exec.spec.items {
            let Some(item) = by_name.get(template.name.as_str()) else {
                return Ok(Outcome::InProgress);
            };
            if !(item.cycle_of(job) && item.status.work.is_finished()) {
                return Ok(Outcome::InProgress);
            }
            if item.status.work.phase == Phase::Failed {
                let attempts = item
                    .status
                    .work
                    .job_id
                    .as_ref()
                    .and_then(|j| j.derivation_attempt(job))
                    .unwrap_or(0);
                if attempts < template.retries {
                    // A retry is in flight (or about to be).
                    return Ok(Outcome::InProgress);
                }
                let detail = item
                    .status
                    .work
                    .last_error
                    .as_ref()
                    .map(|e| format!(": {}", e.message))
                    .unwrap_or_default();
                return self
                    .finish_with_error(
                        &exec.id,
                        Phase::Failed,
                        ErrorRecord::new(
                            "aggregate",
                            ErrorReason::ChildFailed,
                            format!("deploy item {:?} failed{}", template.name, detail),
                            now,
                        ),
                    )
                    .await;
            }
        }

        if completed.len() < exec.spec.items.len() || has_orphans {
            return Ok(Outcome::InProgress);
        }

        // Every item succeeded for this token: merge their export payloads
        // and publish them into the owning unit's scope.
        let mut entries: BTreeMap<String, Value> = BTreeMap::new();
        for template in &exec.spec.items {
            let Some(item) = by_name.get(template.name.as_str()) else {
                continue;
            };
            let Some(export_ref) = &item.status.export_ref else {
                continue;
            };
            if let Some(object) = self.cluster.data_objects.get(export_ref).await? {
                if let Value::Object(map) = object.data {
                    entries.extend(map);
                }
            }
        }
        self.broker
            .publish_execution_exports(
                exec.export_scope(),
                SourceRef::execution(&exec.id),
                &entries,
            )
            .await?;

        update_with_retry(self.cluster.executions.as_ref(), &exec.id, &self.retry, |e| {
            if !e.status.work.is_pending() {
                return false;
            }
            jobs::finish(e, Phase::Succeeded);
            true
        })
        .await?;
        info!(execution = %exec.id, "execution succeeded");
        Ok(Outcome::Finished(Phase::Succeeded))
    }

    async fn finish_with_error(
        &self,
        id: &ExecutionId,
        phase: Phase,
        error: ErrorRecord,
    ) -> StoreResult<Outcome> {
        update_with_retry(self.cluster.executions.as_ref(), id, &self.retry, |e| {
            if !e.status.work.is_pending() {
                return false;
            }
            e.status.work.record_failure(error.clone());
            jobs::finish(e, phase);
            true
        })
        .await?;
        Ok(Outcome::Finished(phase))
    }

    async fn ensure_phase(&self, id: &ExecutionId, phase: Phase) -> StoreResult<()> {
        update_with_retry(self.cluster.executions.as_ref(), id, &self.retry, |e| {
            if e.status.work.phase == phase {
                return false;
            }
            e.status.work.phase = phase;
            true
        })
        .await?;
        Ok(())
    }
}
