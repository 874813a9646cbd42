//! The installation controller.
//!
//! On each new token: resolves the unit's imports through the broker,
//! expands the template into child units and at most one execution, triggers
//! children in dependency order as the resolver reports them ready, and —
//! once everything below is terminal — collects and publishes the declared
//! exports before finishing. Deletion cascades bottom-up: the unit is only
//! removed once every owned resource is confirmed gone.

use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

use crate::dataflow::{Broker, ImportError};
use crate::graph::{DependencyGraph, GraphNode};
use crate::jobs;
use crate::store::{purge, update_with_retry, Cluster, RetryConfig, StoreError, StoreResult};
use crate::types::{
    ErrorReason, ErrorRecord, Execution, ExecutionId, Installation, InstallationId, JobId, Phase,
    SourceRef,
};

use super::Outcome;

/// Drives installations through their job-token cycles.
#[derive(Clone)]
pub struct InstallationController {
    cluster: Cluster,
    broker: Broker,
    retry: RetryConfig,
}

impl InstallationController {
    pub fn new(cluster: Cluster, broker: Broker, retry: RetryConfig) -> Self {
        InstallationController {
            cluster,
            broker,
            retry,
        }
    }

    /// Runs one reconcile cycle step. Idempotent and re-entrant.
    #[instrument(skip(self), fields(installation = %id))]
    pub async fn reconcile(&self, id: &InstallationId) -> StoreResult<Outcome> {
        let Some(inst) = self.cluster.installations.get(id).await? else {
            return Ok(Outcome::Idle);
        };
        if !inst.status.work.is_pending() {
            return Ok(Outcome::Idle);
        }
        let Some(job) = inst.status.work.job_id.clone() else {
            return Ok(Outcome::Idle);
        };

        if inst.meta.is_deletion_requested() {
            self.reconcile_delete(inst, job).await
        } else if inst.status.work.phase == Phase::Init {
            self.reconcile_init(inst, job).await
        } else {
            self.reconcile_progress(inst, job).await
        }
    }

    async fn reconcile_delete(&self, inst: Installation, job: JobId) -> StoreResult<Outcome> {
        let children = self.cluster.children_of(&inst.id).await?;
        let execution = self.cluster.execution_of(&inst.id).await?;

        if children.is_empty() && execution.is_none() {
            // Everything owned is confirmed gone; the unit itself goes last.
            self.broker
                .purge_published(&SourceRef::installation(&inst.id))
                .await?;
            purge(self.cluster.installations.as_ref(), &self.retry, &inst.id).await?;
            info!(installation = %inst.id, "installation deleted");
            return Ok(Outcome::Removed);
        }

        let now = Utc::now();
        let forced = inst.status.work.job_forced;
        let mut failed: Option<String> = None;

        for child in &children {
            if child.status.work.phase == Phase::DeleteFailed
                && jobs::in_cycle(child, &job)
                && !child.status.work.is_pending()
            {
                failed = Some(format!("child installation {} failed to delete", child.id));
                continue;
            }
            let job = job.clone();
            update_with_retry(
                self.cluster.installations.as_ref(),
                &child.id,
                &self.retry,
                |c| {
                    if c.meta.is_deletion_requested()
                        && jobs::in_cycle(c, &job)
                        && c.status.work.phase.is_deletion()
                    {
                        return false;
                    }
                    c.meta.request_deletion(now);
                    jobs::request_delete(c, job.clone(), forced, now);
                    true
                },
            )
            .await?;
        }

        if let Some(execution) = &execution {
            if execution.status.work.phase == Phase::DeleteFailed
                && jobs::in_cycle(execution, &job)
                && !execution.status.work.is_pending()
            {
                failed = Some(format!("execution {} failed to delete", execution.id));
            } else {
                let job = job.clone();
                update_with_retry(
                    self.cluster.executions.as_ref(),
                    &execution.id,
                    &self.retry,
                    |e| {
                        if e.meta.is_deletion_requested()
                            && jobs::in_cycle(e, &job)
                            && e.status.work.phase.is_deletion()
                        {
                            return false;
                        }
                        e.meta.request_deletion(now);
                        jobs::request_delete(e, job.clone(), forced, now);
                        true
                    },
                )
                .await?;
            }
        }

        if let Some(message) = failed {
            return self
                .finish_with_error(
                    &inst.id,
                    Phase::DeleteFailed,
                    ErrorRecord::new("delete", ErrorReason::ChildFailed, message, now),
                )
                .await;
        }

        self.ensure_phase(&inst.id, Phase::Deleting).await?;
        Ok(Outcome::InProgress)
    }

    /// First pass of a fresh token: resolve imports, publish them into the
    /// unit's own scope, expand the template, and trigger the execution.
    ///
    /// The whole step is idempotent; the phase only moves to `Progressing`
    /// in the final status write, so a crash anywhere in between re-enters
    /// here and re-drives the same upserts.
    async fn reconcile_init(&self, inst: Installation, job: JobId) -> StoreResult<Outcome> {
        let now = Utc::now();
        let forced = inst.status.work.job_forced;

        let resolved = match self.broker.resolve_imports(&inst).await {
            Ok(resolved) => resolved,
            Err(ImportError::Store(err)) => return Err(err),
            Err(err) => {
                warn!(installation = %inst.id, error = %err, "unresolvable imports");
                return self
                    .finish_with_error(
                        &inst.id,
                        Phase::Failed,
                        ErrorRecord::new(
                            "resolve_imports",
                            ErrorReason::ConfigurationProblem,
                            err.to_string(),
                            now,
                        ),
                    )
                    .await;
            }
        };
        self.broker.publish_imports(&inst, &resolved).await?;

        // Validate the sibling graph before creating anything.
        if let Err(outcome) = self.sibling_graph(&inst).await? {
            return Ok(outcome);
        }

        // Expand child templates.
        let mut children = Vec::with_capacity(inst.spec.subs.len());
        for template in &inst.spec.subs {
            let child_id = inst.id.child(&template.name);
            children.push(child_id.clone());

            match self.cluster.installations.get(&child_id).await? {
                None => {
                    let child = Installation::child_of(&inst, template);
                    match self.cluster.installations.create(child).await {
                        Ok(_) => {}
                        Err(StoreError::AlreadyExists { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
                Some(_) => {
                    update_with_retry(
                        self.cluster.installations.as_ref(),
                        &child_id,
                        &self.retry,
                        |c| {
                            if c.spec == template.spec {
                                return false;
                            }
                            c.spec = template.spec.clone();
                            c.meta.generation += 1;
                            true
                        },
                    )
                    .await?;
                }
            }
        }

        // Children whose template disappeared are deleted.
        for child in self.cluster.children_of(&inst.id).await? {
            if children.contains(&child.id) {
                continue;
            }
            let job = job.clone();
            update_with_retry(
                self.cluster.installations.as_ref(),
                &child.id,
                &self.retry,
                |c| {
                    if c.meta.is_deletion_requested() && jobs::in_cycle(c, &job) {
                        return false;
                    }
                    c.meta.request_deletion(now);
                    jobs::request_delete(c, job.clone(), forced, now);
                    true
                },
            )
            .await?;
        }

        // Expand and trigger the execution; it has no sibling dependencies.
        let mut execution_ref = None;
        if let Some(exec_spec) = &inst.spec.execution {
            let exec_id = ExecutionId::for_installation(&inst.id);
            execution_ref = Some(exec_id.clone());

            match self.cluster.executions.get(&exec_id).await? {
                None => {
                    let execution =
                        Execution::for_installation(&inst.id, exec_spec.clone());
                    match self.cluster.executions.create(execution).await {
                        Ok(_) => {}
                        Err(StoreError::AlreadyExists { .. }) => {}
                        Err(err) => return Err(err),
                    }
                }
                Some(_) => {
                    update_with_retry(
                        self.cluster.executions.as_ref(),
                        &exec_id,
                        &self.retry,
                        |e| {
                            if e.spec == *exec_spec {
                                return false;
                            }
                            e.spec = exec_spec.clone();
                            e.meta.generation += 1;
                            true
                        },
                    )
                    .await?;
                }
            }

            let job = job.clone();
            update_with_retry(self.cluster.executions.as_ref(), &exec_id, &self.retry, |e| {
                if jobs::in_cycle(e, &job) {
                    return false;
                }
                jobs::request(e, job.clone(), forced, now);
                true
            })
            .await?;
        } else if let Some(execution) = self.cluster.execution_of(&inst.id).await? {
            // Template no longer has an execution; tear the old one down.
            let job = job.clone();
            update_with_retry(
                self.cluster.executions.as_ref(),
                &execution.id,
                &self.retry,
                |e| {
                    if e.meta.is_deletion_requested() && jobs::in_cycle(e, &job) {
                        return false;
                    }
                    e.meta.request_deletion(now);
                    jobs::request_delete(e, job.clone(), forced, now);
                    true
                },
            )
            .await?;
        }

        // Everything expanded: record the decomposition and enter
        // Progressing in one status write.
        let generation = inst.meta.generation;
        update_with_retry(self.cluster.installations.as_ref(), &inst.id, &self.retry, |i| {
            i.status.children = children.clone();
            i.status.execution = execution_ref.clone();
            i.status.work.phase = Phase::Progressing;
            i.status.work.observed_generation = generation;
            true
        })
        .await?;

        debug!(installation = %inst.id, children = children.len(), "expanded template");
        Ok(Outcome::InProgress)
    }

    async fn reconcile_progress(&self, inst: Installation, job: JobId) -> StoreResult<Outcome> {
        let now = Utc::now();
        let forced = inst.status.work.job_forced;

        let graph = match self.sibling_graph(&inst).await? {
            Ok(graph) => graph,
            Err(outcome) => return Ok(outcome),
        };

        // Gather the current state of the decomposition.
        let mut completed = BTreeSet::new();
        let mut failed: Option<String> = None;
        let mut all_children_terminal = true;

        for template in &inst.spec.subs {
            let child_id = inst.id.child(&template.name);
            let Some(child) = self.cluster.installations.get(&child_id).await? else {
                all_children_terminal = false;
                continue;
            };

            if jobs::finished_in(&child, &job, Phase::Succeeded) {
                completed.insert(template.name.clone());
            } else if jobs::finished_in(&child, &job, Phase::Failed) {
                failed = Some(format!("child installation {} failed", child.id));
            } else {
                all_children_terminal = false;
            }
        }

        if let Some(message) = failed {
            return self
                .finish_with_error(
                    &inst.id,
                    Phase::Failed,
                    ErrorRecord::new("aggregate", ErrorReason::ChildFailed, message, now),
                )
                .await;
        }

        // Trigger children whose producers have all succeeded.
        for name in graph.ready(&completed) {
            let child_id = inst.id.child(&name);
            let job = job.clone();
            let written = update_with_retry(
                self.cluster.installations.as_ref(),
                &child_id,
                &self.retry,
                |c| {
                    if jobs::in_cycle(c, &job) {
                        return false;
                    }
                    jobs::request(c, job.clone(), forced, now);
                    true
                },
            )
            .await?;
            if written.is_some() {
                debug!(installation = %inst.id, child = %name, "triggered child");
            }
        }

        // The execution runs alongside the children.
        let mut execution_done = true;
        if inst.spec.execution.is_some() {
            let exec_id = ExecutionId::for_installation(&inst.id);
            match self.cluster.executions.get(&exec_id).await? {
                None => execution_done = false,
                Some(execution) => {
                    if jobs::finished_in(&execution, &job, Phase::Failed) {
                        return self
                            .finish_with_error(
                                &inst.id,
                                Phase::Failed,
                                ErrorRecord::new(
                                    "aggregate",
                                    ErrorReason::ChildFailed,
                                    format!("execution {} failed", execution.id),
                                    now,
                                ),
                            )
                            .await;
                    }
                    if !jobs::in_cycle(&execution, &job) {
                        // Re-issue after a lost write.
                        let job = job.clone();
                        update_with_retry(
                            self.cluster.executions.as_ref(),
                            &exec_id,
                            &self.retry,
                            |e| {
                                if jobs::in_cycle(e, &job) {
                                    return false;
                                }
                                jobs::request(e, job.clone(), forced, now);
                                true
                            },
                        )
                        .await?;
                        execution_done = false;
                    } else if !jobs::finished_in(&execution, &job, Phase::Succeeded) {
                        execution_done = false;
                    }
                }
            }
        }

        if !(all_children_terminal
            && completed.len() == inst.spec.subs.len()
            && execution_done)
        {
            return Ok(Outcome::InProgress);
        }

        // Everything below is terminal and succeeded: collect and publish
        // this unit's declared exports, then finish.
        self.ensure_phase(&inst.id, Phase::Completing).await?;

        let exports = match self.broker.collect_exports(&inst).await {
            Ok(exports) => exports,
            Err(ImportError::Store(err)) => return Err(err),
            Err(err) => {
                return self
                    .finish_with_error(
                        &inst.id,
                        Phase::Failed,
                        ErrorRecord::new(
                            "collect_exports",
                            ErrorReason::ConfigurationProblem,
                            err.to_string(),
                            now,
                        ),
                    )
                    .await;
            }
        };
        self.broker.publish_exports(&inst, &exports).await?;

        update_with_retry(self.cluster.installations.as_ref(), &inst.id, &self.retry, |i| {
            if !i.status.work.is_pending() {
                return false;
            }
            jobs::finish(i, Phase::Succeeded);
            true
        })
        .await?;
        info!(installation = %inst.id, exports = exports.len(), "installation succeeded");
        Ok(Outcome::Finished(Phase::Succeeded))
    }

    /// Builds the sibling dependency graph from the sub-templates' declared
    /// imports and exports. Cycles and duplicate names are permanent
    /// configuration errors, reported once on this unit.
    async fn sibling_graph(
        &self,
        inst: &Installation,
    ) -> StoreResult<Result<DependencyGraph, Outcome>> {
        let now = Utc::now();
        let nodes: Vec<GraphNode> = inst
            .spec
            .subs
            .iter()
            .map(|template| {
                GraphNode::new(
                    template.name.clone(),
                    template
                        .spec
                        .imports
                        .iter()
                        .map(|import| import.key().to_string()),
                    template
                        .spec
                        .exports
                        .iter()
                        .map(|export| export.key.clone()),
                )
            })
            .collect();

        let graph = match DependencyGraph::new(&nodes) {
            Ok(graph) => graph,
            Err(err) => {
                let outcome = self
                    .finish_with_error(
                        &inst.id,
                        Phase::Failed,
                        ErrorRecord::new(
                            "validate",
                            ErrorReason::ConfigurationProblem,
                            err.to_string(),
                            now,
                        ),
                    )
                    .await?;
                return Ok(Err(outcome));
            }
        };

        if let Err(err) = graph.order() {
            warn!(installation = %inst.id, error = %err, "sibling dependency cycle");
            let outcome = self
                .finish_with_error(
                    &inst.id,
                    Phase::Failed,
                    ErrorRecord::new(
                        "validate",
                        ErrorReason::DependencyCycle,
                        err.to_string(),
                        now,
                    ),
                )
                .await?;
            return Ok(Err(outcome));
        }

        Ok(Ok(graph))
    }

    async fn finish_with_error(
        &self,
        id: &InstallationId,
        phase: Phase,
        error: ErrorRecord,
    ) -> StoreResult<Outcome> {
        update_with_retry(self.cluster.installations.as_ref(), id, &self.retry, |i| {
            if !i.status.work.is_pending() {
                return false;
            }
            i.status.work.record_failure(error.clone());
            jobs::finish(i, phase);
            true
        })
        .await?;
        Ok(Outcome::Finished(phase))
    }

    async fn ensure_phase(&self, id: &InstallationId, phase: Phase) -> StoreResult<()> {
        update_with_retry(self.cluster.installations.as_ref(), id, &self.retry, |i| {
            if i.status.work.phase == phase {
                return false;
            }
            i.status.work.phase = phase;
            true
        })
        .await?;
        Ok(())
    }
}
