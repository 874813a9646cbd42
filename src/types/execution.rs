//! Execution units: the flat set of deploy items for one deployment unit.

use serde::{Deserialize, Serialize};

use super::deploy_item::DeployItemSpec;
use super::ids::{ContextId, DeployItemId, ExecutionId, InstallationId};
use super::meta::Meta;
use super::status::{HasWorkStatus, WorkStatus};

/// Specification of an execution: the deploy item templates to materialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionSpec {
    pub items: Vec<DeployItemSpec>,
}

impl ExecutionSpec {
    pub fn new(items: Vec<DeployItemSpec>) -> Self {
        ExecutionSpec { items }
    }
}

/// Status of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutionStatus {
    /// Shared phase/job-token/error block.
    #[serde(flatten)]
    pub work: WorkStatus,

    /// References to the materialized items. Retry attempts are encoded in
    /// the items' derived tokens, so no separate attempt counter is kept.
    #[serde(default)]
    pub items: Vec<DeployItemId>,
}

/// The flat set of atomic work items belonging to one deployment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub meta: Meta,

    /// The installation that owns this execution.
    pub owner: InstallationId,

    pub spec: ExecutionSpec,
    pub status: ExecutionStatus,
}

impl Execution {
    /// Creates the execution owned by the given installation.
    pub fn for_installation(owner: &InstallationId, spec: ExecutionSpec) -> Self {
        Execution {
            id: ExecutionId::for_installation(owner),
            meta: Meta::new(),
            owner: owner.clone(),
            spec,
            status: ExecutionStatus::default(),
        }
    }

    /// The scope into which this execution publishes its aggregated exports:
    /// the owning installation's own scope.
    pub fn export_scope(&self) -> ContextId {
        ContextId::of_installation(&self.owner)
    }
}

impl HasWorkStatus for Execution {
    fn work(&self) -> &WorkStatus {
        &self.status.work
    }

    fn work_mut(&mut self) -> &mut WorkStatus {
        &mut self.status.work
    }
}
