//! The set of typed stores the engine operates on, plus the `Resource`
//! registrations of the five kinds.
//!
//! Controllers receive an `Arc<Cluster>` explicitly; there are no ambient
//! singletons.

use std::sync::Arc;

use super::{Resource, ResourceStore, StoreResult};
use crate::types::{
    ContextId, DataObject, DataObjectId, DeployItem, DeployItemId, Execution, ExecutionId,
    Installation, InstallationId, Meta, Target, TargetId,
};

impl Resource for Installation {
    type Id = InstallationId;
    const KIND: &'static str = "installation";

    fn resource_id(&self) -> InstallationId {
        self.id.clone()
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

impl Resource for Execution {
    type Id = ExecutionId;
    const KIND: &'static str = "execution";

    fn resource_id(&self) -> ExecutionId {
        self.id.clone()
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

impl Resource for DeployItem {
    type Id = DeployItemId;
    const KIND: &'static str = "deploy_item";

    fn resource_id(&self) -> DeployItemId {
        self.id.clone()
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

impl Resource for DataObject {
    type Id = DataObjectId;
    const KIND: &'static str = "data_object";

    fn resource_id(&self) -> DataObjectId {
        self.id.clone()
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

impl Resource for Target {
    type Id = TargetId;
    const KIND: &'static str = "target";

    fn resource_id(&self) -> TargetId {
        self.id.clone()
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

/// The typed stores for all five resource kinds.
#[derive(Clone)]
pub struct Cluster {
    pub installations: Arc<dyn ResourceStore<Installation>>,
    pub executions: Arc<dyn ResourceStore<Execution>>,
    pub items: Arc<dyn ResourceStore<DeployItem>>,
    pub data_objects: Arc<dyn ResourceStore<DataObject>>,
    pub targets: Arc<dyn ResourceStore<Target>>,
}

impl Cluster {
    /// Returns the direct child installations of a unit.
    pub async fn children_of(&self, parent: &InstallationId) -> StoreResult<Vec<Installation>> {
        let mut children: Vec<Installation> = self
            .installations
            .list()
            .await?
            .into_iter()
            .filter(|inst| inst.parent.as_ref() == Some(parent))
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    /// Returns the execution owned by a unit, if one exists.
    pub async fn execution_of(&self, owner: &InstallationId) -> StoreResult<Option<Execution>> {
        self.executions
            .get(&ExecutionId::for_installation(owner))
            .await
    }

    /// Returns the deploy items owned by an execution.
    pub async fn items_of(&self, owner: &ExecutionId) -> StoreResult<Vec<DeployItem>> {
        let mut items: Vec<DeployItem> = self
            .items
            .list()
            .await?
            .into_iter()
            .filter(|item| &item.owner == owner)
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    /// Returns the data objects visible in a scope under the given key.
    pub async fn data_in_scope(
        &self,
        context: &Option<ContextId>,
        key: &str,
    ) -> StoreResult<Vec<DataObject>> {
        let mut objects: Vec<DataObject> = self
            .data_objects
            .list()
            .await?
            .into_iter()
            .filter(|obj| obj.labels.matches(context, key))
            .collect();
        objects.sort_by(|a, b| (&a.labels.source, &a.id).cmp(&(&b.labels.source, &b.id)));
        Ok(objects)
    }

    /// Returns the labeled targets visible in a scope under the given key,
    /// ordered by producing source for deterministic list imports.
    pub async fn targets_in_scope(
        &self,
        context: &Option<ContextId>,
        key: &str,
    ) -> StoreResult<Vec<Target>> {
        let mut targets: Vec<Target> = self
            .targets
            .list()
            .await?
            .into_iter()
            .filter(|t| t.matches(context, key))
            .collect();
        targets.sort_by(|a, b| {
            let ka = (a.labels.as_ref().map(|l| l.source.clone()), a.id.clone());
            let kb = (b.labels.as_ref().map(|l| l.source.clone()), b.id.clone());
            ka.cmp(&kb)
        });
        Ok(targets)
    }
}
