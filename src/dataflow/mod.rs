//! The data propagation broker.
//!
//! Resolves a unit's declared imports and publishes its resolved imports
//! and produced exports as labeled data objects/targets:
//!
//! - a unit's *resolved imports* are published into its **own** scope
//!   (`Inst.<unit>`), where its children look them up;
//! - a unit's *exports* are published into the scope the unit lives in
//!   (its parent's scope, or root-visible for a root unit).
//!
//! Lookup order for each declared import: an explicit value on the spec,
//! then a sibling's export in the unit's scope, then the parent's import
//! publication in the same scope. Published objects carry deterministic
//! identities, so the next cycle supersedes (never merges) the previous
//! cycle's objects.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::store::{purge, put, Cluster, RetryConfig, StoreError, StoreResult};
use crate::types::{
    ContextId, DataLabels, DataObject, ExportDecl, ExportKind, ImportDecl, Installation,
    SourceKind, SourceRef, Target, TargetId, TargetSpec,
};

/// Errors raised while resolving imports or collecting exports.
///
/// All variants except `Store` are permanent configuration errors: they are
/// surfaced on the owning unit and never auto-retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImportError {
    /// A required import matched nothing in the unit's scope.
    #[error("import {key:?} cannot be resolved in scope {scope}")]
    Unresolved { key: String, scope: String },

    /// An explicitly referenced target does not exist.
    #[error("import {key:?} references missing target {target}")]
    TargetMissing { key: String, target: TargetId },

    /// A declared export reads a name that is not visible in the unit's scope.
    #[error("export {key:?} reads {from:?}, which is not visible in the unit's scope")]
    ExportMissing { key: String, from: String },

    /// Underlying store failure; transient.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ImportError {
    /// Permanent errors are configuration problems, reported once and never
    /// retried; transient store errors are retried by the caller.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, ImportError::Store(_))
    }
}

/// The values an import resolution produced, keyed by declared import name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedImports {
    pub data: BTreeMap<String, Value>,
    pub targets: BTreeMap<String, TargetSpec>,
    pub target_lists: BTreeMap<String, Vec<TargetSpec>>,
}

impl ResolvedImports {
    pub fn len(&self) -> usize {
        self.data.len() + self.targets.len() + self.target_lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One value to be published as a unit's export.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportPublication {
    Data { key: String, value: Value },
    Target { key: String, spec: TargetSpec },
}

/// Resolves imports and publishes labeled data objects/targets.
#[derive(Clone)]
pub struct Broker {
    cluster: Cluster,
    retry: RetryConfig,
}

impl Broker {
    pub fn new(cluster: Cluster, retry: RetryConfig) -> Self {
        Broker { cluster, retry }
    }

    /// Resolves every declared import of the unit.
    ///
    /// Deterministic for a given store state: re-resolving the same cycle
    /// with no underlying changes yields identical values. Failure to
    /// resolve any required import is permanent; an empty target-list match
    /// resolves to an empty sequence, not an error.
    pub async fn resolve_imports(
        &self,
        inst: &Installation,
    ) -> Result<ResolvedImports, ImportError> {
        let scope = &inst.context;
        let mut resolved = ResolvedImports::default();

        for decl in &inst.spec.imports {
            match decl {
                ImportDecl::Data { key, value: Some(value) } => {
                    resolved.data.insert(key.clone(), value.clone());
                }
                ImportDecl::Data { key, value: None } => {
                    let matches = self.cluster.data_in_scope(scope, key).await?;
                    let object = prefer_export(matches, |o| o.labels.source_kind)
                        .ok_or_else(|| ImportError::Unresolved {
                            key: key.clone(),
                            scope: scope_name(scope),
                        })?;
                    resolved.data.insert(key.clone(), object.data);
                }
                ImportDecl::Target { key, target: Some(id) } => {
                    let target = self.cluster.targets.get(id).await?.ok_or_else(|| {
                        ImportError::TargetMissing {
                            key: key.clone(),
                            target: id.clone(),
                        }
                    })?;
                    resolved.targets.insert(key.clone(), target.spec);
                }
                ImportDecl::Target { key, target: None } => {
                    let matches = self.cluster.targets_in_scope(scope, key).await?;
                    let target = prefer_export(matches, |t| {
                        t.labels
                            .as_ref()
                            .map(|l| l.source_kind)
                            .unwrap_or(SourceKind::Import)
                    })
                    .ok_or_else(|| ImportError::Unresolved {
                        key: key.clone(),
                        scope: scope_name(scope),
                    })?;
                    resolved.targets.insert(key.clone(), target.spec);
                }
                ImportDecl::TargetList { key, targets: Some(ids) } => {
                    let mut specs = Vec::with_capacity(ids.len());
                    for id in ids {
                        let target = self.cluster.targets.get(id).await?.ok_or_else(|| {
                            ImportError::TargetMissing {
                                key: key.clone(),
                                target: id.clone(),
                            }
                        })?;
                        specs.push(target.spec);
                    }
                    resolved.target_lists.insert(key.clone(), specs);
                }
                ImportDecl::TargetList { key, targets: None } => {
                    let matches = self.cluster.targets_in_scope(scope, key).await?;
                    let specs = matches.into_iter().map(|t| t.spec).collect();
                    resolved.target_lists.insert(key.clone(), specs);
                }
            }
        }

        Ok(resolved)
    }

    /// Publishes the unit's resolved imports into its own scope, where its
    /// children (and its execution's deployers) look them up.
    pub async fn publish_imports(
        &self,
        inst: &Installation,
        resolved: &ResolvedImports,
    ) -> StoreResult<()> {
        let scope = Some(inst.own_scope());
        let source = SourceRef::installation(&inst.id);

        for (key, value) in &resolved.data {
            let labels = DataLabels::new(key, source.clone(), SourceKind::Import, scope.clone());
            put(
                self.cluster.data_objects.as_ref(),
                &self.retry,
                DataObject::labeled(labels, value.clone()),
            )
            .await?;
        }

        for (key, spec) in &resolved.targets {
            let labels = DataLabels::new(key, source.clone(), SourceKind::Import, scope.clone());
            put(
                self.cluster.targets.as_ref(),
                &self.retry,
                Target::labeled(labels, spec.clone(), None),
            )
            .await?;
        }

        for (key, specs) in &resolved.target_lists {
            // Supersede any previous publication of this list wholesale, so
            // a shrunken list leaves no stale elements behind.
            self.purge_targets(&scope, key, &source).await?;
            for (index, spec) in specs.iter().enumerate() {
                let labels =
                    DataLabels::new(key, source.clone(), SourceKind::Import, scope.clone());
                put(
                    self.cluster.targets.as_ref(),
                    &self.retry,
                    Target::labeled(labels, spec.clone(), Some(index)),
                )
                .await?;
            }
        }

        debug!(unit = %inst.id, count = resolved.len(), "published resolved imports");
        Ok(())
    }

    /// Reads the unit's declared exports from its own scope.
    ///
    /// Valid once all children and the execution have succeeded: the values
    /// come from the execution's aggregated exports, the children's exports,
    /// or the unit's own import publications.
    pub async fn collect_exports(
        &self,
        inst: &Installation,
    ) -> Result<Vec<ExportPublication>, ImportError> {
        let scope = Some(inst.own_scope());
        let mut collected = Vec::with_capacity(inst.spec.exports.len());

        for decl in &inst.spec.exports {
            collected.push(self.collect_one_export(&scope, decl).await?);
        }

        Ok(collected)
    }

    async fn collect_one_export(
        &self,
        scope: &Option<ContextId>,
        decl: &ExportDecl,
    ) -> Result<ExportPublication, ImportError> {
        match decl.kind {
            ExportKind::Data => {
                let matches = self.cluster.data_in_scope(scope, &decl.from).await?;
                let object = prefer_export(matches, |o| o.labels.source_kind).ok_or_else(|| {
                    ImportError::ExportMissing {
                        key: decl.key.clone(),
                        from: decl.from.clone(),
                    }
                })?;
                Ok(ExportPublication::Data {
                    key: decl.key.clone(),
                    value: object.data,
                })
            }
            ExportKind::Target => {
                let matches = self.cluster.targets_in_scope(scope, &decl.from).await?;
                let target = prefer_export(matches, |t| {
                    t.labels
                        .as_ref()
                        .map(|l| l.source_kind)
                        .unwrap_or(SourceKind::Import)
                })
                .ok_or_else(|| ImportError::ExportMissing {
                    key: decl.key.clone(),
                    from: decl.from.clone(),
                })?;
                Ok(ExportPublication::Target {
                    key: decl.key.clone(),
                    spec: target.spec,
                })
            }
        }
    }

    /// Publishes the unit's exports into the scope it lives in, labeled with
    /// this unit as producer. Root units publish root-visible objects.
    pub async fn publish_exports(
        &self,
        inst: &Installation,
        exports: &[ExportPublication],
    ) -> StoreResult<()> {
        let scope = inst.context.clone();
        let source = SourceRef::installation(&inst.id);

        for publication in exports {
            match publication {
                ExportPublication::Data { key, value } => {
                    let labels =
                        DataLabels::new(key, source.clone(), SourceKind::Export, scope.clone());
                    put(
                        self.cluster.data_objects.as_ref(),
                        &self.retry,
                        DataObject::labeled(labels, value.clone()),
                    )
                    .await?;
                }
                ExportPublication::Target { key, spec } => {
                    let labels =
                        DataLabels::new(key, source.clone(), SourceKind::Export, scope.clone());
                    put(
                        self.cluster.targets.as_ref(),
                        &self.retry,
                        Target::labeled(labels, spec.clone(), None),
                    )
                    .await?;
                }
            }
        }

        debug!(unit = %inst.id, count = exports.len(), "published exports");
        Ok(())
    }

    /// Publishes an execution's aggregated item exports into the owning
    /// unit's scope, where the unit's export collection reads them.
    pub async fn publish_execution_exports(
        &self,
        scope: ContextId,
        source: SourceRef,
        entries: &BTreeMap<String, Value>,
    ) -> StoreResult<()> {
        for (key, value) in entries {
            let labels = DataLabels::new(
                key,
                source.clone(),
                SourceKind::Export,
                Some(scope.clone()),
            );
            put(
                self.cluster.data_objects.as_ref(),
                &self.retry,
                DataObject::labeled(labels, value.clone()),
            )
            .await?;
        }
        Ok(())
    }

    /// Removes everything a unit has published. Called when the unit itself
    /// is removed from the store.
    pub async fn purge_published(&self, source: &SourceRef) -> StoreResult<()> {
        let objects = self.cluster.data_objects.list().await?;
        for object in objects {
            if &object.labels.source == source {
                purge(self.cluster.data_objects.as_ref(), &self.retry, &object.id).await?;
            }
        }

        let targets = self.cluster.targets.list().await?;
        for target in targets {
            if target.labels.as_ref().map(|l| &l.source) == Some(source) {
                purge(self.cluster.targets.as_ref(), &self.retry, &target.id).await?;
            }
        }

        Ok(())
    }

    async fn purge_targets(
        &self,
        scope: &Option<ContextId>,
        key: &str,
        source: &SourceRef,
    ) -> StoreResult<()> {
        let existing = self.cluster.targets_in_scope(scope, key).await?;
        for target in existing {
            if target.labels.as_ref().map(|l| &l.source) == Some(source) {
                purge(self.cluster.targets.as_ref(), &self.retry, &target.id).await?;
            }
        }
        Ok(())
    }
}

/// Picks the preferred match: sibling exports win over parent import
/// publications. Matches arrive sorted by producing source, so the choice
/// is deterministic.
fn prefer_export<T>(matches: Vec<T>, kind_of: impl Fn(&T) -> SourceKind) -> Option<T> {
    let mut fallback = None;
    for item in matches {
        match kind_of(&item) {
            SourceKind::Export => return Some(item),
            SourceKind::Import => {
                if fallback.is_none() {
                    fallback = Some(item);
                }
            }
        }
    }
    fallback
}

fn scope_name(scope: &Option<ContextId>) -> String {
    scope
        .as_ref()
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| "(root)".to_string())
}
