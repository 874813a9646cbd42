//! Installations: possibly nested deployment units.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::execution::ExecutionSpec;
use super::ids::{ContextId, ExecutionId, InstallationId, TargetId};
use super::meta::Meta;
use super::status::{HasWorkStatus, WorkStatus};

/// A declared import requirement of an installation.
///
/// Resolution order for each kind: an explicit value/reference on the spec,
/// then a sibling's matching export in the unit's context, then the parent's
/// corresponding import publication in the same context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImportDecl {
    /// A named structured value.
    Data {
        key: String,
        /// Explicit value on the request; takes precedence over context lookup.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },

    /// A named environment reference.
    Target {
        key: String,
        /// Explicit reference on the request; takes precedence over context lookup.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<TargetId>,
    },

    /// A named, list-typed set of environment references. An empty match set
    /// resolves to an empty sequence, not an error.
    TargetList {
        key: String,
        /// Explicit references on the request; take precedence over context lookup.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        targets: Option<Vec<TargetId>>,
    },
}

impl ImportDecl {
    pub fn data(key: impl Into<String>) -> Self {
        ImportDecl::Data {
            key: key.into(),
            value: None,
        }
    }

    pub fn data_value(key: impl Into<String>, value: Value) -> Self {
        ImportDecl::Data {
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn target(key: impl Into<String>) -> Self {
        ImportDecl::Target {
            key: key.into(),
            target: None,
        }
    }

    pub fn target_ref(key: impl Into<String>, target: TargetId) -> Self {
        ImportDecl::Target {
            key: key.into(),
            target: Some(target),
        }
    }

    pub fn target_list(key: impl Into<String>) -> Self {
        ImportDecl::TargetList {
            key: key.into(),
            targets: None,
        }
    }

    pub fn target_list_refs(key: impl Into<String>, targets: Vec<TargetId>) -> Self {
        ImportDecl::TargetList {
            key: key.into(),
            targets: Some(targets),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ImportDecl::Data { key, .. }
            | ImportDecl::Target { key, .. }
            | ImportDecl::TargetList { key, .. } => key,
        }
    }
}

/// Kind of a declared export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    Data,
    Target,
}

/// A declared export of an installation.
///
/// `from` names an output visible in the unit's own scope once all children
/// and the execution have succeeded: an aggregated execution export, a child
/// export, or one of the unit's own resolved imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDecl {
    /// The key under which the value is published into the unit's context.
    pub key: String,

    pub kind: ExportKind,

    /// The name to read from the unit's own scope.
    pub from: String,
}

impl ExportDecl {
    pub fn data(key: impl Into<String>, from: impl Into<String>) -> Self {
        ExportDecl {
            key: key.into(),
            kind: ExportKind::Data,
            from: from.into(),
        }
    }

    pub fn target(key: impl Into<String>, from: impl Into<String>) -> Self {
        ExportDecl {
            key: key.into(),
            kind: ExportKind::Target,
            from: from.into(),
        }
    }
}

/// Template for one sub-installation, expanded into a child unit each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubInstallationTemplate {
    /// Name of the child, unique among siblings. The child's identity is
    /// `<parent>/<name>`.
    pub name: String,

    /// The full spec the child is created with.
    pub spec: InstallationSpec,
}

impl SubInstallationTemplate {
    pub fn new(name: impl Into<String>, spec: InstallationSpec) -> Self {
        SubInstallationTemplate {
            name: name.into(),
            spec,
        }
    }
}

/// Specification of a deployment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstallationSpec {
    /// Declared import requirements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportDecl>,

    /// Declared exports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<ExportDecl>,

    /// Sub-deployment templates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<SubInstallationTemplate>,

    /// At most one execution unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSpec>,
}

impl InstallationSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_imports(mut self, imports: Vec<ImportDecl>) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_exports(mut self, exports: Vec<ExportDecl>) -> Self {
        self.exports = exports;
        self
    }

    pub fn with_subs(mut self, subs: Vec<SubInstallationTemplate>) -> Self {
        self.subs = subs;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionSpec) -> Self {
        self.execution = Some(execution);
        self
    }
}

/// Status of a deployment unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstallationStatus {
    /// Shared phase/job-token/error block.
    #[serde(flatten)]
    pub work: WorkStatus,

    /// Identities of the expanded child units.
    #[serde(default)]
    pub children: Vec<InstallationId>,

    /// Identity of the expanded execution unit, if the template has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionId>,
}

/// A (possibly nested) request to deploy software.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    pub id: InstallationId,
    pub meta: Meta,

    /// The parent unit, if this unit was expanded from a template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<InstallationId>,

    /// The scope this unit lives in and publishes its exports into.
    /// `None` for root units, whose exports are root-visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextId>,

    pub spec: InstallationSpec,
    pub status: InstallationStatus,
}

impl Installation {
    /// Creates a root unit, as a user would.
    pub fn root(id: InstallationId, spec: InstallationSpec) -> Self {
        Installation {
            id,
            meta: Meta::new(),
            parent: None,
            context: None,
            spec,
            status: InstallationStatus::default(),
        }
    }

    /// Creates a child unit expanded from a parent's template.
    pub fn child_of(parent: &Installation, template: &SubInstallationTemplate) -> Self {
        Installation {
            id: parent.id.child(&template.name),
            meta: Meta::new(),
            parent: Some(parent.id.clone()),
            context: Some(parent.own_scope()),
            spec: template.spec.clone(),
            status: InstallationStatus::default(),
        }
    }

    /// The scope in which this unit's children and resolved imports are
    /// visible.
    pub fn own_scope(&self) -> ContextId {
        ContextId::of_installation(&self.id)
    }
}

impl HasWorkStatus for Installation {
    fn work(&self) -> &WorkStatus {
        &self.status.work
    }

    fn work_mut(&mut self) -> &mut WorkStatus {
        &mut self.status.work
    }
}
