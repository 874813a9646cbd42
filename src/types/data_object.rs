//! Data objects and targets: the named values flowing between units.
//!
//! Both kinds carry the same four provenance labels used for routing:
//! object key, producing source, source kind (`import`/`export`) and the
//! nesting context. Consumers filter by these labels; objects without a
//! context label are visible at the root level only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::ids::{ContextId, DataObjectId, SourceRef, TargetId};
use super::meta::Meta;

/// Whether a published object is a resolved import or a produced export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Import,
    Export,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Import => write!(f, "import"),
            SourceKind::Export => write!(f, "export"),
        }
    }
}

/// The four routing labels attached to every published object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLabels {
    /// The name under which consumers look the object up.
    pub key: String,

    /// The unit that produced the object.
    pub source: SourceRef,

    /// Import or export provenance.
    pub source_kind: SourceKind,

    /// Visibility scope. `None` means root-visible.
    pub context: Option<ContextId>,
}

impl DataLabels {
    pub fn new(
        key: impl Into<String>,
        source: SourceRef,
        source_kind: SourceKind,
        context: Option<ContextId>,
    ) -> Self {
        DataLabels {
            key: key.into(),
            source,
            source_kind,
            context,
        }
    }

    /// Returns true if the labels match the given scope and key.
    pub fn matches(&self, context: &Option<ContextId>, key: &str) -> bool {
        self.key == key && &self.context == context
    }

    /// Deterministic object identity derived from the labels.
    ///
    /// The same producer publishing the same key into the same scope on the
    /// next cycle addresses the same stored object, so cycles supersede
    /// rather than accumulate. `discriminator` distinguishes elements of a
    /// list publication.
    pub fn object_id(&self, discriminator: Option<usize>) -> String {
        let context = self
            .context
            .as_ref()
            .map(|c| c.as_str())
            .unwrap_or("(root)");
        match discriminator {
            Some(n) => format!(
                "{}#{}#{}#{}#{}",
                context, self.source_kind, self.source, self.key, n
            ),
            None => format!(
                "{}#{}#{}#{}",
                context, self.source_kind, self.source, self.key
            ),
        }
    }
}

/// A named structured value produced as an export or resolved as an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObject {
    pub id: DataObjectId,
    pub meta: Meta,
    pub labels: DataLabels,
    pub data: Value,
}

impl DataObject {
    /// Creates a data object with its deterministic identity.
    pub fn labeled(labels: DataLabels, data: Value) -> Self {
        DataObject {
            id: DataObjectId::new(labels.object_id(None)),
            meta: Meta::new(),
            labels,
            data,
        }
    }
}

/// The environment-connection payload of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// The kind of environment this target connects to.
    pub target_type: String,

    /// Opaque connection descriptor.
    pub config: Value,
}

impl TargetSpec {
    pub fn new(target_type: impl Into<String>, config: Value) -> Self {
        TargetSpec {
            target_type: target_type.into(),
            config,
        }
    }
}

/// A named environment reference.
///
/// User-created source targets carry no labels; copies published by the
/// propagation broker carry the full routing label set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub meta: Meta,
    pub labels: Option<DataLabels>,
    pub spec: TargetSpec,
}

impl Target {
    /// Creates an unlabeled source target, as a user would.
    pub fn new(id: TargetId, spec: TargetSpec) -> Self {
        Target {
            id,
            meta: Meta::new(),
            labels: None,
            spec,
        }
    }

    /// Creates a labeled copy published by the broker. `discriminator`
    /// distinguishes elements of a target-list publication.
    pub fn labeled(labels: DataLabels, spec: TargetSpec, discriminator: Option<usize>) -> Self {
        Target {
            id: TargetId::new(labels.object_id(discriminator)),
            meta: Meta::new(),
            labels: Some(labels),
            spec,
        }
    }

    /// Returns true if this target's labels match the given scope and key.
    pub fn matches(&self, context: &Option<ContextId>, key: &str) -> bool {
        self.labels
            .as_ref()
            .is_some_and(|l| l.matches(context, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::InstallationId;
    use serde_json::json;

    fn root_labels(key: &str) -> DataLabels {
        DataLabels::new(
            key,
            SourceRef::installation(&InstallationId::new("root")),
            SourceKind::Export,
            None,
        )
    }

    #[test]
    fn object_id_is_deterministic() {
        let a = DataObject::labeled(root_labels("value"), json!("x"));
        let b = DataObject::labeled(root_labels("value"), json!("y"));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn object_id_distinguishes_key_and_scope() {
        let root = DataObject::labeled(root_labels("value"), json!(1));
        let other_key = DataObject::labeled(root_labels("other"), json!(1));
        assert_ne!(root.id, other_key.id);

        let mut scoped = root_labels("value");
        scoped.context = Some(ContextId::of_installation(&InstallationId::new("root")));
        let scoped = DataObject::labeled(scoped, json!(1));
        assert_ne!(root.id, scoped.id);
    }

    #[test]
    fn list_elements_get_distinct_ids() {
        let spec = TargetSpec::new("cluster", json!({"host": "a"}));
        let labels = root_labels("tl");
        let first = Target::labeled(labels.clone(), spec.clone(), Some(0));
        let second = Target::labeled(labels, spec, Some(1));
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn unlabeled_target_matches_nothing() {
        let target = Target::new(
            TargetId::new("t"),
            TargetSpec::new("cluster", json!({})),
        );
        assert!(!target.matches(&None, "t"));
    }

    #[test]
    fn labels_match_requires_same_scope() {
        let labels = root_labels("value");
        assert!(labels.matches(&None, "value"));
        assert!(!labels.matches(
            &Some(ContextId::of_installation(&InstallationId::new("root"))),
            "value"
        ));
        assert!(!labels.matches(&None, "other"));
    }
}
