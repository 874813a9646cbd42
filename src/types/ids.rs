//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using an
//! ExecutionId where an InstallationId is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a deployment unit (installation).
///
/// Child units created by template expansion use `<parent>/<template name>`,
/// so identities encode the hierarchy without needing a separate path field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallationId(pub String);

impl InstallationId {
    pub fn new(s: impl Into<String>) -> Self {
        InstallationId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identity of the child unit expanded from the given template name.
    pub fn child(&self, template_name: &str) -> InstallationId {
        InstallationId(format!("{}/{}", self.0, template_name))
    }
}

impl fmt::Display for InstallationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstallationId {
    fn from(s: &str) -> Self {
        InstallationId(s.to_string())
    }
}

/// Identity of an execution unit.
///
/// An installation owns at most one execution, which reuses the owner's
/// identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(s: impl Into<String>) -> Self {
        ExecutionId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the execution identity owned by the given installation.
    pub fn for_installation(inst: &InstallationId) -> Self {
        ExecutionId(inst.0.clone())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of an atomic work item dispatched to a deployer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployItemId(pub String);

impl DeployItemId {
    pub fn new(s: impl Into<String>) -> Self {
        DeployItemId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the item identity for a template name within an execution.
    ///
    /// Deterministic, so re-materializing an unchanged template addresses
    /// the same stored item.
    pub fn for_template(exec: &ExecutionId, template_name: &str) -> Self {
        DeployItemId(format!("{}/{}", exec.0, template_name))
    }
}

impl fmt::Display for DeployItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a target (environment-connection descriptor).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(s: impl Into<String>) -> Self {
        TargetId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a data object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataObjectId(pub String);

impl DataObjectId {
    pub fn new(s: impl Into<String>) -> Self {
        DataObjectId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job token: the fencing value identifying one logical request-to-reconcile.
///
/// A cycle is pending while the resource's current token differs from its
/// finished token. New cycles must use a fresh value; `generate` never
/// returns a previously issued token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(s: impl Into<String>) -> Self {
        JobId(s.into())
    }

    /// Generates a fresh, never-reused token.
    pub fn generate() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the token an owned resource receives for retry attempt `attempt`.
    ///
    /// Attempt 0 is the parent's token verbatim; later attempts get a distinct
    /// suffix so the child restarts its cycle while remaining attributable to
    /// the parent's cycle.
    pub fn derived(&self, attempt: u32) -> JobId {
        if attempt == 0 {
            self.clone()
        } else {
            JobId(format!("{}.{}", self.0, attempt))
        }
    }

    /// Returns true if `self` is the given parent token or one of its retry
    /// derivations.
    pub fn is_derived_from(&self, parent: &JobId) -> bool {
        self.derivation_attempt(parent).is_some()
    }

    /// Returns which retry attempt of `parent` this token encodes: 0 for the
    /// parent itself, n for `parent.n`. `None` if the token is unrelated.
    pub fn derivation_attempt(&self, parent: &JobId) -> Option<u32> {
        if self == parent {
            return Some(0);
        }
        self.0
            .strip_prefix(parent.0.as_str())?
            .strip_prefix('.')?
            .parse()
            .ok()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The nesting-scope label that limits visibility of a data object to one
/// hierarchy level. Objects without a context are visible at the root level
/// only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub String);

impl ContextId {
    /// The scope under which an installation's children (and its own resolved
    /// imports) are visible.
    pub fn of_installation(inst: &InstallationId) -> Self {
        ContextId(format!("Inst.{}", inst.0))
    }

    /// The private scope holding raw deploy-item export payloads of an
    /// execution, before the execution aggregates them.
    pub fn of_execution(exec: &ExecutionId) -> Self {
        ContextId(format!("Exec.{}", exec.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the unit that produced a data object or target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(pub String);

impl SourceRef {
    pub fn installation(inst: &InstallationId) -> Self {
        SourceRef(format!("Inst.{}", inst.0))
    }

    pub fn execution(exec: &ExecutionId) -> Self {
        SourceRef(format!("Exec.{}", exec.0))
    }

    pub fn deploy_item(item: &DeployItemId) -> Self {
        SourceRef(format!("Di.{}", item.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
