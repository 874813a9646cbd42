//! Deploy items: atomic units of work dispatched to external deployers.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use super::ids::{DataObjectId, DeployItemId, ExecutionId, JobId, TargetId};
use super::meta::Meta;
use super::status::{HasWorkStatus, WorkStatus};

/// How long a deployer may take to process a claimed item.
///
/// Serialized as a duration string (e.g. `"10m"`), the literal `"none"` to
/// deactivate the timeout, or `"default"` to fall back to the monitor's
/// configured default (ten minutes unless overridden).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemTimeout {
    /// Use the monitor's default progressing timeout.
    #[default]
    Default,

    /// The progressing timeout is disabled for this item.
    Disabled,

    /// Fail the item if the deployer has not reported within this duration.
    After(Duration),
}

impl ItemTimeout {
    /// Resolves against the monitor default. `None` means disabled.
    pub fn resolve(&self, default: Duration) -> Option<Duration> {
        match self {
            ItemTimeout::Default => Some(default),
            ItemTimeout::Disabled => None,
            ItemTimeout::After(d) => Some(*d),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, ItemTimeout::Default)
    }
}

impl fmt::Display for ItemTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemTimeout::Default => write!(f, "default"),
            ItemTimeout::Disabled => write!(f, "none"),
            ItemTimeout::After(d) => write!(f, "{}", humantime::format_duration(*d)),
        }
    }
}

impl Serialize for ItemTimeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemTimeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "default" => Ok(ItemTimeout::Default),
            "none" => Ok(ItemTimeout::Disabled),
            other => humantime::parse_duration(other)
                .map(ItemTimeout::After)
                .map_err(|e| D::Error::custom(format!("invalid timeout {:?}: {}", other, e))),
        }
    }
}

/// Per-item settings for the deletion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OnDeleteOptions {
    /// When set, the engine confirms deletion without dispatching the
    /// deployer. Used when the target environment is already gone and an
    /// uninstall could never succeed.
    #[serde(default)]
    pub skip_uninstall: bool,
}

/// Identity of the deployer that claimed an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployerInfo {
    /// Unique identity of the deployer instance.
    pub identity: String,

    /// Name of the deployer.
    pub name: String,

    /// Version of the deployer.
    pub version: String,
}

impl DeployerInfo {
    pub fn new(
        identity: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        DeployerInfo {
            identity: identity.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Specification of one unit of work. Doubles as the template entry inside
/// an execution spec; the materialized item carries a verbatim copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployItemSpec {
    /// Template name, unique within the owning execution.
    pub name: String,

    /// Selects which deployer processes the item.
    pub item_type: String,

    /// Optional target environment reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetId>,

    /// Opaque deployer-specific configuration.
    #[serde(default)]
    pub config: Value,

    /// Progressing timeout for this item.
    #[serde(default, skip_serializing_if = "ItemTimeout::is_default")]
    pub timeout: ItemTimeout,

    /// When set, an unchanged item that already succeeded is re-confirmed
    /// without re-dispatching the deployer.
    #[serde(default)]
    pub update_on_change_only: bool,

    /// Names of sibling items that must succeed before this one is triggered.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Automatic re-dispatch attempts after a failure before the failure
    /// becomes terminal for the owning execution.
    #[serde(default)]
    pub retries: u32,

    /// Deletion-path settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDeleteOptions>,
}

impl DeployItemSpec {
    pub fn new(name: impl Into<String>, item_type: impl Into<String>) -> Self {
        DeployItemSpec {
            name: name.into(),
            item_type: item_type.into(),
            target: None,
            config: Value::Null,
            timeout: ItemTimeout::Default,
            update_on_change_only: false,
            depends_on: Vec::new(),
            retries: 0,
            on_delete: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_timeout(mut self, timeout: ItemTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_update_on_change_only(mut self) -> Self {
        self.update_on_change_only = true;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_skip_uninstall(mut self) -> Self {
        self.on_delete = Some(OnDeleteOptions {
            skip_uninstall: true,
        });
        self
    }

    /// Returns true if deletion should be confirmed without a deployer.
    pub fn skips_uninstall(&self) -> bool {
        self.on_delete.is_some_and(|o| o.skip_uninstall)
    }
}

/// Status of a deploy item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeployItemStatus {
    /// Shared phase/job-token/error block.
    #[serde(flatten)]
    pub work: WorkStatus,

    /// The deployer that claimed the item for the current cycle. Once set,
    /// only this deployer advances the phase until the cycle finishes or a
    /// timeout forces failure.
    pub deployer: Option<DeployerInfo>,

    /// Last time the claiming deployer reported progress. Anchors the
    /// progressing timeout.
    pub last_progress_at: Option<DateTime<Utc>>,

    /// Opaque deployer-specific status payload.
    pub provider_status: Option<Value>,

    /// Reference to the data object holding the item's exported values.
    pub export_ref: Option<DataObjectId>,
}

/// One atomic unit of work, processed by exactly one external deployer per
/// cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployItem {
    pub id: DeployItemId,
    pub meta: Meta,

    /// The execution that owns this item.
    pub owner: ExecutionId,

    pub spec: DeployItemSpec,
    pub status: DeployItemStatus,
}

impl DeployItem {
    /// Materializes an item from a template entry.
    pub fn from_template(owner: &ExecutionId, spec: DeployItemSpec) -> Self {
        DeployItem {
            id: DeployItemId::for_template(owner, &spec.name),
            meta: Meta::new(),
            owner: owner.clone(),
            spec,
            status: DeployItemStatus::default(),
        }
    }

    /// Returns true if this item's current cycle belongs to the given
    /// execution token (directly or via a retry derivation).
    pub fn cycle_of(&self, job: &JobId) -> bool {
        self.status
            .work
            .job_id
            .as_ref()
            .is_some_and(|j| j.is_derived_from(job))
    }
}

impl HasWorkStatus for DeployItem {
    fn work(&self) -> &WorkStatus {
        &self.status.work
    }

    fn work_mut(&mut self) -> &mut WorkStatus {
        &mut self.status.work
    }
}
