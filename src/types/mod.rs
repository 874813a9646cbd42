//! Core domain types for the deployment reconciliation engine.
//!
//! This module contains all the fundamental resource types used throughout
//! the crate, designed to encode invariants via the type system.

pub mod data_object;
pub mod deploy_item;
pub mod error;
pub mod execution;
pub mod ids;
pub mod installation;
pub mod meta;
pub mod phase;
pub mod status;

// Re-export commonly used types at the module level
pub use data_object::{DataLabels, DataObject, SourceKind, Target, TargetSpec};
pub use deploy_item::{
    DeployItem, DeployItemSpec, DeployItemStatus, DeployerInfo, ItemTimeout, OnDeleteOptions,
};
pub use error::{ErrorReason, ErrorRecord, MAX_ERROR_HISTORY};
pub use execution::{Execution, ExecutionSpec, ExecutionStatus};
pub use ids::{
    ContextId, DataObjectId, DeployItemId, ExecutionId, InstallationId, JobId, SourceRef, TargetId,
};
pub use installation::{
    ExportDecl, ExportKind, ImportDecl, Installation, InstallationSpec, InstallationStatus,
    SubInstallationTemplate,
};
pub use meta::Meta;
pub use phase::Phase;
pub use status::{HasWorkStatus, WorkStatus};
