//! Object metadata shared by every stored resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata carried by every stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Optimistic-concurrency token, maintained by the store. A write whose
    /// version does not match the stored version is rejected.
    pub version: u64,

    /// Spec-change counter, bumped by the writer whenever the spec mutates.
    /// Compared against `observed_generation` to detect unobserved changes.
    pub generation: u64,

    /// Set when deletion has been requested. The resource stays in the store
    /// until its owning controller confirms all owned resources are gone.
    pub deletion_requested: Option<DateTime<Utc>>,
}

impl Meta {
    pub fn new() -> Self {
        Meta {
            version: 0,
            generation: 1,
            deletion_requested: None,
        }
    }

    /// Marks the resource for deletion at the given time. Idempotent.
    pub fn request_deletion(&mut self, at: DateTime<Utc>) {
        if self.deletion_requested.is_none() {
            self.deletion_requested = Some(at);
        }
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.deletion_requested.is_some()
    }
}

impl Default for Meta {
    fn default() -> Self {
        Self::new()
    }
}
