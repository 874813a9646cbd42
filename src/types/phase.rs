//! The phase state machine shared by all reconciled resource kinds.
//!
//! Installations, executions and deploy items all report their lifecycle
//! through the same nine-state enum. Creation/update cycles run
//! `Init -> Progressing -> Completing -> {Succeeded | Failed}`; deletion
//! cycles run `InitDelete -> Deleting -> {Deleted | DeleteFailed}`.
//!
//! INVARIANT: a resource only carries a terminal phase for a cycle whose
//! job token has been finished; [`crate::jobs::finish`] couples the two
//! writes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a reconciled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// A new cycle was requested; no worker has picked the resource up yet.
    Init,

    /// Work is underway (for deploy items: a deployer has claimed the item).
    Progressing,

    /// Work finished, results are being finalized (exports collected).
    Completing,

    /// Terminal: the cycle completed successfully.
    Succeeded,

    /// Terminal: the cycle failed and no automatic retries remain.
    Failed,

    /// A deletion cycle was requested; not yet picked up.
    InitDelete,

    /// Deletion is underway.
    Deleting,

    /// Deletion-terminal: the deployer confirmed teardown; the owning
    /// controller removes the resource from the store on observing this.
    Deleted,

    /// Deletion-terminal: deletion failed.
    DeleteFailed,
}

impl Phase {
    /// Returns the phase name for logging/display.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Progressing => "progressing",
            Phase::Completing => "completing",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
            Phase::InitDelete => "init_delete",
            Phase::Deleting => "deleting",
            Phase::Deleted => "deleted",
            Phase::DeleteFailed => "delete_failed",
        }
    }

    /// Returns true for phases that end a cycle.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Phase::Succeeded | Phase::Failed | Phase::Deleted | Phase::DeleteFailed
        )
    }

    /// Returns true for phases on the deletion path.
    pub fn is_deletion(&self) -> bool {
        matches!(
            self,
            Phase::InitDelete | Phase::Deleting | Phase::Deleted | Phase::DeleteFailed
        )
    }

    /// Returns true for the failure phases.
    pub fn is_failed(&self) -> bool {
        matches!(self, Phase::Failed | Phase::DeleteFailed)
    }

    /// Returns true while a resource waits for a deployer to claim it.
    pub fn awaits_pickup(&self) -> bool {
        matches!(self, Phase::Init | Phase::InitDelete)
    }

    /// Returns true while a claimed resource is being worked on.
    pub fn in_progress(&self) -> bool {
        matches!(self, Phase::Progressing | Phase::Completing | Phase::Deleting)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Init),
            Just(Phase::Progressing),
            Just(Phase::Completing),
            Just(Phase::Succeeded),
            Just(Phase::Failed),
            Just(Phase::InitDelete),
            Just(Phase::Deleting),
            Just(Phase::Deleted),
            Just(Phase::DeleteFailed),
        ]
    }

    #[test]
    fn final_phases() {
        assert!(Phase::Succeeded.is_final());
        assert!(Phase::Failed.is_final());
        assert!(Phase::Deleted.is_final());
        assert!(Phase::DeleteFailed.is_final());
        assert!(!Phase::Init.is_final());
        assert!(!Phase::Progressing.is_final());
        assert!(!Phase::Completing.is_final());
        assert!(!Phase::InitDelete.is_final());
        assert!(!Phase::Deleting.is_final());
    }

    #[test]
    fn deletion_phases() {
        assert!(Phase::InitDelete.is_deletion());
        assert!(Phase::Deleting.is_deletion());
        assert!(Phase::Deleted.is_deletion());
        assert!(Phase::DeleteFailed.is_deletion());
        assert!(!Phase::Init.is_deletion());
        assert!(!Phase::Succeeded.is_deletion());
    }

    proptest! {
        #[test]
        fn serde_roundtrip(phase in arb_phase()) {
            let json = serde_json::to_string(&phase).unwrap();
            let parsed: Phase = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(phase, parsed);
        }

        #[test]
        fn pickup_and_progress_are_disjoint(phase in arb_phase()) {
            prop_assert!(!(phase.awaits_pickup() && phase.in_progress()));
        }

        #[test]
        fn failed_implies_final(phase in arb_phase()) {
            if phase.is_failed() {
                prop_assert!(phase.is_final());
            }
        }
    }
}
