//! The job-token reconciliation driver.
//!
//! Every mutable resource carries a `job_id` set by whoever requests new
//! work and a `job_id_finished` set by the owning controller only after the
//! full cycle (including all descendants) completes. A cycle is pending iff
//! the two differ.
//!
//! Triggering a new cycle requires a fresh, never-reused token value; this
//! is the fencing mechanism that prevents a stale in-flight cycle from
//! overwriting a newer request's results. Controllers are idempotent and
//! re-entrant against this contract: repeated invocation with no token
//! change is a no-op, invocation while pending resumes from current state,
//! and a crash between phase and token writes is recoverable because phase
//! and `job_id_finished` are only ever written together by [`finish`].

use chrono::{DateTime, Utc};

use crate::store::{update_with_retry, Cluster, RetryConfig, StoreResult};
use crate::types::{HasWorkStatus, Installation, InstallationId, JobId, Phase};

/// Installs a new creation/update cycle on a status block.
///
/// Clears the per-cycle error fields; `first_error` tracks the first failure
/// since the *current* token was issued.
pub fn request(status: &mut impl HasWorkStatus, job: JobId, force: bool, now: DateTime<Utc>) {
    let work = status.work_mut();
    work.job_id = Some(job);
    work.job_id_issued_at = Some(now);
    work.job_forced = force;
    work.phase = Phase::Init;
    work.first_error = None;
    work.error_history.clear();
}

/// Installs a new deletion cycle on a status block.
pub fn request_delete(status: &mut impl HasWorkStatus, job: JobId, force: bool, now: DateTime<Utc>) {
    request(status, job, force, now);
    status.work_mut().phase = Phase::InitDelete;
}

/// Completes the current cycle: terminal phase and finished token are
/// written together, so "terminal phase implies finished token" holds at
/// every observable point.
pub fn finish(status: &mut impl HasWorkStatus, phase: Phase) {
    let work = status.work_mut();
    work.phase = phase;
    work.job_id_finished = work.job_id.clone();
    work.job_finished_at = Some(Utc::now());
}

/// Returns true if the resource has unprocessed work.
pub fn is_pending(status: &impl HasWorkStatus) -> bool {
    status.work().is_pending()
}

/// Returns true if the resource's current token belongs to the given cycle
/// (the token itself or one of its retry derivations).
pub fn in_cycle(status: &impl HasWorkStatus, job: &JobId) -> bool {
    status
        .work()
        .job_id
        .as_ref()
        .is_some_and(|current| current.is_derived_from(job))
}

/// Returns true if the given cycle finished in the given phase.
pub fn finished_in(status: &impl HasWorkStatus, job: &JobId, phase: Phase) -> bool {
    let work = status.work();
    work.phase == phase
        && work
            .job_id
            .as_ref()
            .is_some_and(|current| current.is_derived_from(job))
        && !work.is_pending()
}

/// Requests a new reconciliation cycle on an installation.
///
/// This is the user-facing entry point: it issues a fresh token against the
/// stored object and returns it. `force` bypasses the update-on-change-only
/// short circuit all the way down the hierarchy.
pub async fn request_installation(
    cluster: &Cluster,
    id: &InstallationId,
    force: bool,
    retry: &RetryConfig,
) -> StoreResult<Option<JobId>> {
    let job = JobId::generate();
    let issued = job.clone();
    let written: Option<Installation> =
        update_with_retry(cluster.installations.as_ref(), id, retry, move |inst| {
            request(inst, job.clone(), force, Utc::now());
            true
        })
        .await?;
    Ok(written.map(|_| issued))
}

/// Requests deletion of an installation.
///
/// Deletion is itself a job-token cycle: the unit and its descendants are
/// driven through the deletion path and removed from the store bottom-up.
pub async fn request_installation_delete(
    cluster: &Cluster,
    id: &InstallationId,
    retry: &RetryConfig,
) -> StoreResult<Option<JobId>> {
    let job = JobId::generate();
    let issued = job.clone();
    let written: Option<Installation> =
        update_with_retry(cluster.installations.as_ref(), id, retry, move |inst| {
            let now = Utc::now();
            inst.meta.request_deletion(now);
            request_delete(inst, job.clone(), false, now);
            true
        })
        .await?;
    Ok(written.map(|_| issued))
}
