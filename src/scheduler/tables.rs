use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use crate::net::connection::ConnId;
use crate::scheduler::job::{IndexerJob, JobId};
use crate::source::Source;
use crate::unit::JobFlags;

/// A compile command waiting for a preprocess slot.
#[derive(Debug, Clone)]
pub struct PreprocessRequest {
    pub source: Source,
    pub project: PathBuf,
    pub flags: JobFlags,
}

/// Authoritative map of in-flight jobs and the membership queues that
/// schedule them.
///
/// Every live job is owned exactly once, by `jobs`; `pending`, `processing`
/// and `local_jobs` hold ids. A job appears in one membership container at a
/// time, except that a rescheduled job sits in both `processing` (its remote
/// replica may still answer) and `pending` (awaiting redispatch). Jobs whose
/// bytes are currently being written to a peer are pinned by `in_flight`
/// until the send resolves.
#[derive(Debug, Default)]
pub struct JobTables {
    jobs: HashMap<JobId, IndexerJob>,
    pub pending: VecDeque<JobId>,
    pub processing: HashSet<JobId>,
    /// child pid -> (job, dispatch time in monotonic ms)
    pub local_jobs: HashMap<u32, (JobId, u64)>,
    pub pending_preprocess: VecDeque<PreprocessRequest>,
    /// Outstanding JobRequest counts per peer connection.
    pub pending_job_requests: HashMap<ConnId, usize>,
    in_flight: HashSet<JobId>,
}

impl JobTables {
    pub fn new() -> JobTables {
        JobTables::default()
    }

    pub fn job(&self, id: JobId) -> Option<&IndexerJob> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut IndexerJob> {
        self.jobs.get_mut(&id)
    }

    /// Admit a job: becomes owned here and queued in `pending`.
    /// High-priority jobs float to the front.
    pub fn add_pending(&mut self, job: IndexerJob) {
        debug_assert!(!job.is_complete());
        let id = job.id;
        let high_priority = job.flags().contains(JobFlags::HIGH_PRIORITY);
        self.jobs.insert(id, job);
        if high_priority {
            self.pending.push_front(id);
        } else {
            self.pending.push_back(id);
        }
    }

    /// Re-queue an id that is already owned (reschedule, failed send).
    pub fn push_pending(&mut self, id: JobId) {
        debug_assert!(self.jobs.contains_key(&id));
        self.pending.push_back(id);
    }

    pub fn pin_in_flight(&mut self, id: JobId) {
        self.in_flight.insert(id);
    }

    pub fn unpin_in_flight(&mut self, id: JobId) {
        self.in_flight.remove(&id);
    }

    pub fn total_job_requests(&self) -> usize {
        self.pending_job_requests.values().sum()
    }

    /// Drop the job if no membership container references it any more.
    /// Returns true when the job was released.
    pub fn maybe_release(&mut self, id: JobId) -> bool {
        if self.processing.contains(&id)
            || self.in_flight.contains(&id)
            || self.pending.contains(&id)
            || self.local_jobs.values().any(|(jid, _)| *jid == id)
        {
            return false;
        }
        self.jobs.remove(&id).is_some()
    }

    /// True while the job is anywhere the scheduler can still see it.
    pub fn is_live(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Find a live job by its unit fingerprint; linear, and fine for the
    /// handful of jobs in flight at once.
    pub fn job_id_by_key(&self, key: u64) -> Option<JobId> {
        self.jobs
            .iter()
            .find(|(_, job)| job.unit.key() == key)
            .map(|(&id, _)| id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}
