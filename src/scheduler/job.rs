use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::unit::{JobFlags, Unit};

pub type JobId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_job_id() -> JobId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The schedulable wrapper around a [`Unit`].
///
/// Lifecycle: Pending -> Dispatched (local child or remote peer) ->
/// Completed (local|remote) | Crashed | Aborted. Only the first completion
/// counts; see `Scheduler::handle_indexer_message`.
#[derive(Debug, Clone)]
pub struct IndexerJob {
    /// Process-wide monotonic id; replicas of the same unit share it.
    pub id: JobId,
    /// For jobs we run on a peer's behalf, the id the originator knows the
    /// job by; results are reported under this id.
    pub remote_id: Option<JobId>,
    /// Root path of the owning project.
    pub project: PathBuf,
    pub unit: Unit,
    /// Where the worker should report results: our socket file for local
    /// jobs, the originating host for jobs we run on a peer's behalf.
    pub destination: String,
    pub port: u16,
    /// File ids this job has reported through visit-file requests.
    pub visited: HashSet<u32>,
    /// Monotonic ms when the job was last dispatched; 0 while pending.
    pub started: u64,
    /// Files a remote job must not revisit, keyed by file id.
    pub blocked_files: HashMap<u32, PathBuf>,
}

impl IndexerJob {
    pub fn new(project: PathBuf, unit: Unit, destination: String) -> IndexerJob {
        IndexerJob {
            id: next_job_id(),
            remote_id: None,
            project,
            unit,
            destination,
            port: 0,
            visited: HashSet::new(),
            started: 0,
            blocked_files: HashMap::new(),
        }
    }

    /// Rebuild a job shipped over from a peer. The job gets a fresh local id
    /// for our own tables; `remote_id` keeps the originator's.
    pub fn from_remote(
        remote_id: JobId,
        project: PathBuf,
        mut unit: Unit,
        host: String,
        port: u16,
        blocked_files: HashMap<u32, PathBuf>,
    ) -> IndexerJob {
        unit.flags.insert(JobFlags::FROM_REMOTE);
        IndexerJob {
            id: next_job_id(),
            remote_id: Some(remote_id),
            project,
            unit,
            destination: host,
            port,
            visited: HashSet::new(),
            started: 0,
            blocked_files,
        }
    }

    /// The id this job's results travel under.
    pub fn wire_id(&self) -> JobId {
        self.remote_id.unwrap_or(self.id)
    }

    pub fn flags(&self) -> JobFlags {
        self.unit.flags
    }

    pub fn is_complete(&self) -> bool {
        self.unit.flags.is_complete()
    }

    /// Mark aborted: suppresses crash promotion and completion forwarding.
    /// The caller kills any running child.
    pub fn abort(&mut self) {
        self.unit.flags.remove(JobFlags::RUNNING_LOCAL);
        self.unit.flags.insert(JobFlags::ABORTED);
    }
}
