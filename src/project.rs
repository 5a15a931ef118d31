use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::scheduler::job::{IndexerJob, JobId};
use crate::source::Source;
use crate::unit::JobFlags;

/// The parse result record handed back by an indexer, local or remote.
///
/// Symbol storage itself lives downstream; the coordinator only routes this
/// record to the owning project and enforces first-wins between replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexData {
    pub job_id: JobId,
    /// Unit fingerprint; identical across replicas.
    pub key: u64,
    pub file_id: u32,
    pub flags: JobFlags,
    pub project: PathBuf,
    pub symbol_count: u32,
    pub message: String,
}

impl IndexData {
    /// Synthetic empty record for a crashed local job, so the project can
    /// decide whether to retry.
    pub fn crashed(job: &IndexerJob) -> IndexData {
        IndexData {
            job_id: job.id,
            key: job.unit.key(),
            file_id: job.unit.source.file_id,
            flags: job.unit.flags,
            project: job.project.clone(),
            symbol_count: 0,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    Unloaded,
    Inited,
    Loading,
    Loaded,
    Syncing,
}

/// What the project wants done after a job result lands.
#[derive(Debug)]
pub enum JobOutcome {
    /// Result recorded; nothing further.
    Done,
    /// The compile crashed below the retry ceiling; re-admit this source.
    Retry(Source),
    /// Project is syncing; the result was buffered for later replay.
    Buffered,
}

#[derive(Debug, Default)]
struct JobData {
    crash_count: usize,
}

/// Per-root bookkeeping: the source set, crash counters, and the files its
/// jobs have claimed. Symbol indexes and query handling live downstream.
#[derive(Debug)]
pub struct Project {
    pub root: PathBuf,
    state: ProjectState,
    sources: HashMap<u64, Source>,
    jobs: HashMap<u64, JobData>,
    visited_files: HashSet<u32>,
    pending_results: Vec<(IndexData, IndexerJob)>,
    job_counter: usize,
    finished: usize,
}

impl Project {
    pub fn new(root: PathBuf) -> Project {
        Project {
            root,
            state: ProjectState::Unloaded,
            sources: HashMap::new(),
            jobs: HashMap::new(),
            visited_files: HashSet::new(),
            pending_results: Vec::new(),
            job_counter: 0,
            finished: 0,
        }
    }

    pub fn state(&self) -> ProjectState {
        self.state
    }

    pub fn load(&mut self) {
        if self.state == ProjectState::Unloaded {
            self.state = ProjectState::Loaded;
        }
    }

    pub fn unload(&mut self) {
        self.state = ProjectState::Unloaded;
        self.visited_files.clear();
    }

    pub fn add_source(&mut self, source: Source) {
        let key = source.key();
        self.sources.insert(key, source);
        self.jobs.entry(key).or_default();
        self.job_counter += 1;
    }

    pub fn source(&self, key: u64) -> Option<&Source> {
        self.sources.get(&key)
    }

    /// A visit-file request is only honored for keys we are indexing.
    pub fn is_valid_job(&self, key: u64) -> bool {
        self.jobs.contains_key(&key)
    }

    /// Claim a file for a job. False when some other job already owns it,
    /// telling the worker to skip the file's symbols.
    pub fn visit_file(&mut self, file_id: u32, key: u64) -> bool {
        if !self.is_valid_job(key) {
            return false;
        }
        self.visited_files.insert(file_id)
    }

    pub fn begin_sync(&mut self) {
        if self.state == ProjectState::Loaded {
            self.state = ProjectState::Syncing;
        }
    }

    /// Leave the syncing state and hand back results that arrived meanwhile.
    pub fn finish_sync(&mut self) -> Vec<(IndexData, IndexerJob)> {
        self.state = ProjectState::Loaded;
        std::mem::take(&mut self.pending_results)
    }

    /// Accept a completed (or crashed) job's result.
    pub fn on_job_finished(
        &mut self,
        data: &IndexData,
        job: &IndexerJob,
        max_crash_count: usize,
    ) -> JobOutcome {
        if self.state == ProjectState::Syncing {
            self.pending_results.push((data.clone(), job.clone()));
            return JobOutcome::Buffered;
        }

        let flags = job.flags();
        let job_data = self.jobs.entry(data.key).or_default();
        if flags.contains(JobFlags::CRASHED) {
            job_data.crash_count += 1;
            let crash_count = job_data.crash_count;
            // a failed job's claimed files go back up for grabs
            for file_id in &job.visited {
                self.visited_files.remove(file_id);
            }
            if crash_count < max_crash_count {
                tracing::warn!(
                    source = %job.unit.source_file.display(),
                    crash_count,
                    "Compile crashed, retrying"
                );
                return JobOutcome::Retry(job.unit.source.clone());
            }
            tracing::error!(
                source = %job.unit.source_file.display(),
                crash_count,
                "Compile crashed too many times, giving up"
            );
            return JobOutcome::Done;
        }

        job_data.crash_count = 0;
        if flags.is_complete() {
            self.finished += 1;
            tracing::debug!(
                source = %job.unit.source_file.display(),
                symbols = data.symbol_count,
                progress = format!("{}/{}", self.finished, self.job_counter),
                "Indexed"
            );
        } else {
            for file_id in &job.visited {
                self.visited_files.remove(file_id);
            }
        }
        JobOutcome::Done
    }
}

/// All projects this coordinator serves, keyed by root path.
pub type Projects = HashMap<PathBuf, Project>;
