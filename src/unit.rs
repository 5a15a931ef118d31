use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::source::Source;

/// Scheduling state of a job, shared with every replica of its unit.
///
/// Location bits: `FROM_REMOTE` (we run it for someone else), `REMOTE` (a
/// peer runs it for us), `RUNNING_LOCAL`. Status bits: `RESCHEDULED`,
/// `CRASHED`, `ABORTED`, `COMPLETE_LOCAL`, `COMPLETE_REMOTE`. The first
/// complete bit set wins; the other is never applied afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobFlags(u32);

impl JobFlags {
    pub const NONE: JobFlags = JobFlags(0);
    /// Re-index of a file we already indexed.
    pub const DIRTY: JobFlags = JobFlags(1 << 0);
    /// Fresh compile submitted by a client.
    pub const COMPILE: JobFlags = JobFlags(1 << 1);
    /// The job originated on another machine; we run it to be nice.
    pub const FROM_REMOTE: JobFlags = JobFlags(1 << 4);
    /// A locally owned job currently running on some other machine.
    pub const REMOTE: JobFlags = JobFlags(1 << 5);
    pub const RESCHEDULED: JobFlags = JobFlags(1 << 6);
    pub const RUNNING_LOCAL: JobFlags = JobFlags(1 << 7);
    pub const CRASHED: JobFlags = JobFlags(1 << 8);
    pub const ABORTED: JobFlags = JobFlags(1 << 9);
    pub const COMPLETE_LOCAL: JobFlags = JobFlags(1 << 10);
    pub const COMPLETE_REMOTE: JobFlags = JobFlags(1 << 11);
    pub const PREPROCESS_COMPRESSED: JobFlags = JobFlags(1 << 12);
    pub const HIGH_PRIORITY: JobFlags = JobFlags(1 << 13);

    pub const TYPE_MASK: JobFlags = JobFlags(Self::DIRTY.0 | Self::COMPILE.0);
    pub const COMPLETE: JobFlags = JobFlags(Self::COMPLETE_LOCAL.0 | Self::COMPLETE_REMOTE.0);

    pub fn contains(self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set.
    pub fn intersects(self, other: JobFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: JobFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: JobFlags) {
        self.0 &= !other.0;
    }

    pub fn masked(self, mask: JobFlags) -> JobFlags {
        JobFlags(self.0 & mask.0)
    }

    pub fn is_complete(self) -> bool {
        self.intersects(Self::COMPLETE)
    }
}

impl std::ops::BitOr for JobFlags {
    type Output = JobFlags;
    fn bitor(self, rhs: JobFlags) -> JobFlags {
        JobFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for JobFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(JobFlags, &str)] = &[
            (JobFlags::DIRTY, "dirty"),
            (JobFlags::COMPILE, "compile"),
            (JobFlags::FROM_REMOTE, "from-remote"),
            (JobFlags::REMOTE, "remote"),
            (JobFlags::RESCHEDULED, "rescheduled"),
            (JobFlags::RUNNING_LOCAL, "running-local"),
            (JobFlags::CRASHED, "crashed"),
            (JobFlags::ABORTED, "aborted"),
            (JobFlags::COMPLETE_LOCAL, "complete-local"),
            (JobFlags::COMPLETE_REMOTE, "complete-remote"),
            (JobFlags::PREPROCESS_COMPRESSED, "preprocess-compressed"),
            (JobFlags::HIGH_PRIORITY, "high-priority"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// A preprocessed, dispatchable work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub source: Source,
    pub source_file: PathBuf,
    /// Preprocessed translation unit; empty before preprocessing, zstd frame
    /// when `PREPROCESS_COMPRESSED` is set.
    pub preprocessed: Vec<u8>,
    pub flags: JobFlags,
    /// Unix epoch ms when the unit was produced.
    pub time: u64,
    pub preprocess_duration_ms: u64,
}

impl Unit {
    pub fn new(source: Source, flags: JobFlags) -> Unit {
        let source_file = source.source_file.clone();
        Unit {
            source,
            source_file,
            preprocessed: Vec::new(),
            flags,
            time: epoch_ms(),
            preprocess_duration_ms: 0,
        }
    }

    /// Fingerprint shared across every replica of this unit.
    pub fn key(&self) -> u64 {
        self.source.key()
    }

    pub fn compress_preprocessed(&mut self) -> Result<()> {
        if self.flags.contains(JobFlags::PREPROCESS_COMPRESSED) || self.preprocessed.is_empty() {
            return Ok(());
        }
        self.preprocessed = zstd::bulk::compress(&self.preprocessed, 3)
            .map_err(|e| ServerError::Compress(e.to_string()))?;
        self.flags.insert(JobFlags::PREPROCESS_COMPRESSED);
        Ok(())
    }

    pub fn decompress_preprocessed(&mut self, max_size: usize) -> Result<()> {
        if !self.flags.contains(JobFlags::PREPROCESS_COMPRESSED) {
            return Ok(());
        }
        self.preprocessed = zstd::bulk::decompress(&self.preprocessed, max_size)
            .map_err(|e| ServerError::Compress(e.to_string()))?;
        self.flags.remove(JobFlags::PREPROCESS_COMPRESSED);
        Ok(())
    }
}

pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
