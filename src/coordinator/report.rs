use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::descriptor::Protocol;
use crate::error::MetadlError;
use crate::signature::SignatureVerdict;

/// Outcome of one file.
#[derive(Debug)]
pub struct DownloadReport {
    pub file: String,
    pub path: PathBuf,
    pub status: DownloadStatus,
    pub failovers: Vec<Failover>,
    pub signature: Option<SignatureVerdict>,
    pub stats: TransferStats,
}

impl DownloadReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, DownloadStatus::Completed)
    }

    pub fn failure(&self) -> Option<&FileFailure> {
        match &self.status {
            DownloadStatus::Completed => None,
            DownloadStatus::Failed(failure) => Some(failure),
        }
    }
}

#[derive(Debug)]
pub enum DownloadStatus {
    /// Every byte verified.
    Completed,
    Failed(FileFailure),
}

/// Why a file failed and where.
#[derive(Debug)]
pub struct FileFailure {
    pub file: String,
    pub segment: Option<usize>,
    pub mirror: Option<String>,
    pub protocol: Option<Protocol>,
    pub cause: MetadlError,
}

impl FileFailure {
    pub fn new(file: impl Into<String>, cause: MetadlError) -> Self {
        Self {
            file: file.into(),
            segment: None,
            mirror: None,
            protocol: None,
            cause,
        }
    }
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file, self.cause)?;
        if let Some(segment) = self.segment {
            write!(f, " (segment {}", segment)?;
            if let Some(mirror) = &self.mirror {
                write!(f, ", last mirror {}", mirror)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// A segment moved from one mirror to another after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failover {
    pub segment: usize,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    /// Bytes received from the network and written.
    pub bytes_transferred: u64,
    /// Bytes reused from a previous run.
    pub bytes_resumed: u64,
    pub elapsed: Duration,
    /// Fetch and probe requests issued.
    pub requests: u64,
    pub segments_total: usize,
    pub segments_resumed: usize,
}

impl TransferStats {
    /// Bytes per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}
