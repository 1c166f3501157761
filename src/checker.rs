use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info_span};

use crate::descriptor::{Descriptor, FileEntry};
use crate::error::MetadlError;
use crate::hash::HashDigest;
use crate::verifier::{ChecksumVerifier, Verdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCheck {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub file: String,
    pub path: PathBuf,
    pub expected_size: Option<u64>,
    /// None when the file does not exist.
    pub actual_size: Option<u64>,
    pub chunks: Vec<ChunkCheck>,
    pub whole: Option<Verdict>,
}

impl CheckReport {
    pub fn size_ok(&self) -> bool {
        match (self.expected_size, self.actual_size) {
            (_, None) => false,
            (Some(expected), Some(actual)) => expected == actual,
            (None, Some(_)) => true,
        }
    }

    pub fn passed(&self) -> bool {
        self.size_ok()
            && self.chunks.iter().all(|c| c.verdict.passed)
            && self.whole.as_ref().is_some_and(|w| w.passed)
    }

    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkCheck> {
        self.chunks.iter().filter(|c| !c.verdict.passed)
    }
}

/// Verification of files already on disk. Never touches the network.
#[derive(Debug, Clone)]
pub struct Checker {
    verifier: ChecksumVerifier,
    workers: usize,
}

impl Checker {
    pub fn new(workers: usize) -> Self {
        Self {
            verifier: ChecksumVerifier::new(),
            workers: workers.max(1),
        }
    }

    /// Checks size, every chunk (on a bounded pool) and the whole-file
    /// digest of `path` against `entry`.
    pub async fn check_entry(&self, entry: &FileEntry, path: &Path) -> Result<CheckReport, MetadlError> {
        entry.validate()?;
        let whole_digests = entry.whole_digests()?;
        let chunk_digests = entry.chunk_digests()?;

        let actual_size = match tokio::fs::metadata(path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(MetadlError::io_with_context(
                    e,
                    format!("Failed to stat {}", path.display()),
                ));
            }
        };
        let mut report = CheckReport {
            file: entry.name.clone(),
            path: path.to_path_buf(),
            expected_size: entry.effective_size(),
            actual_size,
            chunks: Vec::with_capacity(entry.chunks.len()),
            whole: None,
        };
        let Some(actual_size) = actual_size else {
            debug!(file = %entry.name, "Nothing to check, file is missing");
            return Ok(report);
        };

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set: JoinSet<Result<ChunkCheck, MetadlError>> = JoinSet::new();
        let mut offset = 0u64;
        for (index, (chunk, digest)) in entry.chunks.iter().zip(chunk_digests).enumerate() {
            let length = chunk.length;
            let chunk_offset = offset;
            offset += length;
            if chunk_offset + length > actual_size {
                report.chunks.push(ChunkCheck {
                    index,
                    offset: chunk_offset,
                    length,
                    verdict: missing_bytes(&digest),
                });
                continue;
            }
            let semaphore = Arc::clone(&semaphore);
            let verifier = self.verifier;
            let path = path.to_path_buf();
            join_set.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await?;
                    let verdict = verifier
                        .verify_range(&path, chunk_offset, length, &digest)
                        .await?;
                    Ok(ChunkCheck {
                        index,
                        offset: chunk_offset,
                        length,
                        verdict,
                    })
                }
                .instrument(info_span!("check_chunk", index)),
            );
        }
        while let Some(joined) = join_set.join_next().await {
            report.chunks.push(joined??);
        }
        report.chunks.sort_by_key(|c| c.index);

        if report.size_ok() {
            report.whole = self.verifier.verify_file(path, &whole_digests).await?;
        }
        debug!(file = %entry.name, passed = report.passed(), "Checked file");
        Ok(report)
    }

    /// Checks every entry of `descriptor` below `dir`.
    pub async fn check_descriptor(
        &self,
        descriptor: &Descriptor,
        dir: &Path,
    ) -> Result<Vec<CheckReport>, MetadlError> {
        descriptor.validate()?;
        let mut reports = Vec::with_capacity(descriptor.files.len());
        for entry in &descriptor.files {
            let path = dir.join(entry.relative_path()?);
            reports.push(self.check_entry(entry, &path).await?);
        }
        Ok(reports)
    }
}

fn missing_bytes(expected: &HashDigest) -> Verdict {
    Verdict {
        algorithm: expected.algorithm(),
        expected: expected.to_hex(),
        actual: String::new(),
        passed: false,
    }
}
