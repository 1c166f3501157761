use fs2::FileExt;
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::descriptor::FileEntry;
use crate::error::{DescriptorError, MetadlError, ResumeStateError};
use crate::fs_utils::{
    atomic_replace, atomic_write, read_delimited_message_from_path, remove_file_if_exists,
};
use crate::hash::encode_hex;
use crate::proto::resume_record::{
    ManifestFingerprint, PartialSegment, ResumeRecord, SegmentBounds,
};

pub const RESUME_RECORD_VERSION: u32 = 1;
pub const RECORD_EXTENSION: &str = "metadl";

/// Files backing one resume record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePaths {
    pub record: PathBuf,
    pub temp: PathBuf,
    pub lock: PathBuf,
}

impl ResumePaths {
    /// `<destination>.metadl` beside the destination, or a name derived from
    /// the destination path inside `state_dir`.
    pub fn for_destination(destination: &Path, state_dir: Option<&Path>) -> Self {
        let record = match state_dir {
            Some(dir) => {
                let key = Sha256::digest(destination.to_string_lossy().as_bytes());
                dir.join(format!("{}.{}", &encode_hex(&key)[..32], RECORD_EXTENSION))
            }
            None => {
                let mut name = destination
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_default();
                name.push(format!(".{}", RECORD_EXTENSION));
                destination.with_file_name(name)
            }
        };
        let mut temp = record.clone().into_os_string();
        temp.push(".tmp");
        let mut lock = record.clone().into_os_string();
        lock.push(".lock");
        Self {
            record,
            temp: temp.into(),
            lock: lock.into(),
        }
    }
}

/// Identity of the manifest a record was written for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: Option<u64>,
    pub algorithm: String,
    pub digest: String,
    pub mirrors_hash: Vec<u8>,
    pub chunks_hash: Vec<u8>,
}

impl Fingerprint {
    pub fn of(entry: &FileEntry) -> Result<Self, DescriptorError> {
        let strongest = entry
            .whole_digests()?
            .into_iter()
            .next()
            .ok_or_else(|| DescriptorError::MissingChecksum {
                file: entry.name.clone(),
            })?;

        let mut mirrors = Sha256::new();
        for mirror in &entry.mirrors {
            mirrors.update(mirror.url.as_str().as_bytes());
            mirrors.update(b"\n");
        }
        let mut chunks = Sha256::new();
        for chunk in &entry.chunks {
            chunks.update(
                format!(
                    "{}:{}:{}\n",
                    chunk.length,
                    chunk.algorithm.to_ascii_lowercase(),
                    chunk.checksum.to_ascii_lowercase()
                )
                .as_bytes(),
            );
        }

        Ok(Self {
            size: entry.effective_size(),
            algorithm: strongest.algorithm().name().to_string(),
            digest: strongest.to_hex(),
            mirrors_hash: mirrors.finalize().to_vec(),
            chunks_hash: chunks.finalize().to_vec(),
        })
    }

    fn matches(&self, stored: &ManifestFingerprint) -> bool {
        self.size == stored.size
            && self.algorithm == stored.algorithm
            && self.digest == stored.digest
            && self.mirrors_hash == stored.mirrors_hash
            && self.chunks_hash == stored.chunks_hash
    }
}

impl From<&Fingerprint> for ManifestFingerprint {
    fn from(f: &Fingerprint) -> Self {
        Self {
            size: f.size,
            algorithm: f.algorithm.clone(),
            digest: f.digest.clone(),
            mirrors_hash: f.mirrors_hash.clone(),
            chunks_hash: f.chunks_hash.clone(),
        }
    }
}

/// Verified segments and byte counts of interrupted ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    pub completed: BTreeSet<usize>,
    pub partial: BTreeMap<usize, u64>,
}

impl ResumeState {
    pub fn is_complete(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    pub fn mark_complete(&mut self, index: usize) {
        self.partial.remove(&index);
        self.completed.insert(index);
    }

    /// Forgets a completed segment, e.g. after it failed re-verification.
    pub fn mark_incomplete(&mut self, index: usize) {
        self.completed.remove(&index);
        self.partial.remove(&index);
    }

    pub fn set_partial(&mut self, index: usize, received: u64) {
        if received == 0 {
            self.partial.remove(&index);
        } else {
            self.partial.insert(index, received);
        }
    }

    pub fn partial(&self, index: usize) -> u64 {
        self.partial.get(&index).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.partial.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeLoad {
    /// No record on disk.
    Fresh,
    Resumed(ResumeState),
    /// A record existed but was unusable and has been removed.
    Discarded(ResumeStateError),
}

/// Resume record of one destination file.
///
/// All reads and writes of the record go through [ResumeStore::locked], which
/// holds an in-process mutex and an exclusive lock on the sidecar lock file
/// for the duration of one read-modify-write.
#[derive(Debug)]
pub struct ResumeStore {
    paths: ResumePaths,
    fingerprint: Fingerprint,
    layout: Vec<(u64, u64)>,
    mutex: Mutex<()>,
}

/// Guard of the record critical section. Dropping it releases both locks.
pub struct RecordLock<'a> {
    _guard: MutexGuard<'a, ()>,
    file: std::fs::File,
}

impl Drop for RecordLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ResumeStore {
    pub fn new(paths: ResumePaths, fingerprint: Fingerprint, layout: Vec<(u64, u64)>) -> Self {
        Self {
            paths,
            fingerprint,
            layout,
            mutex: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &ResumePaths {
        &self.paths
    }

    async fn locked(&self) -> Result<RecordLock<'_>, MetadlError> {
        let guard = self.mutex.lock().await;
        if let Some(parent) = self.paths.lock.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.paths.lock)
            .await
            .map_err(|e| {
                MetadlError::io_with_context(
                    e,
                    format!("Failed to open lock file {}", self.paths.lock.display()),
                )
            })?
            .into_std()
            .await;
        let file = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|_| file))
            .await??;
        Ok(RecordLock {
            _guard: guard,
            file,
        })
    }

    /// Reads and validates the record against the current manifest and the
    /// destination on disk. Unusable records are deleted.
    pub async fn load(&self, destination: &Path) -> Result<ResumeLoad, MetadlError> {
        let _lock = self.locked().await?;
        self.recover_temp().await?;

        if !tokio::fs::try_exists(&self.paths.record).await? {
            return Ok(ResumeLoad::Fresh);
        }

        let destination_len = match tokio::fs::metadata(destination).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let verdict =
            match read_delimited_message_from_path::<ResumeRecord, _>(&self.paths.record).await {
                Ok(record) => self.validate(&record, destination_len),
                Err(e) => Err(ResumeStateError::Corrupt {
                    message: e.to_string(),
                }),
            };

        match verdict {
            Ok(state) => {
                info!(
                    completed = state.completed.len(),
                    partial = state.partial.len(),
                    "Resuming from {}",
                    self.paths.record.display()
                );
                Ok(ResumeLoad::Resumed(state))
            }
            Err(reason) => {
                warn!("Discarding resume record {}: {}", self.paths.record.display(), reason);
                remove_file_if_exists(&self.paths.record).await?;
                Ok(ResumeLoad::Discarded(reason))
            }
        }
    }

    /// Checks a decoded record. Pure apart from logging.
    pub fn validate(
        &self,
        record: &ResumeRecord,
        destination_len: u64,
    ) -> Result<ResumeState, ResumeStateError> {
        if record.version != RESUME_RECORD_VERSION {
            return Err(ResumeStateError::UnsupportedVersion {
                found: record.version,
            });
        }
        match &record.fingerprint {
            Some(stored) if self.fingerprint.matches(stored) => {}
            _ => return Err(ResumeStateError::FingerprintMismatch),
        }
        let layout: Vec<(u64, u64)> = record.layout.iter().map(|b| (*b).into()).collect();
        if layout != self.layout {
            return Err(ResumeStateError::LayoutMismatch);
        }

        let mut state = ResumeState::default();
        let mut required = 0u64;
        for &index in &record.completed_segments {
            let (offset, length) = *layout
                .get(index as usize)
                .ok_or(ResumeStateError::LayoutMismatch)?;
            required = required.max(offset.saturating_add(length));
            state.completed.insert(index as usize);
        }
        for partial in &record.partial_segments {
            let (offset, length) = *layout
                .get(partial.index as usize)
                .ok_or(ResumeStateError::LayoutMismatch)?;
            if state.completed.contains(&(partial.index as usize)) || partial.received == 0 {
                continue;
            }
            if partial.received >= length {
                return Err(ResumeStateError::Corrupt {
                    message: format!(
                        "segment {} claims {} of {} bytes",
                        partial.index, partial.received, length
                    ),
                });
            }
            required = required.max(offset + partial.received);
            state.partial.insert(partial.index as usize, partial.received);
        }

        if destination_len < required {
            return Err(ResumeStateError::DestinationTruncated {
                required,
                actual: destination_len,
            });
        }
        Ok(state)
    }

    /// Writes `state` atomically. An empty state still writes a record so a
    /// later run knows the destination belongs to this manifest.
    pub async fn save(&self, state: &ResumeState) -> Result<(), MetadlError> {
        let encoded = self.encode(state).encode_length_delimited_to_vec();
        let _lock = self.locked().await?;
        atomic_write(self.paths.record.clone(), self.paths.temp.clone(), &encoded)
            .await
            .map_err(|e| {
                MetadlError::io_with_context(
                    e,
                    format!("Failed to persist resume record at {}", self.paths.record.display()),
                )
            })?;
        debug!(completed = state.completed.len(), "Resume record saved");
        Ok(())
    }

    /// Removes the record and its sidecars after a successful download.
    pub async fn clear(&self) -> Result<(), MetadlError> {
        {
            let _lock = self.locked().await?;
            remove_file_if_exists(&self.paths.record).await?;
            remove_file_if_exists(&self.paths.temp).await?;
        }
        remove_file_if_exists(&self.paths.lock).await?;
        Ok(())
    }

    fn encode(&self, state: &ResumeState) -> ResumeRecord {
        ResumeRecord {
            version: RESUME_RECORD_VERSION,
            fingerprint: Some((&self.fingerprint).into()),
            layout: self.layout.iter().map(|&b| SegmentBounds::from(b)).collect(),
            completed_segments: state.completed.iter().map(|&i| i as u32).collect(),
            partial_segments: state
                .partial
                .iter()
                .map(|(&index, &received)| PartialSegment {
                    index: index as u32,
                    received,
                })
                .collect(),
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// A leftover temp file means a write was interrupted: promote it if it
    /// decodes, otherwise remove it.
    async fn recover_temp(&self) -> Result<(), MetadlError> {
        if !tokio::fs::try_exists(&self.paths.temp).await? {
            return Ok(());
        }
        match read_delimited_message_from_path::<ResumeRecord, _>(&self.paths.temp).await {
            Ok(_) => {
                debug!("Recovering interrupted resume record write");
                atomic_replace(self.paths.temp.clone(), self.paths.record.clone()).await?;
            }
            Err(_) => remove_file_if_exists(&self.paths.temp).await?,
        }
        Ok(())
    }
}
