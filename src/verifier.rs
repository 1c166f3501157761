use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{IntegrityError, MetadlError};
use crate::hash::{HashAlgorithm, HashDigest, Hasher, encode_hex};

/// Result of comparing computed bytes against an expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub algorithm: HashAlgorithm,
    /// lowercase hex
    pub expected: String,
    /// lowercase hex
    pub actual: String,
    pub passed: bool,
}

impl Verdict {
    pub fn segment_error(&self, segment: usize) -> IntegrityError {
        IntegrityError::SegmentMismatch {
            segment,
            algorithm: self.algorithm,
            expected: self.expected.clone(),
            actual: self.actual.clone(),
        }
    }

    pub fn file_error(&self) -> IntegrityError {
        IntegrityError::FileMismatch {
            algorithm: self.algorithm,
            expected: self.expected.clone(),
            actual: self.actual.clone(),
        }
    }
}

/// Digest selection and comparison shared by downloads and the checker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier;

impl ChecksumVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Picks the strongest algorithm present among `candidates`.
    pub fn strongest<'a>(candidates: impl IntoIterator<Item = &'a HashDigest>) -> Option<&'a HashDigest> {
        candidates.into_iter().min_by_key(|d| d.algorithm())
    }

    pub fn segment_hasher(&self, expected: &HashDigest) -> SegmentHasher {
        SegmentHasher {
            expected: expected.clone(),
            hasher: Hasher::new(expected.algorithm()),
            received: 0,
        }
    }

    pub fn verify_bytes(&self, data: &[u8], expected: &HashDigest) -> Verdict {
        let mut hasher = self.segment_hasher(expected);
        hasher.update(data);
        hasher.finish()
    }

    /// Hashes `len` bytes of the file at `path` starting at `offset`.
    pub async fn verify_range(
        &self,
        path: &Path,
        offset: u64,
        len: u64,
        expected: &HashDigest,
    ) -> Result<Verdict, MetadlError> {
        let mut hasher = self.segment_hasher(expected);
        hasher.absorb_file_range(path, offset, len).await?;
        Ok(hasher.finish())
    }

    /// Hashes the whole file with the strongest of `candidates`. None when
    /// there is nothing to compare against.
    pub async fn verify_file(
        &self,
        path: &Path,
        candidates: &[HashDigest],
    ) -> Result<Option<Verdict>, MetadlError> {
        let Some(expected) = Self::strongest(candidates) else {
            return Ok(None);
        };
        let len = tokio::fs::metadata(path)
            .await
            .map_err(|e| {
                MetadlError::io_with_context(
                    e,
                    format!("Failed to stat file for checksum at {}", path.display()),
                )
            })?
            .len();
        self.verify_range(path, 0, len, expected).await.map(Some)
    }
}

/// Incremental digest of one segment, fed while bytes arrive.
#[derive(Debug, Clone)]
pub struct SegmentHasher {
    expected: HashDigest,
    hasher: Hasher,
    received: u64,
}

impl SegmentHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.received += data.len() as u64;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Feeds bytes already present on disk, used when continuing an
    /// interrupted segment.
    pub async fn absorb_file_range(
        &mut self,
        path: &Path,
        offset: u64,
        len: u64,
    ) -> Result<(), MetadlError> {
        let hasher = self.hasher.clone();
        let owned_path = path.to_path_buf();
        let hasher =
            tokio::task::spawn_blocking(move || hash_file_range(owned_path, offset, len, hasher))
                .await?
                .map_err(|e| {
                    MetadlError::io_with_context(
                        e,
                        format!(
                            "Failed to read {} bytes at offset {} of {} for checksum",
                            len,
                            offset,
                            path.display()
                        ),
                    )
                })?;
        self.hasher = hasher;
        self.received += len;
        Ok(())
    }

    pub fn finish(self) -> Verdict {
        let actual = self.hasher.finalize();
        Verdict {
            algorithm: self.expected.algorithm(),
            expected: self.expected.to_hex(),
            actual: encode_hex(&actual),
            passed: self.expected.matches(&actual),
        }
    }
}

fn hash_file_range(
    path: PathBuf,
    offset: u64,
    len: u64,
    mut hasher: Hasher,
) -> std::io::Result<Hasher> {
    let mut file = std::fs::File::open(&path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = file.take(len);
    let mut buf = vec![0u8; 64 * 1024];
    let mut read_total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_total += n as u64;
    }
    if read_total != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, file ended after {}", len, read_total),
        ));
    }
    Ok(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashEncoding;
    use tempfile::tempdir;

    fn sha256_hello() -> HashDigest {
        HashDigest::SHA256(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".to_string(),
            HashEncoding::Hex,
        )
    }

    #[test]
    fn strongest_prefers_sha512_over_weaker() {
        let candidates = vec![
            HashDigest::MD5("5eb63bbbe01eeed093cb22bb8f5acdc3".into(), HashEncoding::Hex),
            sha256_hello(),
            HashDigest::SHA1("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed".into(), HashEncoding::Hex),
        ];
        let best = ChecksumVerifier::strongest(&candidates).unwrap();
        assert_eq!(best.algorithm(), HashAlgorithm::SHA256);
        assert!(ChecksumVerifier::strongest(&[]).is_none());
    }

    #[test]
    fn verify_bytes_detects_single_flipped_byte() {
        let verifier = ChecksumVerifier::new();
        let ok = verifier.verify_bytes(b"hello world", &sha256_hello());
        assert!(ok.passed);
        let bad = verifier.verify_bytes(b"hello worle", &sha256_hello());
        assert!(!bad.passed);
        assert!(matches!(
            bad.segment_error(4),
            IntegrityError::SegmentMismatch { segment: 4, .. }
        ));
    }

    #[test]
    fn segment_hasher_counts_bytes() {
        let verifier = ChecksumVerifier::new();
        let mut h = verifier.segment_hasher(&sha256_hello());
        h.update(b"hello");
        h.update(b" world");
        assert_eq!(h.received(), 11);
        assert!(h.finish().passed);
    }

    #[tokio::test]
    async fn verify_range_reads_only_the_requested_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"xxxhello worldyyy").unwrap();
        let verifier = ChecksumVerifier::new();
        let verdict = verifier
            .verify_range(&path, 3, 11, &sha256_hello())
            .await
            .unwrap();
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn verify_range_past_eof_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"hello").unwrap();
        let verifier = ChecksumVerifier::new();
        let res = verifier.verify_range(&path, 0, 11, &sha256_hello()).await;
        assert!(matches!(res, Err(MetadlError::StdIoError { .. })));
    }

    #[tokio::test]
    async fn prefix_on_disk_continues_incremental_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"hello").unwrap();
        let verifier = ChecksumVerifier::new();
        let mut h = verifier.segment_hasher(&sha256_hello());
        h.absorb_file_range(&path, 0, 5).await.unwrap();
        h.update(b" world");
        assert!(h.finish().passed);
    }

    #[tokio::test]
    async fn verify_file_uses_strongest_candidate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("whole.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let verifier = ChecksumVerifier::new();
        let candidates = vec![
            // deliberately wrong md5, must be ignored in favour of sha-256
            HashDigest::MD5("d41d8cd98f00b204e9800998ecf8427e".into(), HashEncoding::Hex),
            sha256_hello(),
        ];
        let verdict = verifier.verify_file(&path, &candidates).await.unwrap().unwrap();
        assert_eq!(verdict.algorithm, HashAlgorithm::SHA256);
        assert!(verdict.passed);
        assert!(verifier.verify_file(&path, &[]).await.unwrap().is_none());
    }
}
