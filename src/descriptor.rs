use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use url::Url;

use crate::error::DescriptorError;
use crate::fs_utils::sanitize_relative_path;
use crate::hash::{HashAlgorithm, HashDigest};

/// Preference assigned to mirrors whose manifest entry carries none. Ranks
/// after every explicitly preferred mirror.
pub const DEFAULT_PREFERENCE: i64 = 999_999;

/// A parsed manifest: an ordered list of files. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub files: Vec<FileEntry>,
}

impl Descriptor {
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self { files }
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.files.is_empty() {
            return Err(DescriptorError::Empty);
        }
        self.files.iter().try_for_each(FileEntry::validate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// algorithm name -> digest (hex or base64)
    #[serde(default, rename = "checksums", alias = "whole_checksums")]
    pub whole_checksums: BTreeMap<String, String>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub mirrors: Vec<Mirror>,
    #[serde(default)]
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub length: u64,
    pub checksum: String,
    pub algorithm: String,
}

/// Detached signature shipped inside the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default = "Signature::default_media_type")]
    pub media_type: String,
    pub body: String,
}

impl Signature {
    fn default_media_type() -> String {
        "application/pgp-signature".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ftp,
    Rsync,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Option<Protocol> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "ftp" => Some(Protocol::Ftp),
            "rsync" => Some(Protocol::Rsync),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ftp => "ftp",
            Protocol::Rsync => "rsync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mirror {
    pub url: Url,
    /// Explicit protocol; derived from the URL scheme when absent.
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub location: Option<String>,
    /// lower is more preferred
    #[serde(default = "Mirror::default_preference")]
    pub preference: i64,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl Mirror {
    fn default_preference() -> i64 {
        DEFAULT_PREFERENCE
    }

    pub fn new(url: Url, preference: i64) -> Self {
        Self {
            url,
            protocol: None,
            location: None,
            preference,
            max_connections: None,
        }
    }

    pub fn parse(url: &str, preference: i64) -> Result<Self, DescriptorError> {
        let url = Url::parse(url).map_err(|_| DescriptorError::UnsupportedScheme {
            url: url.to_string(),
        })?;
        Ok(Self::new(url, preference))
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn resolve_protocol(&self) -> Result<Protocol, DescriptorError> {
        self.protocol
            .or_else(|| Protocol::from_scheme(self.url.scheme()))
            .ok_or_else(|| DescriptorError::UnsupportedScheme {
                url: self.url.to_string(),
            })
    }
}

impl FileEntry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            size: None,
            whole_checksums: BTreeMap::new(),
            chunks: Vec::new(),
            mirrors: Vec::new(),
            signature: None,
        }
    }

    /// Size declared by the manifest, or the chunk sum when only chunks exist.
    pub fn effective_size(&self) -> Option<u64> {
        match self.size {
            Some(size) => Some(size),
            None if !self.chunks.is_empty() => Some(self.chunks.iter().map(|c| c.length).sum()),
            None => None,
        }
    }

    /// Relative output path, every component sanitized.
    pub fn relative_path(&self) -> Result<PathBuf, DescriptorError> {
        if self.name.trim().is_empty() {
            return Err(DescriptorError::EmptyName);
        }
        sanitize_relative_path(&self.name).ok_or_else(|| DescriptorError::UnsafeName {
            name: self.name.clone(),
        })
    }

    /// Whole-file digests with a known algorithm. Unknown algorithm names are
    /// ignored; a known algorithm with an undecodable value is an error.
    pub fn whole_digests(&self) -> Result<Vec<HashDigest>, DescriptorError> {
        let mut out = Vec::new();
        for (name, value) in &self.whole_checksums {
            let Some(algorithm) = HashAlgorithm::parse(name) else {
                continue;
            };
            let digest = HashDigest::parse(algorithm, value).ok_or_else(|| {
                DescriptorError::MalformedDigest {
                    file: self.name.clone(),
                    algorithm: name.clone(),
                    digest: value.clone(),
                }
            })?;
            out.push(digest);
        }
        out.sort_by_key(|d| d.algorithm());
        out.dedup_by_key(|d| d.algorithm());
        Ok(out)
    }

    pub fn chunk_digests(&self) -> Result<Vec<HashDigest>, DescriptorError> {
        self.chunks
            .iter()
            .map(|chunk| {
                let algorithm = HashAlgorithm::parse(&chunk.algorithm).ok_or_else(|| {
                    DescriptorError::UnknownAlgorithm {
                        file: self.name.clone(),
                        algorithm: chunk.algorithm.clone(),
                    }
                })?;
                HashDigest::parse(algorithm, &chunk.checksum).ok_or_else(|| {
                    DescriptorError::MalformedDigest {
                        file: self.name.clone(),
                        algorithm: chunk.algorithm.clone(),
                        digest: chunk.checksum.clone(),
                    }
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        self.relative_path()?;

        if self.whole_digests()?.is_empty() {
            return Err(DescriptorError::MissingChecksum {
                file: self.name.clone(),
            });
        }

        self.chunk_digests()?;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.length == 0 {
                return Err(DescriptorError::EmptyChunk {
                    file: self.name.clone(),
                    index,
                });
            }
        }
        if let Some(size) = self.size {
            if !self.chunks.is_empty() {
                let chunk_total: u64 = self.chunks.iter().map(|c| c.length).sum();
                if chunk_total != size {
                    return Err(DescriptorError::SizeMismatch {
                        file: self.name.clone(),
                        size,
                        chunk_total,
                    });
                }
            }
        }

        if self.mirrors.is_empty() {
            return Err(DescriptorError::NoMirrors {
                file: self.name.clone(),
            });
        }
        for mirror in &self.mirrors {
            mirror.resolve_protocol()?;
        }
        Ok(())
    }
}

/// In-memory view of one file during a download: the manifest entry plus
/// whatever servers advertised (instance digests, duplicate mirrors) and a
/// probed size. Learned data only augments the manifest.
#[derive(Debug, Clone)]
pub struct LiveEntry {
    pub entry: FileEntry,
    pub size: Option<u64>,
    pub whole_digests: Vec<HashDigest>,
    pub chunk_digests: Vec<HashDigest>,
    pub mirrors: Vec<Mirror>,
}

impl LiveEntry {
    pub fn new(entry: &FileEntry) -> Result<Self, DescriptorError> {
        entry.validate()?;
        Ok(Self {
            size: entry.effective_size(),
            whole_digests: entry.whole_digests()?,
            chunk_digests: entry.chunk_digests()?,
            mirrors: entry.mirrors.clone(),
            entry: entry.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Adds server-advertised digests for algorithms the manifest lacks.
    /// A value disagreeing with a known digest of the same algorithm fails.
    /// Returns how many digests were added.
    pub fn merge_instance_digests(
        &mut self,
        digests: &[HashDigest],
    ) -> Result<usize, DescriptorError> {
        let mut added = 0;
        for digest in digests {
            match self
                .whole_digests
                .iter()
                .find(|d| d.algorithm() == digest.algorithm())
            {
                Some(known) if known.same_value(digest) => {}
                Some(_) => {
                    return Err(DescriptorError::ConflictingChecksum {
                        file: self.entry.name.clone(),
                        algorithm: digest.algorithm().to_string(),
                    });
                }
                None => {
                    self.whole_digests.push(digest.clone());
                    added += 1;
                }
            }
        }
        self.whole_digests.sort_by_key(|d| d.algorithm());
        Ok(added)
    }

    /// Appends mirrors not already known (by URL) and with a usable scheme.
    /// Returns how many were added.
    pub fn merge_mirrors(&mut self, mirrors: Vec<Mirror>) -> usize {
        let mut added = 0;
        for mirror in mirrors {
            if mirror.resolve_protocol().is_err() || self.mirrors.iter().any(|m| m.url == mirror.url) {
                continue;
            }
            self.mirrors.push(mirror);
            added += 1;
        }
        added
    }

    /// Accepts a probed size when the manifest had none.
    pub fn learn_size(&mut self, size: u64) {
        if self.size.is_none() {
            self.size = Some(size);
        }
    }
}
