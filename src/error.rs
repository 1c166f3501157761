use prost::DecodeError;
use std::error::Error;
use std::fmt;
use thiserror::Error;
use tokio::time::error::Elapsed;
use tokio::{sync::AcquireError, task::JoinError};

use crate::hash::HashAlgorithm;

#[derive(Error, Debug)]
pub enum MetadlError {
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("Resume state error: {0}")]
    ResumeState(#[from] ResumeStateError),
    #[error(
        "All candidate mirrors exhausted for segment {segment} after trying {mirrors_tried} mirror(s)"
    )]
    ConcurrencyExhaustion { segment: usize, mirrors_tried: usize },
    #[error("Download cancelled")]
    Cancelled,
    #[error("Standard I/O error: {e}, {extra_info:?}")]
    StdIoError {
        e: std::io::Error,
        extra_info: Option<String>,
    },
    #[error("Configuration error: {message:?}")]
    Config { message: String },
    #[error("CLI argument error: {message:?}")]
    CliError { message: String },
    #[error("Task error: {e}")]
    TaskError { e: JoinError },
    #[error("Other error: {message:?}")]
    Other {
        message: String,
        origin: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl MetadlError {
    pub fn io_with_context(e: std::io::Error, extra_info: impl Into<String>) -> Self {
        Self::StdIoError {
            e,
            extra_info: Some(extra_info.into()),
        }
    }
}

/// Malformed or self-contradictory manifest input. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor contains no files")]
    Empty,
    #[error("file entry has an empty name")]
    EmptyName,
    #[error("file name `{name}` escapes the output directory")]
    UnsafeName { name: String },
    #[error("file `{file}` has no usable whole-file checksum")]
    MissingChecksum { file: String },
    #[error("file `{file}`: unknown checksum algorithm `{algorithm}`")]
    UnknownAlgorithm { file: String, algorithm: String },
    #[error("file `{file}`: malformed {algorithm} digest `{digest}`")]
    MalformedDigest {
        file: String,
        algorithm: String,
        digest: String,
    },
    #[error("file `{file}`: chunk {index} has zero length")]
    EmptyChunk { file: String, index: usize },
    #[error("file `{file}`: chunk lengths sum to {chunk_total} but size is {size}")]
    SizeMismatch {
        file: String,
        size: u64,
        chunk_total: u64,
    },
    #[error("file `{file}` lists no mirrors")]
    NoMirrors { file: String },
    #[error("mirror `{url}` uses an unsupported scheme")]
    UnsupportedScheme { url: String },
    #[error("file `{file}`: server-advertised {algorithm} digest conflicts with the manifest")]
    ConflictingChecksum { file: String, algorithm: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Timeout,
    NotFound,
    SizeMismatch,
    AuthenticationFailure,
    TransientNetwork,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::NotFound => "not found",
            TransportErrorKind::SizeMismatch => "size mismatch",
            TransportErrorKind::AuthenticationFailure => "authentication failure",
            TransportErrorKind::TransientNetwork => "transient network error",
        };
        f.write_str(s)
    }
}

/// Protocol-independent fetch failure. Every adapter maps its native errors
/// into one of the [TransportErrorKind]s.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn size_mismatch(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::SizeMismatch, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AuthenticationFailure, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::TransientNetwork, message)
    }

    /// Transient errors may be retried on the same mirror, everything else
    /// demotes the mirror immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout | TransportErrorKind::TransientNetwork
        )
    }

    /// Maps an HTTP-style status code. Returns None for success codes.
    pub fn from_status(status: u16, url: &str) -> Option<Self> {
        let message = format!("status {} for {}", status, url);
        match status {
            200..=299 => None,
            401 | 403 | 407 => Some(Self::auth(message)),
            404 | 410 => Some(Self::not_found(message)),
            416 => Some(Self::size_mismatch(message)),
            408 => Some(Self::timeout(message)),
            429 | 500..=599 => Some(Self::transient(message)),
            _ => Some(Self::not_found(message)),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if let Some(err) = TransportError::from_status(
                status.as_u16(),
                e.url().map(|u| u.as_str()).unwrap_or("<unknown>"),
            ) {
                return err;
            }
        }

        if let Some(io_err) = e.source().and_then(|s| s.downcast_ref::<std::io::Error>()) {
            if io_err.kind() == std::io::ErrorKind::TimedOut {
                return Self::timeout(e.to_string());
            }
        }

        match e.is_timeout() {
            true => Self::timeout(e.to_string()),
            false if e.is_redirect() => Self::not_found(e.to_string()),
            false => Self::transient(e.to_string()),
        }
    }
}

impl From<reqwest_middleware::Error> for TransportError {
    fn from(value: reqwest_middleware::Error) -> Self {
        match value {
            reqwest_middleware::Error::Middleware(error) => Self::transient(error.to_string()),
            reqwest_middleware::Error::Reqwest(error) => TransportError::from(error),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::auth(e.to_string()),
            _ => Self::transient(e.to_string()),
        }
    }
}

impl From<Elapsed> for TransportError {
    fn from(_: Elapsed) -> Self {
        Self::timeout("deadline elapsed")
    }
}

/// Checksum or size verification failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("segment {segment} {algorithm} checksum mismatch: expected `{expected}`, got `{actual}`")]
    SegmentMismatch {
        segment: usize,
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },
    #[error("whole-file {algorithm} checksum mismatch: expected `{expected}`, got `{actual}`")]
    FileMismatch {
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },
    #[error("file size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("signature rejected: {status}")]
    SignatureRejected { status: String },
}

/// Stale or corrupt resume record. Handled by discarding the record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResumeStateError {
    #[error("resume record was written for a different manifest")]
    FingerprintMismatch,
    #[error("resume record segment layout differs from the current plan")]
    LayoutMismatch,
    #[error("resume record version {found} is not supported")]
    UnsupportedVersion { found: u32 },
    #[error("resume record is corrupt: {message}")]
    Corrupt { message: String },
    #[error(
        "destination holds {actual} bytes but the resumed segments require {required} bytes"
    )]
    DestinationTruncated { required: u64, actual: u64 },
}

impl From<std::io::Error> for MetadlError {
    fn from(e: std::io::Error) -> Self {
        Self::StdIoError { e, extra_info: None }
    }
}

impl From<Elapsed> for MetadlError {
    fn from(e: Elapsed) -> Self {
        Self::Transport(TransportError::from(e))
    }
}

impl From<JoinError> for MetadlError {
    fn from(e: JoinError) -> Self {
        Self::TaskError { e }
    }
}

impl From<DecodeError> for MetadlError {
    fn from(e: DecodeError) -> Self {
        Self::ResumeState(ResumeStateError::Corrupt {
            message: e.to_string(),
        })
    }
}

impl From<AcquireError> for MetadlError {
    fn from(e: AcquireError) -> Self {
        MetadlError::Other {
            message: "Failed to acquire permit from semaphore, this should not happen.".to_string(),
            origin: Box::new(e),
        }
    }
}

impl From<crate::config::EngineConfigBuilderError> for MetadlError {
    fn from(e: crate::config::EngineConfigBuilderError) -> Self {
        Self::Config {
            message: e.to_string(),
        }
    }
}

impl From<clap::Error> for MetadlError {
    fn from(e: clap::Error) -> Self {
        Self::CliError {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for MetadlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Other {
            message: format!("Failed to decode descriptor: {}", e),
            origin: Box::new(e),
        }
    }
}
