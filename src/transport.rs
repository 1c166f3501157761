use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use url::Url;

use crate::config::EngineConfig;
use crate::descriptor::{Mirror, Protocol};
use crate::error::{MetadlError, TransportError};
use crate::hash::HashDigest;

pub mod ftp;
pub mod http;
pub mod rsync;

pub use ftp::FtpTransport;
pub use http::HttpTransport;
pub use rsync::RsyncTransport;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Half-open byte range `[start, end)`. `end = None` reads to EOF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn full() -> Self {
        Self {
            start: 0,
            end: None,
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|e| e.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// `Range` header value, inclusive end as HTTP wants it.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    Identity,
    Gzip,
}

/// One fetch: a byte range of a file from one mirror.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub mirror: Mirror,
    pub range: ByteRange,
    /// Total file size the caller expects, checked against what the server reports.
    pub expected_size: Option<u64>,
    /// Set when the whole file is fetched as one segment.
    pub single_segment: bool,
}

/// What a server told us about the resource, protocol-independent.
#[derive(Debug, Clone, Default)]
pub struct ResourceInfo {
    pub total_size: Option<u64>,
    pub final_url: Option<Url>,
    pub instance_digests: Vec<HashDigest>,
    pub mirrors: Vec<Mirror>,
    /// unix seconds
    pub last_modified: Option<i64>,
    pub supports_range: bool,
    pub encoding: ContentEncoding,
}

pub struct FetchStream {
    pub info: ResourceInfo,
    pub body: ByteStream,
}

impl fmt::Debug for FetchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchStream")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Fetch capability of one protocol. All failures are [TransportError]s.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `open` honours a range that does not start at 0.
    fn supports_range(&self) -> bool;

    /// Concurrent connections this protocol allows against one mirror.
    fn connection_limit(&self) -> Option<u32> {
        None
    }

    fn negotiate_encoding(&self, _request: &FetchRequest) -> ContentEncoding {
        ContentEncoding::Identity
    }

    async fn resolve_redirect(&self, url: &Url) -> Result<Url, TransportError> {
        Ok(url.clone())
    }

    /// Metadata only: size, digests, extra mirrors.
    async fn probe(&self, mirror: &Mirror) -> Result<ResourceInfo, TransportError>;

    async fn open(&self, request: &FetchRequest) -> Result<FetchStream, TransportError>;
}

/// Protocol to adapter registry. The coordinator only ever talks to adapters
/// through this.
#[derive(Clone, Default)]
pub struct Transports {
    adapters: HashMap<Protocol, Arc<dyn TransportAdapter>>,
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .adapters
            .iter()
            .map(|(p, a)| format!("{}={}", p, a.name()))
            .collect();
        names.sort();
        f.debug_struct("Transports").field("adapters", &names).finish()
    }
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP(S), FTP and rsync adapters configured from `config`.
    pub fn with_defaults(config: &EngineConfig) -> Result<Self, MetadlError> {
        let http: Arc<dyn TransportAdapter> = Arc::new(HttpTransport::new(config)?);
        let mut transports = Self::new();
        transports
            .register(Protocol::Http, Arc::clone(&http))
            .register(Protocol::Https, http)
            .register(Protocol::Ftp, Arc::new(FtpTransport::new(config)))
            .register(Protocol::Rsync, Arc::new(RsyncTransport::new(config)));
        Ok(transports)
    }

    pub fn register(
        &mut self,
        protocol: Protocol,
        adapter: Arc<dyn TransportAdapter>,
    ) -> &mut Self {
        self.adapters.insert(protocol, adapter);
        self
    }

    pub fn for_mirror(&self, mirror: &Mirror) -> Result<Arc<dyn TransportAdapter>, TransportError> {
        let protocol = mirror
            .resolve_protocol()
            .map_err(|e| TransportError::not_found(e.to_string()))?;
        self.adapters.get(&protocol).cloned().ok_or_else(|| {
            TransportError::not_found(format!("no transport registered for {}", protocol))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_uses_inclusive_end() {
        assert_eq!(ByteRange::new(0, Some(100)).header_value(), "bytes=0-99");
        assert_eq!(ByteRange::new(200, Some(250)).header_value(), "bytes=200-249");
        assert_eq!(ByteRange::new(42, None).header_value(), "bytes=42-");
        assert_eq!(ByteRange::new(100, Some(200)).len(), Some(100));
        assert!(ByteRange::full().is_full());
        assert!(!ByteRange::new(1, None).is_full());
    }

    #[test]
    fn default_registry_covers_every_protocol() {
        let config = crate::config::EngineConfigBuilder::default().build().unwrap();
        let transports = Transports::with_defaults(&config).unwrap();
        for url in [
            "http://a.example.com/f",
            "https://a.example.com/f",
            "ftp://a.example.com/f",
            "rsync://a.example.com/mod/f",
        ] {
            let mirror = Mirror::parse(url, 1).unwrap();
            assert!(transports.for_mirror(&mirror).is_ok(), "{}", url);
        }
        assert_eq!(
            transports
                .for_mirror(&Mirror::parse("ftp://a.example.com/f", 1).unwrap())
                .unwrap()
                .connection_limit(),
            Some(1)
        );
    }

    #[test]
    fn empty_registry_reports_not_found() {
        let mirror = Mirror::parse("http://a.example.com/f", 1).unwrap();
        let err = Transports::new().for_mirror(&mirror).err().unwrap();
        assert_eq!(err.kind, crate::error::TransportErrorKind::NotFound);
    }
}
