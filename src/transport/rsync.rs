use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use futures::Stream;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::descriptor::Mirror;
use crate::error::TransportError;
use crate::transport::{FetchRequest, FetchStream, ResourceInfo, TransportAdapter};

/// rsync through the external `rsync` program. The file is pulled whole into a
/// scratch directory and then streamed, so ranges are not advertised.
#[derive(Debug, Clone)]
pub struct RsyncTransport {
    program: PathBuf,
    io_timeout: Duration,
}

impl RsyncTransport {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.rsync_program.clone(),
            io_timeout: config.stall_timeout,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("--timeout={}", self.io_timeout.as_secs().max(1)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> TransportError {
        if e.kind() == std::io::ErrorKind::NotFound {
            TransportError::not_found(format!("{} is not installed", self.program.display()))
        } else {
            TransportError::from(e)
        }
    }
}

#[async_trait]
impl TransportAdapter for RsyncTransport {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn supports_range(&self) -> bool {
        false
    }

    async fn probe(&self, mirror: &Mirror) -> Result<ResourceInfo, TransportError> {
        let output = self
            .command()
            .arg("--list-only")
            .arg(mirror.url.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(exit_error(output.status, &mirror.url, &output.stderr));
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        let (total_size, last_modified) = listing
            .lines()
            .find_map(parse_listing_line)
            .map(|(size, mtime)| (Some(size), mtime))
            .unwrap_or((None, None));
        debug!(url = %mirror.url, size = ?total_size, "Probed rsync mirror");
        Ok(ResourceInfo {
            total_size,
            final_url: Some(mirror.url.clone()),
            last_modified,
            supports_range: false,
            ..Default::default()
        })
    }

    async fn open(&self, request: &FetchRequest) -> Result<FetchStream, TransportError> {
        let url = &request.mirror.url;
        let scratch = TempDir::with_prefix("metadl-rsync-")?;
        let target = scratch.path().join("payload");

        let output = self
            .command()
            .arg("--quiet")
            .arg("--times")
            .arg(url.as_str())
            .arg(&target)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            return Err(exit_error(output.status, url, &output.stderr));
        }

        let mut file = File::open(&target).await?;
        let total = file.metadata().await?.len();
        if let Some(expected) = request.expected_size {
            if total != expected {
                return Err(TransportError::size_mismatch(format!(
                    "{} delivered {} bytes, expected {}",
                    url, total, expected
                )));
            }
        }
        if request.range.start > 0 {
            warn!(url = %url, start = request.range.start, "rsync cannot resume mid-file, skipping fetched prefix");
            file.seek(SeekFrom::Start(request.range.start)).await?;
        }

        let limit = request.range.len().unwrap_or(u64::MAX);
        Ok(FetchStream {
            info: ResourceInfo {
                total_size: Some(total),
                final_url: Some(url.clone()),
                supports_range: false,
                ..Default::default()
            },
            body: Box::pin(RsyncBody {
                inner: ReaderStream::new(file.take(limit)),
                _scratch: scratch,
            }),
        })
    }
}

/// Streams the fetched copy and removes the scratch directory once dropped.
struct RsyncBody {
    inner: ReaderStream<Take<File>>,
    _scratch: TempDir,
}

impl Stream for RsyncBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(|r| r.map_err(TransportError::from)))
    }
}

/// Maps rsync(1) exit codes.
fn exit_error(status: ExitStatus, url: &Url, stderr: &[u8]) -> TransportError {
    let stderr = String::from_utf8_lossy(stderr);
    let message = format!("rsync {} exited with {}: {}", url, status, stderr.trim());
    match status.code() {
        Some(5) => TransportError::auth(message),
        Some(23) => TransportError::not_found(message),
        Some(30) | Some(35) => TransportError::timeout(message),
        Some(10) | Some(12) | Some(24) => TransportError::transient(message),
        None => TransportError::transient(message),
        Some(_) => TransportError::not_found(message),
    }
}

/// `-rw-r--r--     11,234 2015/10/21 07:28:00 name` to size and mtime.
fn parse_listing_line(line: &str) -> Option<(u64, Option<i64>)> {
    let mut fields = line.split_whitespace();
    let mode = fields.next()?;
    if !mode.starts_with('-') {
        return None;
    }
    let size = fields.next()?.replace(',', "").parse().ok()?;
    let mtime = match (fields.next(), fields.next()) {
        (Some(date), Some(time)) => {
            NaiveDateTime::parse_from_str(&format!("{} {}", date, time), "%Y/%m/%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc().timestamp())
        }
        _ => None,
    };
    Some((size, mtime))
}
