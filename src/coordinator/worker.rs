use futures::StreamExt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{Span, trace};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::descriptor::Mirror;
use crate::error::{IntegrityError, MetadlError, TransportError};
use crate::events::{DownloadEvent, EventSink};
use crate::mirror::MirrorId;
use crate::planner::Segment;
use crate::transport::{ByteRange, FetchRequest, ResourceInfo, TransportAdapter};
use crate::verifier::ChecksumVerifier;

/// Shared by every attempt of one file.
pub(crate) struct WorkerContext {
    pub file: String,
    pub destination: PathBuf,
    pub verifier: ChecksumVerifier,
    pub stall_timeout: Duration,
    pub events: EventSink,
    pub file_span: Span,
    pub transferred: AtomicU64,
    pub requests: AtomicU64,
}

impl WorkerContext {
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// One segment on one mirror.
pub(crate) struct SegmentJob {
    pub segment: Segment,
    pub mirror_id: MirrorId,
    pub mirror: Mirror,
    pub adapter: Arc<dyn TransportAdapter>,
    /// Bytes of this segment already on disk from an earlier attempt.
    pub resume_from: u64,
    pub backoff: Option<Duration>,
    pub expected_size: Option<u64>,
    pub single_segment: bool,
}

pub(crate) enum AttemptError {
    Transport(TransportError),
    Integrity(IntegrityError),
    /// Local failure, fatal for the file.
    Local(MetadlError),
    Cancelled,
}

impl From<TransportError> for AttemptError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<MetadlError> for AttemptError {
    fn from(e: MetadlError) -> Self {
        Self::Local(e)
    }
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        Self::Local(e.into())
    }
}

pub(crate) struct AttemptResult {
    pub segment: usize,
    pub mirror_id: MirrorId,
    /// Bytes of the segment on disk after this attempt, from its start.
    pub received: u64,
    /// Whether `received` may be continued by a later ranged attempt.
    pub continuable: bool,
    pub info: Option<ResourceInfo>,
    pub outcome: Result<(), AttemptError>,
}

pub(crate) async fn fetch_segment(
    ctx: Arc<WorkerContext>,
    job: SegmentJob,
    cancel: CancellationToken,
) -> AttemptResult {
    let mut received = 0;
    let mut info = None;
    let outcome = run_attempt(&ctx, &job, &cancel, &mut received, &mut info).await;
    AttemptResult {
        segment: job.segment.index,
        mirror_id: job.mirror_id,
        received,
        continuable: job.adapter.supports_range(),
        info,
        outcome,
    }
}

async fn run_attempt(
    ctx: &WorkerContext,
    job: &SegmentJob,
    cancel: &CancellationToken,
    received: &mut u64,
    info: &mut Option<ResourceInfo>,
) -> Result<(), AttemptError> {
    let segment = &job.segment;
    if let Some(delay) = job.backoff {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            _ = time::sleep(delay) => {}
        }
    }

    let start_at = if job.adapter.supports_range() {
        job.resume_from
    } else {
        0
    };
    *received = start_at;

    let mut hasher = segment
        .checksum
        .as_ref()
        .map(|expected| ctx.verifier.segment_hasher(expected));
    if start_at > 0 {
        if let Some(hasher) = hasher.as_mut() {
            hasher
                .absorb_file_range(&ctx.destination, segment.offset, start_at)
                .await?;
        }
    }

    let span = Span::current();
    span.pb_set_length(segment.length.unwrap_or(0));
    span.pb_set_position(start_at);

    if segment.length.is_none_or(|length| start_at < length) {
        let request = FetchRequest {
            mirror: job.mirror.clone(),
            range: ByteRange::new(segment.offset + start_at, segment.end()),
            expected_size: job.expected_size,
            single_segment: job.single_segment,
        };
        ctx.count_request();
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            opened = time::timeout(ctx.stall_timeout, job.adapter.open(&request)) => opened,
        };
        let stream = match opened {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(AttemptError::Transport(TransportError::timeout(format!(
                    "no response from {} for {:?}",
                    job.mirror.url, ctx.stall_timeout
                ))));
            }
        };
        trace!(segment = segment.index, range = %request.range.header_value(), "Stream opened");
        *info = Some(stream.info);
        let mut body = stream.body;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&ctx.destination)
            .await?;
        file.seek(SeekFrom::Start(segment.offset + start_at)).await?;
        let mut file = BufWriter::new(file);

        let streamed: Result<(), AttemptError> = async {
            loop {
                let remaining = segment.length.map(|length| length - *received);
                if remaining == Some(0) {
                    return Ok(());
                }
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                    next = time::timeout(ctx.stall_timeout, body.next()) => next,
                };
                let mut chunk = match next {
                    Ok(Some(chunk)) => chunk?,
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        return Err(AttemptError::Transport(TransportError::timeout(format!(
                            "no data from {} for {:?}",
                            job.mirror.url, ctx.stall_timeout
                        ))));
                    }
                };
                if let Some(remaining) = remaining {
                    if chunk.len() as u64 > remaining {
                        chunk.truncate(remaining as usize);
                    }
                }
                file.write_all(&chunk).await?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                let len = chunk.len() as u64;
                *received += len;
                ctx.transferred.fetch_add(len, Ordering::SeqCst);
                ctx.file_span.pb_inc(len);
                span.pb_inc(len);
                ctx.events.emit(DownloadEvent::Progress {
                    file: ctx.file.clone(),
                    segment: segment.index,
                    bytes: len,
                });
            }
        }
        .await;
        if let Err(AttemptError::Cancelled) = streamed {
            // the buffered tail is dropped, only writes already issued complete
            let dropped = file.buffer().len() as u64;
            *received -= dropped;
            ctx.transferred.fetch_sub(dropped, Ordering::SeqCst);
            if let Err(e) = file.get_mut().flush().await {
                trace!(segment = segment.index, "Pending write failed after cancellation: {}", e);
            }
            return Err(AttemptError::Cancelled);
        }
        let flushed = file.flush().await;
        streamed?;
        flushed?;

        match segment.length {
            Some(length) if *received < length => {
                return Err(AttemptError::Transport(TransportError::transient(format!(
                    "{} closed the stream after {} of {} bytes",
                    job.mirror.url, received, length
                ))));
            }
            Some(_) => {}
            // unknown size: drop whatever an older, longer file left behind
            None => {
                file.get_mut()
                    .set_len(segment.offset + *received)
                    .await?;
            }
        }
    }

    if let Some(hasher) = hasher {
        let verdict = hasher.finish();
        if !verdict.passed {
            return Err(AttemptError::Integrity(verdict.segment_error(segment.index)));
        }
    }
    Ok(())
}
