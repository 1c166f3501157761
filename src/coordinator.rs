use async_channel::Receiver;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::checker::Checker;
use crate::config::EngineConfig;
use crate::descriptor::{Descriptor, FileEntry, LiveEntry, Mirror};
use crate::error::{DescriptorError, IntegrityError, MetadlError};
use crate::events::{DownloadEvent, DownloadState, EventSink};
use crate::fs_utils::{prepare_destination, remove_file_if_exists};
use crate::hash::HashDigest;
use crate::mirror::{MirrorId, MirrorSelector};
use crate::planner::{SegmentPlan, SegmentPlanner};
use crate::resume::{Fingerprint, ResumeLoad, ResumePaths, ResumeState, ResumeStore};
use crate::signature::{GpgVerifier, SignatureVerdict, SignatureVerifier};
use crate::transport::{ResourceInfo, TransportAdapter, Transports};
use crate::verifier::ChecksumVerifier;

mod finalize;
pub mod report;
pub mod scheduler;
mod worker;

pub use report::{DownloadReport, DownloadStatus, Failover, FileFailure, TransferStats};
pub use scheduler::{Assignment, FailureKind, Pick, Scheduler};

use worker::{AttemptError, AttemptResult, SegmentJob, WorkerContext};

/// Mirrors asked for the size of a file the manifest leaves unsized.
const PROBE_MIRRORS: usize = 3;

/// Drives files from manifest to verified bytes on disk.
///
/// Cheap to clone; every clone shares the same immutable [EngineConfig],
/// transports and event sink.
#[derive(Clone)]
pub struct DownloadCoordinator {
    config: Arc<EngineConfig>,
    transports: Transports,
    verifier: ChecksumVerifier,
    signature_verifier: Arc<dyn SignatureVerifier>,
    events: EventSink,
}

impl fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("config", &self.config)
            .field("transports", &self.transports)
            .finish_non_exhaustive()
    }
}

impl DownloadCoordinator {
    pub fn new(config: EngineConfig) -> Result<Self, MetadlError> {
        let transports = Transports::with_defaults(&config)?;
        Ok(Self::with_transports(config, transports))
    }

    pub fn with_transports(config: EngineConfig, transports: Transports) -> Self {
        let signature_verifier: Arc<dyn SignatureVerifier> =
            Arc::new(GpgVerifier::new(config.gpg_program.clone()));
        Self {
            config: Arc::new(config),
            transports,
            verifier: ChecksumVerifier::new(),
            signature_verifier,
            events: EventSink::disabled(),
        }
    }

    pub fn with_signature_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.signature_verifier = verifier;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Starts publishing [DownloadEvent]s and returns the receiving end.
    pub fn subscribe(&mut self) -> Receiver<DownloadEvent> {
        let (sink, rx) = EventSink::channel(self.config.event_buffer);
        self.events = sink;
        rx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Downloads every entry of `descriptor` below `output_dir`, at most
    /// `max_concurrent_files` at a time. Entries that cannot be placed safely
    /// get a failed report, the others proceed.
    pub async fn download_descriptor(
        &self,
        descriptor: &Descriptor,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<DownloadReport>, MetadlError> {
        if descriptor.files.is_empty() {
            return Err(DescriptorError::Empty.into());
        }
        let semaphore = Semaphore::new(self.config.max_concurrent_files);
        let semaphore = &semaphore;
        let tasks = descriptor.files.iter().map(|entry| async move {
            let path = match entry.relative_path() {
                Ok(relative) => output_dir.join(relative),
                Err(e) => {
                    error!("Skipping `{}`: {}", entry.name, e);
                    return failed_report(entry, output_dir.to_path_buf(), e.into());
                }
            };
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(e) => return failed_report(entry, path, e.into()),
            };
            self.download(entry, &path, cancel).await
        });
        Ok(join_all(tasks).await)
    }

    /// Downloads one entry to `destination`. Never returns an error: every
    /// outcome, including cancellation, is described by the report.
    pub async fn download(
        &self,
        entry: &FileEntry,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> DownloadReport {
        let started = Instant::now();
        let span = info_span!("file", name = %entry.name);
        let mut log = SessionLog::default();
        let result = self
            .run_file(entry, destination, cancel, &mut log)
            .instrument(span)
            .await;
        log.stats.elapsed = started.elapsed();

        let status = match result {
            Ok(()) => {
                self.set_state(&entry.name, DownloadState::Completed);
                info!(
                    file = %entry.name,
                    bytes = log.stats.bytes_transferred,
                    resumed = log.stats.bytes_resumed,
                    "Download complete"
                );
                DownloadStatus::Completed
            }
            Err(cause) => {
                self.set_state(&entry.name, DownloadState::Failed);
                let mut failure = FileFailure::new(entry.name.clone(), cause);
                failure.segment = log.segment;
                failure.protocol = log.mirror.as_ref().and_then(|m| m.resolve_protocol().ok());
                failure.mirror = log.mirror.map(|m| m.url.to_string());
                error!("Download failed: {}", failure);
                DownloadStatus::Failed(failure)
            }
        };
        DownloadReport {
            file: entry.name.clone(),
            path: destination.to_path_buf(),
            status,
            failovers: log.failovers,
            signature: log.signature,
            stats: log.stats,
        }
    }

    async fn run_file(
        &self,
        entry: &FileEntry,
        destination: &Path,
        cancel: &CancellationToken,
        log: &mut SessionLog,
    ) -> Result<(), MetadlError> {
        if cancel.is_cancelled() {
            return Err(MetadlError::Cancelled);
        }
        self.set_state(&entry.name, DownloadState::Planning);
        let mut live = LiveEntry::new(entry)?;
        let paths = ResumePaths::for_destination(destination, self.config.state_dir.as_deref());

        if self.config.skip_existing_verified
            && self.verified_on_disk(entry, destination, &paths).await?
        {
            info!("{} is already complete, nothing to download", destination.display());
            return Ok(());
        }

        if live.size.is_none() && self.config.probe_unknown_size {
            log.stats.requests += self.probe_size(&mut live, cancel).await?;
        }

        let mut transfer = Transfer::prepare(self, entry, live, destination, paths).await?;
        log.stats.segments_total = transfer.plan.segments.len();
        log.stats.segments_resumed = transfer.segments_resumed;
        log.stats.bytes_resumed = transfer.bytes_resumed;

        self.set_state(&entry.name, DownloadState::Downloading);
        let result = transfer.run(cancel).await;
        log.absorb(&transfer);
        result?;

        self.set_state(&entry.name, DownloadState::Verifying);
        if let Err(e) = finalize::verify_download(
            &self.verifier,
            &transfer.live,
            &transfer.plan,
            destination,
            self.config.always_verify_whole_file,
        )
        .await
        {
            transfer.discard(!self.config.keep_partial_on_failure).await;
            return Err(e);
        }
        if let Some(store) = &transfer.store {
            store.clear().await?;
        }

        if self.config.use_server_time {
            if let Some(mtime) = transfer.last_modified {
                finalize::apply_server_time(destination, mtime).await;
            }
        }
        if let Some(signature) = &entry.signature {
            log.signature = finalize::check_signature(
                &self.signature_verifier,
                destination,
                signature,
                self.config.require_valid_signature,
            )
            .await?;
        }
        Ok(())
    }

    /// True when the destination exists without a resume record and passes
    /// every check against the manifest.
    async fn verified_on_disk(
        &self,
        entry: &FileEntry,
        destination: &Path,
        paths: &ResumePaths,
    ) -> Result<bool, MetadlError> {
        if tokio::fs::try_exists(&paths.record).await?
            || !tokio::fs::try_exists(destination).await?
        {
            return Ok(false);
        }
        let report = Checker::new(self.config.checker_workers)
            .check_entry(entry, destination)
            .await?;
        if !report.passed() {
            info!("Existing {} does not verify, downloading again", destination.display());
        }
        Ok(report.passed())
    }

    /// Asks the best-ranked mirrors for the size of an unsized file. A size
    /// reported by a single mirror is taken as is; several reports must have
    /// at least two in agreement. Returns the number of requests made.
    async fn probe_size(
        &self,
        live: &mut LiveEntry,
        cancel: &CancellationToken,
    ) -> Result<u64, MetadlError> {
        let ranking = MirrorSelector::new(
            self.config.preferred_location.clone(),
            self.config.max_mirror_failures,
        )
        .ranking(&live.mirrors);
        let candidates: Vec<Mirror> = ranking
            .into_iter()
            .take(PROBE_MIRRORS)
            .map(|id| live.mirrors[id].clone())
            .collect();

        let mut requests = 0;
        let mut sizes = Vec::new();
        for mirror in candidates {
            if cancel.is_cancelled() {
                return Err(MetadlError::Cancelled);
            }
            let Ok(adapter) = self.transports.for_mirror(&mirror) else {
                continue;
            };
            requests += 1;
            match adapter.probe(&mirror).await {
                Ok(info) => {
                    debug!(mirror = %mirror.url, size = ?info.total_size, "Probed mirror");
                    live.merge_instance_digests(&info.instance_digests)?;
                    live.merge_mirrors(info.mirrors);
                    sizes.extend(info.total_size);
                }
                Err(e) => debug!(mirror = %mirror.url, "Probe failed: {}", e),
            }
        }

        match agreed_size(&sizes) {
            Some(size) => {
                info!(size, "Learned file size from mirrors");
                live.learn_size(size);
            }
            None if !sizes.is_empty() => {
                warn!(?sizes, "Mirrors disagree on the file size, fetching sequentially");
            }
            None => {}
        }
        Ok(requests)
    }

    fn set_state(&self, file: &str, state: DownloadState) {
        debug!(file, ?state, "State changed");
        self.events.emit(DownloadEvent::StateChanged {
            file: file.to_string(),
            state,
        });
    }
}

fn agreed_size(sizes: &[u64]) -> Option<u64> {
    if let [only] = sizes {
        return Some(*only);
    }
    sizes
        .iter()
        .copied()
        .find(|size| sizes.iter().filter(|&&other| other == *size).count() >= 2)
}

fn failed_report(entry: &FileEntry, path: PathBuf, cause: MetadlError) -> DownloadReport {
    DownloadReport {
        file: entry.name.clone(),
        path,
        status: DownloadStatus::Failed(FileFailure::new(entry.name.clone(), cause)),
        failovers: Vec::new(),
        signature: None,
        stats: TransferStats::default(),
    }
}

fn mirror_cap(config: &EngineConfig, mirror: &Mirror, adapter: &dyn TransportAdapter) -> usize {
    let cap = mirror
        .max_connections
        .unwrap_or(config.connections_per_mirror);
    adapter
        .connection_limit()
        .map_or(cap, |limit| cap.min(limit)) as usize
}

/// Report data gathered while a file runs.
#[derive(Debug, Default)]
struct SessionLog {
    failovers: Vec<Failover>,
    segment: Option<usize>,
    mirror: Option<Mirror>,
    signature: Option<SignatureVerdict>,
    stats: TransferStats,
}

impl SessionLog {
    fn absorb(&mut self, transfer: &Transfer<'_>) {
        self.failovers = transfer.failovers.clone();
        self.stats.bytes_transferred = transfer.ctx.transferred();
        self.stats.requests += transfer.ctx.requests();
        if let Some(segment) = transfer.failed_segment {
            self.segment = Some(segment);
            self.mirror = transfer
                .last_mirror
                .get(&segment)
                .map(|&id| transfer.live.mirrors[id].clone());
        }
    }
}

/// The downloading phase of one file: plan, scheduler, resume state and the
/// pool of segment workers.
struct Transfer<'a> {
    coordinator: &'a DownloadCoordinator,
    live: LiveEntry,
    plan: SegmentPlan,
    adapters: Vec<Option<Arc<dyn TransportAdapter>>>,
    scheduler: Scheduler,
    store: Option<ResumeStore>,
    state: ResumeState,
    pending: VecDeque<usize>,
    ctx: Arc<WorkerContext>,
    failovers: Vec<Failover>,
    last_mirror: HashMap<usize, MirrorId>,
    integrity_failures: HashMap<usize, IntegrityError>,
    failed_segment: Option<usize>,
    last_modified: Option<i64>,
    segments_resumed: usize,
    bytes_resumed: u64,
}

impl<'a> Transfer<'a> {
    async fn prepare(
        coordinator: &'a DownloadCoordinator,
        entry: &FileEntry,
        live: LiveEntry,
        destination: &Path,
        paths: ResumePaths,
    ) -> Result<Self, MetadlError> {
        let config = &coordinator.config;
        let adapters: Vec<Option<Arc<dyn TransportAdapter>>> = live
            .mirrors
            .iter()
            .map(|m| coordinator.transports.for_mirror(m).ok())
            .collect();
        let ranged = adapters
            .iter()
            .flatten()
            .filter(|a| a.supports_range())
            .count();
        let chunks: Vec<(u64, HashDigest)> = entry
            .chunks
            .iter()
            .map(|c| c.length)
            .zip(live.chunk_digests.iter().cloned())
            .collect();
        let plan = SegmentPlanner::new(config.max_connections, config.min_segment_size).plan(
            live.size,
            &chunks,
            ranged,
        );
        debug!(mode = ?plan.mode, segments = plan.segments.len(), ranged, "Planned segments");

        let selector = MirrorSelector::new(
            config.preferred_location.clone(),
            config.max_mirror_failures,
        );
        let scheduler = Scheduler::new(
            selector,
            plan.segments.len(),
            config.max_connections as usize,
            config.max_mirrors_per_segment,
            config.max_attempts_per_mirror,
        );
        let store = if config.resume_enabled && plan.is_segmented() {
            Some(ResumeStore::new(paths, Fingerprint::of(entry)?, plan.layout()))
        } else {
            None
        };
        let ctx = Arc::new(WorkerContext {
            file: entry.name.clone(),
            destination: destination.to_path_buf(),
            verifier: coordinator.verifier,
            stall_timeout: config.stall_timeout,
            events: coordinator.events.clone(),
            file_span: Span::current(),
            transferred: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        });

        let mut transfer = Self {
            coordinator,
            live,
            plan,
            adapters: Vec::with_capacity(adapters.len()),
            scheduler,
            store,
            state: ResumeState::default(),
            pending: VecDeque::new(),
            ctx,
            failovers: Vec::new(),
            last_mirror: HashMap::new(),
            integrity_failures: HashMap::new(),
            failed_segment: None,
            last_modified: None,
            segments_resumed: 0,
            bytes_resumed: 0,
        };
        for adapter in adapters {
            transfer.register_mirror(adapter);
        }

        transfer.restore().await?;
        prepare_destination(destination, transfer.live.size)
            .await
            .map_err(|e| {
                MetadlError::io_with_context(
                    e,
                    format!("Failed to prepare {}", destination.display()),
                )
            })?;
        transfer.persist().await?;

        transfer.pending = transfer
            .plan
            .segments
            .iter()
            .map(|s| s.index)
            .filter(|&i| !transfer.state.is_complete(i))
            .collect();
        transfer.ctx.file_span.pb_set_length(transfer.live.size.unwrap_or(0));
        transfer.ctx.file_span.pb_set_position(transfer.bytes_resumed);
        Ok(transfer)
    }

    fn register_mirror(&mut self, adapter: Option<Arc<dyn TransportAdapter>>) {
        let id = self.adapters.len();
        let mirror = &self.live.mirrors[id];
        match &adapter {
            Some(a) => {
                let cap = mirror_cap(&self.coordinator.config, mirror, a.as_ref());
                self.scheduler.add_mirror(cap, a.supports_range());
            }
            None => {
                debug!(mirror = %mirror.url, "No transport for mirror, skipping it");
                self.scheduler.add_mirror(1, false);
                self.scheduler.exclude(id);
            }
        }
        self.adapters.push(adapter);
    }

    /// Loads the resume record and re-hashes chunk segments it claims.
    async fn restore(&mut self) -> Result<(), MetadlError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match store.load(&self.ctx.destination).await? {
            ResumeLoad::Fresh => {}
            ResumeLoad::Discarded(reason) => info!(%reason, "Starting over"),
            ResumeLoad::Resumed(state) => self.state = state,
        }

        if self.coordinator.config.verify_resumed_segments {
            let claimed: Vec<usize> = self.state.completed.iter().copied().collect();
            for index in claimed {
                let segment = &self.plan.segments[index];
                let (Some(digest), Some(length)) = (&segment.checksum, segment.length) else {
                    continue;
                };
                let verdict = self
                    .coordinator
                    .verifier
                    .verify_range(&self.ctx.destination, segment.offset, length, digest)
                    .await;
                match verdict {
                    Ok(v) if v.passed => {}
                    Ok(_) => {
                        warn!(segment = index, "Resumed segment no longer verifies");
                        self.state.mark_incomplete(index);
                    }
                    Err(e) => {
                        warn!(segment = index, "Resumed segment unreadable: {}", e);
                        self.state.mark_incomplete(index);
                    }
                }
            }
        }

        self.segments_resumed = self.state.completed.len();
        self.bytes_resumed = self
            .state
            .completed
            .iter()
            .filter_map(|&i| self.plan.segments[i].length)
            .sum::<u64>()
            + self.state.partial.values().sum::<u64>();
        Ok(())
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), MetadlError> {
        let child = cancel.child_token();
        let mut join_set: JoinSet<AttemptResult> = JoinSet::new();
        let mut fatal: Option<MetadlError> = None;

        loop {
            if fatal.is_none() && !child.is_cancelled() {
                if let Err(e) = self.fill_capacity(&mut join_set, &child) {
                    fatal = Some(e);
                    child.cancel();
                }
            }
            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let handled = match joined {
                Ok(result) => self.handle_result(result).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = handled {
                fatal.get_or_insert(e);
                child.cancel();
            }
        }

        if let Some(e) = fatal {
            self.abandon().await;
            return Err(e);
        }
        if self.is_complete() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            info!("Cancelled, progress kept for a later run");
            if let Err(e) = self.persist().await {
                warn!("Failed to save progress: {}", e);
            }
            return Err(MetadlError::Cancelled);
        }
        let segment = self.pending.front().copied().unwrap_or_default();
        self.failed_segment = Some(segment);
        self.abandon().await;
        Err(MetadlError::ConcurrencyExhaustion {
            segment,
            mirrors_tried: self.scheduler.mirrors_tried(segment),
        })
    }

    fn is_complete(&self) -> bool {
        self.plan
            .segments
            .iter()
            .all(|s| self.state.is_complete(s.index))
    }

    fn fill_capacity(
        &mut self,
        join_set: &mut JoinSet<AttemptResult>,
        cancel: &CancellationToken,
    ) -> Result<(), MetadlError> {
        let needs_range = self.plan.is_segmented();
        let mut deferred = Vec::new();
        while self.scheduler.has_capacity() {
            let Some(index) = self.pending.pop_front() else {
                break;
            };
            match self.scheduler.pick(&self.live.mirrors, index, needs_range) {
                Pick::Assign(assignment) => {
                    self.spawn_attempt(index, assignment, join_set, cancel)
                }
                Pick::Wait => deferred.push(index),
                Pick::Exhausted {
                    mirrors_tried,
                    last_failure,
                } => {
                    self.failed_segment = Some(index);
                    self.pending.push_front(index);
                    let integrity = self.integrity_failures.remove(&index);
                    return Err(match (last_failure, integrity) {
                        (Some(FailureKind::Integrity), Some(e)) => e.into(),
                        _ => MetadlError::ConcurrencyExhaustion {
                            segment: index,
                            mirrors_tried,
                        },
                    });
                }
            }
        }
        for index in deferred.into_iter().rev() {
            self.pending.push_front(index);
        }
        Ok(())
    }

    fn spawn_attempt(
        &mut self,
        index: usize,
        assignment: Assignment,
        join_set: &mut JoinSet<AttemptResult>,
        cancel: &CancellationToken,
    ) {
        let Some(adapter) = self.adapters.get(assignment.mirror).cloned().flatten() else {
            self.scheduler.exclude(assignment.mirror);
            self.pending.push_front(index);
            return;
        };
        let mirror = self.live.mirrors[assignment.mirror].clone();

        if let Some(from) = assignment.failover_from {
            let from = self.live.mirrors[from].url.to_string();
            let to = mirror.url.to_string();
            info!(segment = index, %from, %to, "Moving segment to another mirror");
            self.ctx.events.emit(DownloadEvent::MirrorFailover {
                file: self.ctx.file.clone(),
                segment: index,
                from: from.clone(),
                to: to.clone(),
            });
            self.failovers.push(Failover {
                segment: index,
                from,
                to,
            });
        }
        let backoff = match assignment.attempt_on_mirror {
            0 | 1 => None,
            n => self
                .coordinator
                .config
                .segment_retry_policy()
                .delay_for(n - 2),
        };

        self.scheduler.start(index, &assignment);
        self.last_mirror.insert(index, assignment.mirror);
        if let Ok(protocol) = mirror.resolve_protocol() {
            self.ctx.events.emit(DownloadEvent::SegmentStarted {
                file: self.ctx.file.clone(),
                segment: index,
                mirror: mirror.url.to_string(),
                protocol,
            });
        }

        let span = info_span!("segment", index, mirror = %mirror.url);
        let job = SegmentJob {
            segment: self.plan.segments[index].clone(),
            mirror_id: assignment.mirror,
            mirror,
            adapter,
            resume_from: self.state.partial(index),
            backoff,
            expected_size: self.live.size,
            single_segment: self.plan.segments.len() == 1,
        };
        join_set.spawn(
            worker::fetch_segment(Arc::clone(&self.ctx), job, cancel.clone()).instrument(span),
        );
    }

    async fn handle_result(&mut self, result: AttemptResult) -> Result<(), MetadlError> {
        let AttemptResult {
            segment,
            mirror_id,
            received,
            continuable,
            info,
            outcome,
        } = result;
        if let Some(info) = info {
            if let Err(e) = self.absorb_info(info) {
                self.scheduler.finish_cancelled(mirror_id);
                self.failed_segment = Some(segment);
                return Err(e);
            }
        }

        match outcome {
            Ok(()) => {
                self.scheduler.finish_success(mirror_id);
                self.state.mark_complete(segment);
                debug!(segment, mirror = %self.live.mirrors[mirror_id].url, "Segment verified");
                self.ctx.events.emit(DownloadEvent::SegmentCompleted {
                    file: self.ctx.file.clone(),
                    segment,
                });
            }
            Err(AttemptError::Cancelled) => {
                self.scheduler.finish_cancelled(mirror_id);
                if continuable && self.plan.is_segmented() {
                    self.state.set_partial(segment, received);
                }
            }
            Err(AttemptError::Local(e)) => {
                self.scheduler.finish_cancelled(mirror_id);
                self.failed_segment = Some(segment);
                return Err(e);
            }
            Err(AttemptError::Transport(e)) => {
                let kept = if continuable && self.plan.is_segmented() {
                    received
                } else {
                    0
                };
                self.state.set_partial(segment, kept);
                self.record_failure(
                    segment,
                    mirror_id,
                    FailureKind::Transport,
                    !e.is_transient(),
                    e.to_string(),
                );
            }
            Err(AttemptError::Integrity(e)) => {
                self.state.set_partial(segment, 0);
                self.record_failure(
                    segment,
                    mirror_id,
                    FailureKind::Integrity,
                    false,
                    e.to_string(),
                );
                self.integrity_failures.insert(segment, e);
            }
        }
        self.persist().await
    }

    fn record_failure(
        &mut self,
        segment: usize,
        mirror_id: MirrorId,
        kind: FailureKind,
        permanent: bool,
        reason: String,
    ) {
        let url = self.live.mirrors[mirror_id].url.to_string();
        warn!(segment, mirror = %url, "Segment attempt failed: {}", reason);
        self.ctx.events.emit(DownloadEvent::SegmentFailed {
            file: self.ctx.file.clone(),
            segment,
            mirror: url.clone(),
            reason,
        });
        let was_excluded = self.scheduler.selector().is_excluded(mirror_id);
        self.scheduler
            .finish_failure(segment, mirror_id, kind, permanent);
        if !was_excluded && self.scheduler.selector().is_excluded(mirror_id) {
            self.ctx.events.emit(DownloadEvent::MirrorExcluded {
                file: self.ctx.file.clone(),
                mirror: url,
            });
        }
        self.pending.push_front(segment);
    }

    /// Folds what a server told us into the live entry. Conflicting digests
    /// fail the file.
    fn absorb_info(&mut self, info: ResourceInfo) -> Result<(), MetadlError> {
        let added = self.live.merge_instance_digests(&info.instance_digests)?;
        if added > 0 {
            debug!(added, "Learned instance digests");
        }
        let known = self.live.mirrors.len();
        if self.live.merge_mirrors(info.mirrors) > 0 {
            for id in known..self.live.mirrors.len() {
                let adapter = self.coordinator.transports.for_mirror(&self.live.mirrors[id]).ok();
                debug!(mirror = %self.live.mirrors[id].url, "Learned mirror from server");
                self.register_mirror(adapter);
            }
        }
        if info.last_modified.is_some() {
            self.last_modified = info.last_modified;
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), MetadlError> {
        match &self.store {
            Some(store) => store.save(&self.state).await,
            None => Ok(()),
        }
    }

    /// Keeps progress for a later run, or drops everything, per
    /// `keep_partial_on_failure`.
    async fn abandon(&self) {
        if self.coordinator.config.keep_partial_on_failure {
            if let Err(e) = self.persist().await {
                warn!("Failed to save progress: {}", e);
            }
        } else {
            self.discard(true).await;
        }
    }

    /// Drops the resume record and, when `remove_bytes`, the destination.
    async fn discard(&self, remove_bytes: bool) {
        if let Some(store) = &self.store {
            if let Err(e) = store.clear().await {
                warn!("Failed to remove resume record: {}", e);
            }
        }
        if remove_bytes {
            if let Err(e) = remove_file_if_exists(&self.ctx.destination).await {
                warn!("Failed to remove {}: {}", self.ctx.destination.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfigBuilder;
    use crate::descriptor::{Chunk, Protocol};
    use crate::error::TransportError;
    use crate::hash::encode_hex;
    use crate::transport::{ByteRange, ByteStream, FetchRequest, FetchStream};
    use futures::StreamExt;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sha2::{Digest, Sha256};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct Behavior {
        delay: Duration,
        /// range start -> failures served before succeeding
        fail_times: HashMap<u64, u32>,
        always_fail: bool,
        /// absolute offsets served with the byte flipped
        corrupt: Vec<u64>,
        /// range start -> streams cut after their first half
        cut_times: HashMap<u64, u32>,
        /// a cut stream hangs instead of erroring
        cut_stalls: bool,
    }

    #[derive(Default)]
    struct FakeLog {
        requests: Vec<(String, u64)>,
        failures_served: HashMap<(String, u64), u32>,
        cuts_served: HashMap<(String, u64), u32>,
    }

    /// Serves `data` for every mirror host, shaped by per-host behaviour.
    struct FakeTransport {
        data: Vec<u8>,
        behaviors: HashMap<String, Behavior>,
        log: Mutex<FakeLog>,
    }

    impl FakeTransport {
        fn new(data: &[u8], behaviors: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                data: data.to_vec(),
                behaviors: behaviors
                    .iter()
                    .map(|(h, b)| (h.to_string(), b.clone()))
                    .collect(),
                log: Mutex::new(FakeLog::default()),
            })
        }

        fn requests(&self) -> Vec<(String, u64)> {
            self.log.lock().unwrap().requests.clone()
        }

        fn starts_for(&self, host: &str) -> Vec<u64> {
            self.requests()
                .into_iter()
                .filter(|(h, _)| h == host)
                .map(|(_, start)| start)
                .collect()
        }

        fn info(&self) -> ResourceInfo {
            ResourceInfo {
                total_size: Some(self.data.len() as u64),
                supports_range: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TransportAdapter for FakeTransport {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn supports_range(&self) -> bool {
            true
        }

        async fn probe(&self, _mirror: &Mirror) -> Result<ResourceInfo, TransportError> {
            Ok(self.info())
        }

        async fn open(&self, request: &FetchRequest) -> Result<FetchStream, TransportError> {
            let host = request.mirror.url.host_str().unwrap_or_default().to_string();
            let ByteRange { start, end } = request.range;
            let behavior = self.behaviors.get(&host).cloned().unwrap_or_default();
            let (should_fail, cut) = {
                let mut log = self.log.lock().unwrap();
                log.requests.push((host.clone(), start));
                let served = log.failures_served.entry((host.clone(), start)).or_insert(0);
                let budget = behavior.fail_times.get(&start).copied().unwrap_or(0);
                let should_fail = if behavior.always_fail || *served < budget {
                    *served += 1;
                    true
                } else {
                    false
                };
                let cuts = log.cuts_served.entry((host.clone(), start)).or_insert(0);
                let cut = *cuts < behavior.cut_times.get(&start).copied().unwrap_or(0);
                if cut {
                    *cuts += 1;
                }
                (should_fail, cut)
            };
            tokio::time::sleep(behavior.delay).await;
            if should_fail {
                return Err(TransportError::transient(format!("{} refused", host)));
            }
            let end = end.unwrap_or(self.data.len() as u64);
            let mut body = self.data[start as usize..end as usize].to_vec();
            for offset in behavior.corrupt {
                if (start..end).contains(&offset) {
                    body[(offset - start) as usize] ^= 0xff;
                }
            }
            // two pieces to exercise incremental hashing
            let mid = body.len() / 2;
            let second = body.split_off(mid);
            let body: ByteStream = match (cut, behavior.cut_stalls) {
                (false, _) => Box::pin(futures::stream::iter(vec![
                    Ok(Bytes::from(body)),
                    Ok(Bytes::from(second)),
                ])),
                (true, false) => Box::pin(futures::stream::iter(vec![
                    Ok(Bytes::from(body)),
                    Err(TransportError::transient(format!("{} reset", host))),
                ])),
                (true, true) => Box::pin(
                    futures::stream::iter(vec![Ok(Bytes::from(body))])
                        .chain(futures::stream::pending()),
                ),
            };
            Ok(FetchStream {
                info: self.info(),
                body,
            })
        }
    }

    fn payload() -> Vec<u8> {
        (0..250u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn sha256_hex(data: &[u8]) -> String {
        encode_hex(&Sha256::digest(data))
    }

    /// Chunks [100, 100, 50] served by mirrors `a` (preference 1) and `b`
    /// (preference 2).
    fn chunked_entry(data: &[u8]) -> FileEntry {
        let mut entry = FileEntry::new("data.bin");
        entry.size = Some(data.len() as u64);
        entry
            .whole_checksums
            .insert("sha-256".to_string(), sha256_hex(data));
        let mut offset = 0;
        for length in [100usize, 100, 50] {
            entry.chunks.push(Chunk {
                length: length as u64,
                checksum: sha256_hex(&data[offset..offset + length]),
                algorithm: "sha-256".to_string(),
            });
            offset += length;
        }
        entry.mirrors = vec![
            Mirror::parse("http://a.example.com/data.bin", 1).unwrap(),
            Mirror::parse("http://b.example.com/data.bin", 2).unwrap(),
        ];
        entry
    }

    fn config() -> EngineConfigBuilder {
        let mut builder = EngineConfigBuilder::default();
        builder
            .wait_between_retries(Duration::from_millis(10))
            .stall_timeout(Duration::from_secs(5))
            .preferred_location(None);
        builder
    }

    fn coordinator(config: &EngineConfigBuilder, fake: Arc<FakeTransport>) -> DownloadCoordinator {
        let mut transports = Transports::new();
        transports.register(Protocol::Http, fake);
        DownloadCoordinator::with_transports(config.build().unwrap(), transports)
    }

    async fn save_record(
        entry: &FileEntry,
        dest: &Path,
        completed: &[usize],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = ResumeStore::new(
            ResumePaths::for_destination(dest, None),
            Fingerprint::of(entry)?,
            vec![(0, 100), (100, 100), (200, 50)],
        );
        let mut state = ResumeState::default();
        for &index in completed {
            state.mark_complete(index);
        }
        store.save(&state).await?;
        Ok(())
    }

    #[tokio::test]
    async fn failing_segment_moves_to_other_mirror_once() -> Result<(), Box<dyn std::error::Error>>
    {
        let data = payload();
        let fake = FakeTransport::new(
            &data,
            &[
                (
                    "a.example.com",
                    Behavior {
                        delay: Duration::from_millis(300),
                        ..Default::default()
                    },
                ),
                (
                    "b.example.com",
                    Behavior {
                        fail_times: HashMap::from([(200, 2)]),
                        ..Default::default()
                    },
                ),
            ],
        );
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let report = coordinator(&config(), fake.clone())
            .download(&chunked_entry(&data), &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        assert_eq!(
            report.failovers,
            vec![Failover {
                segment: 2,
                from: "http://b.example.com/data.bin".to_string(),
                to: "http://a.example.com/data.bin".to_string(),
            }]
        );
        assert_eq!(fake.starts_for("b.example.com"), vec![100, 200, 200]);
        assert_eq!(fake.starts_for("a.example.com"), vec![0, 200]);
        assert_eq!(report.stats.bytes_transferred, 250);
        assert!(!ResumePaths::for_destination(&dest, None).record.exists());
        Ok(())
    }

    #[tokio::test]
    async fn resumed_segments_are_not_requested_again() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let entry = chunked_entry(&data);
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let mut on_disk = data[..200].to_vec();
        on_disk.resize(250, 0);
        tokio::fs::write(&dest, &on_disk).await?;
        save_record(&entry, &dest, &[0, 1]).await?;

        let fake = FakeTransport::new(&data, &[]);
        let report = coordinator(&config(), fake.clone())
            .download(&entry, &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        let starts: Vec<u64> = fake.requests().into_iter().map(|(_, s)| s).collect();
        assert_eq!(starts, vec![200]);
        assert_eq!(report.stats.segments_resumed, 2);
        assert_eq!(report.stats.bytes_resumed, 200);
        assert_eq!(report.stats.bytes_transferred, 50);
        Ok(())
    }

    #[tokio::test]
    async fn stale_record_triggers_full_download() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let entry = chunked_entry(&data);
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        tokio::fs::write(&dest, vec![0xAAu8; 250]).await?;
        let mut other = entry.clone();
        other.mirrors.pop();
        save_record(&other, &dest, &[0, 1, 2]).await?;

        let fake = FakeTransport::new(&data, &[]);
        let report = coordinator(&config(), fake.clone())
            .download(&entry, &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        let mut starts: Vec<u64> = fake.requests().into_iter().map(|(_, s)| s).collect();
        starts.sort();
        assert_eq!(starts, vec![0, 100, 200]);
        assert_eq!(report.stats.segments_resumed, 0);
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_segment_is_refetched_elsewhere() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let fake = FakeTransport::new(
            &data,
            &[(
                "a.example.com",
                Behavior {
                    corrupt: vec![150],
                    ..Default::default()
                },
            )],
        );
        let mut config = config();
        config.max_connections(1);
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let report = coordinator(&config, fake.clone())
            .download(&chunked_entry(&data), &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        assert_eq!(fake.starts_for("b.example.com"), vec![100]);
        assert_eq!(report.failovers.len(), 1);
        assert_eq!(report.failovers[0].segment, 1);
        Ok(())
    }

    #[tokio::test]
    async fn survivors_finish_when_one_mirror_always_fails() -> Result<(), Box<dyn std::error::Error>>
    {
        let data = payload();
        let fake = FakeTransport::new(
            &data,
            &[(
                "a.example.com",
                Behavior {
                    always_fail: true,
                    ..Default::default()
                },
            )],
        );
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let report = coordinator(&config(), fake)
            .download(&chunked_entry(&data), &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn every_mirror_failing_exhausts_the_segment() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let broken = Behavior {
            always_fail: true,
            ..Default::default()
        };
        let fake = FakeTransport::new(
            &data,
            &[("a.example.com", broken.clone()), ("b.example.com", broken)],
        );
        let mut config = config();
        config.keep_partial_on_failure(false);
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let report = coordinator(&config, fake)
            .download(&chunked_entry(&data), &dest, &CancellationToken::new())
            .await;

        let failure = report.failure().expect("download should fail");
        assert!(matches!(
            failure.cause,
            MetadlError::ConcurrencyExhaustion { .. }
        ));
        assert!(failure.segment.is_some());
        assert!(!dest.exists());
        assert!(!ResumePaths::for_destination(&dest, None).record.exists());
        Ok(())
    }

    #[tokio::test]
    async fn verified_existing_file_needs_no_requests() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        tokio::fs::write(&dest, &data).await?;
        let fake = FakeTransport::new(&data, &[]);
        let report = coordinator(&config(), fake.clone())
            .download(&chunked_entry(&data), &dest, &CancellationToken::new())
            .await;
        assert!(report.is_completed());
        assert!(fake.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unsized_entry_is_probed_then_split() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let mut entry = chunked_entry(&data);
        entry.chunks.clear();
        entry.size = None;
        let fake = FakeTransport::new(&data, &[]);
        let mut config = config();
        config.min_segment_size(100);
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let report = coordinator(&config, fake.clone())
            .download(&entry, &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        assert_eq!(report.stats.segments_total, 2);
        // two probes plus one request per segment
        assert_eq!(report.stats.requests, 4);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancellation() -> Result<(), Box<dyn std::error::Error>>
    {
        let data = payload();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let dir = tempdir()?;
        let fake = FakeTransport::new(&data, &[]);
        let report = coordinator(&config(), fake.clone())
            .download(&chunked_entry(&data), &dir.path().join("data.bin"), &cancel)
            .await;
        assert!(matches!(
            report.failure().map(|f| &f.cause),
            Some(MetadlError::Cancelled)
        ));
        assert!(fake.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn descriptor_entries_fail_independently() -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let good = chunked_entry(&data);
        let mut unsafe_name = chunked_entry(&data);
        unsafe_name.name = "../escape.bin".to_string();
        let descriptor = Descriptor::new(vec![unsafe_name, good]);

        let dir = tempdir()?;
        let fake = FakeTransport::new(&data, &[]);
        let reports = coordinator(&config(), fake)
            .download_descriptor(&descriptor, dir.path(), &CancellationToken::new())
            .await?;

        assert_eq!(reports.len(), 2);
        assert!(matches!(
            reports[0].failure().map(|f| &f.cause),
            Some(MetadlError::Descriptor(DescriptorError::UnsafeName { .. }))
        ));
        assert!(reports[1].is_completed());
        assert_eq!(tokio::fs::read(dir.path().join("data.bin")).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn cancelling_mid_transfer_keeps_finished_segments()
    -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let mut entry = chunked_entry(&data);
        entry
            .mirrors
            .push(Mirror::parse("http://c.example.com/data.bin", 3)?);
        let slow = Behavior {
            delay: Duration::from_secs(3),
            ..Default::default()
        };
        let fake = FakeTransport::new(
            &data,
            &[("b.example.com", slow.clone()), ("c.example.com", slow)],
        );
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                cancel.cancel();
            });
        }
        let started = Instant::now();
        let report = coordinator(&config(), fake.clone())
            .download(&entry, &dest, &cancel)
            .await;

        assert!(matches!(
            report.failure().map(|f| &f.cause),
            Some(MetadlError::Cancelled)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(ResumePaths::for_destination(&dest, None).record.exists());
        let mut starts: Vec<u64> = fake.requests().into_iter().map(|(_, s)| s).collect();
        starts.sort();
        assert_eq!(starts, vec![0, 100, 200]);

        let fresh = FakeTransport::new(&data, &[]);
        let report = coordinator(&config(), fresh.clone())
            .download(&entry, &dest, &CancellationToken::new())
            .await;
        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        let mut starts: Vec<u64> = fresh.requests().into_iter().map(|(_, s)| s).collect();
        starts.sort();
        assert_eq!(starts, vec![100, 200]);
        assert_eq!(report.stats.segments_resumed, 1);
        Ok(())
    }

    /// Segment 1 is cut after 50 bytes on `a`; the rest must come from `b`.
    async fn continue_cut_segment(stalls: bool) -> Result<(), Box<dyn std::error::Error>> {
        let data = payload();
        let fake = FakeTransport::new(
            &data,
            &[(
                "a.example.com",
                Behavior {
                    cut_times: HashMap::from([(100, 1)]),
                    cut_stalls: stalls,
                    ..Default::default()
                },
            )],
        );
        let mut config = config();
        config
            .max_connections(1)
            .stall_timeout(Duration::from_millis(300));
        let dir = tempdir()?;
        let dest = dir.path().join("data.bin");
        let report = coordinator(&config, fake.clone())
            .download(&chunked_entry(&data), &dest, &CancellationToken::new())
            .await;

        assert!(report.is_completed(), "{:?}", report.failure());
        assert_eq!(tokio::fs::read(&dest).await?, data);
        assert_eq!(fake.starts_for("a.example.com"), vec![0, 100, 200]);
        assert_eq!(fake.starts_for("b.example.com"), vec![150]);
        assert_eq!(
            report.failovers,
            vec![Failover {
                segment: 1,
                from: "http://a.example.com/data.bin".to_string(),
                to: "http://b.example.com/data.bin".to_string(),
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn reset_segment_continues_from_received_bytes() -> Result<(), Box<dyn std::error::Error>>
    {
        continue_cut_segment(false).await
    }

    #[tokio::test]
    async fn stalled_segment_continues_from_received_bytes()
    -> Result<(), Box<dyn std::error::Error>> {
        continue_cut_segment(true).await
    }

    #[tokio::test]
    async fn mirror_that_never_answers_times_out() -> Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut entry = FileEntry::new("hello.txt");
        entry.size = Some(11);
        entry
            .whole_checksums
            .insert("sha-256".to_string(), sha256_hex(b"hello world"));
        entry.mirrors = vec![Mirror::parse(
            &format!("http://127.0.0.1:{}/hello.txt", port),
            1,
        )?];
        let mut config = config();
        config
            .stall_timeout(Duration::from_millis(300))
            .http_retries(0);
        let coordinator = DownloadCoordinator::new(config.build()?)?;
        let dir = tempdir()?;
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.download(
                &entry,
                &dir.path().join("hello.txt"),
                &CancellationToken::new(),
            ),
        )
        .await?;

        let failure = report.failure().expect("silent mirror cannot complete");
        assert!(matches!(
            failure.cause,
            MetadlError::ConcurrencyExhaustion { .. }
        ));
        Ok(())
    }

    #[test]
    fn size_needs_agreement_when_several_mirrors_answer() {
        assert_eq!(agreed_size(&[]), None);
        assert_eq!(agreed_size(&[10]), Some(10));
        assert_eq!(agreed_size(&[10, 11]), None);
        assert_eq!(agreed_size(&[11, 10, 10]), Some(10));
    }
}
