use async_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

use crate::descriptor::Protocol;

/// Lifecycle of one file download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    Planning,
    Downloading,
    Verifying,
    Completed,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    StateChanged {
        file: String,
        state: DownloadState,
    },
    SegmentStarted {
        file: String,
        segment: usize,
        mirror: String,
        protocol: Protocol,
    },
    Progress {
        file: String,
        segment: usize,
        bytes: u64,
    },
    SegmentCompleted {
        file: String,
        segment: usize,
    },
    SegmentFailed {
        file: String,
        segment: usize,
        mirror: String,
        reason: String,
    },
    MirrorFailover {
        file: String,
        segment: usize,
        from: String,
        to: String,
    },
    MirrorExcluded {
        file: String,
        mirror: String,
    },
}

/// Non-blocking progress publisher. Events are dropped when the channel is
/// full or nobody listens.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<DownloadEvent>>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel(capacity: usize) -> (Self, Receiver<DownloadEvent>) {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: DownloadEvent) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => trace!(?event, "Event channel full, dropping"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
