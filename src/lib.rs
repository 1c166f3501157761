pub mod checker;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod fs_utils;
pub mod hash;
pub mod mirror;
pub mod planner;
mod response_info;
pub mod resume;
mod retry_policies;
pub mod signature;
pub mod transport;
pub mod verifier;

pub mod proto {
    pub mod resume_record;
}

pub use checker::{CheckReport, Checker};
pub use config::{Config, EngineConfig, EngineConfigBuilder};
pub use coordinator::{DownloadCoordinator, DownloadReport, DownloadStatus, FileFailure};
pub use descriptor::{Chunk, Descriptor, FileEntry, Mirror, Protocol};
pub use error::MetadlError;
pub use events::{DownloadEvent, DownloadState, EventSink};
pub use retry_policies::FixedThenExponentialRetry;
