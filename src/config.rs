use derive_builder::Builder;
use reqwest::{Proxy, header::HeaderMap};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use crate::error::MetadlError;
use crate::mirror::location_from_locale;
use crate::planner::DEFAULT_MIN_SEGMENT_SIZE;
use crate::retry_policies::FixedThenExponentialRetry;

pub const DEFAULT_USER_AGENT: &str = concat!("metadl/", env!("CARGO_PKG_VERSION"));

/// Persistent configuration read from `config.toml`. Fields are optional so
/// that unspecified values fall back to engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub max_connections: Option<u64>,
    pub connections_per_mirror: Option<u32>,
    pub max_concurrent_files: Option<usize>,
    pub max_retries: Option<u32>,
    /// wait between retries in seconds (can be fractional)
    pub wait_between_retries_secs: Option<f64>,
    /// connect timeout in seconds (can be fractional)
    pub connect_timeout_secs: Option<f64>,
    /// seconds without a received byte before a transfer counts as stalled
    pub stall_timeout_secs: Option<f64>,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    /// two-letter country code used to prefer nearby mirrors
    pub location: Option<String>,
    pub use_server_time: Option<bool>,
    pub accept_invalid_certs: Option<bool>,
    pub keep_partial_on_failure: Option<bool>,
    pub resume: Option<bool>,
    pub require_signature: Option<bool>,
    pub state_dir: Option<PathBuf>,
    pub rsync_program: Option<PathBuf>,
    pub gpg_program: Option<PathBuf>,
}

impl Config {
    /// Path to the config file inside the provided data dir.
    pub fn config_path_for_dir<P: AsRef<Path>>(data_dir: P) -> PathBuf {
        data_dir.as_ref().join("config.toml")
    }

    /// Load configuration from the given directory's `config.toml`.
    /// If file does not exist, returns Ok(Default::default()).
    pub fn load_from_dir<P: AsRef<Path>>(data_dir: P) -> Result<Config, io::Error> {
        let path = Config::config_path_for_dir(data_dir);
        if !path.exists() {
            return Ok(Config::default());
        }
        let s = fs::read_to_string(&path)?;
        toml::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Save configuration to `data_dir/config.toml`. Creates parent dir if needed.
    pub fn save_to_dir<P: AsRef<Path>>(&self, data_dir: P) -> Result<(), io::Error> {
        let cfg_path = Config::config_path_for_dir(data_dir);
        if let Some(p) = cfg_path.parent() {
            fs::create_dir_all(p)?;
        }
        let s = toml::to_string_pretty(&self).map_err(io::Error::other)?;
        fs::write(cfg_path, s)
    }

    /// Starts an engine builder from the values present in this file.
    pub fn to_builder(&self) -> Result<EngineConfigBuilder, MetadlError> {
        let mut builder = EngineConfigBuilder::default();
        if let Some(v) = self.max_connections {
            builder.max_connections(v);
        }
        if let Some(v) = self.connections_per_mirror {
            builder.connections_per_mirror(v);
        }
        if let Some(v) = self.max_concurrent_files {
            builder.max_concurrent_files(v);
        }
        if let Some(v) = self.max_retries {
            builder.http_retries(v);
        }
        if let Some(v) = self.wait_between_retries_secs {
            builder.wait_between_retries(secs_to_duration("wait_between_retries_secs", v)?);
        }
        if let Some(v) = self.connect_timeout_secs {
            builder.connect_timeout(secs_to_duration("connect_timeout_secs", v)?);
        }
        if let Some(v) = self.stall_timeout_secs {
            builder.stall_timeout(secs_to_duration("stall_timeout_secs", v)?);
        }
        if let Some(v) = &self.user_agent {
            builder.user_agent(v.clone());
        }
        if let Some(v) = &self.proxy {
            builder.proxy(Some(resolve_proxy(v)?));
        }
        if let Some(v) = &self.location {
            builder.preferred_location(Some(v.to_ascii_lowercase()));
        }
        if let Some(v) = self.use_server_time {
            builder.use_server_time(v);
        }
        if let Some(v) = self.accept_invalid_certs {
            builder.accept_invalid_certs(v);
        }
        if let Some(v) = self.keep_partial_on_failure {
            builder.keep_partial_on_failure(v);
        }
        if let Some(v) = self.resume {
            builder.resume_enabled(v);
        }
        if let Some(v) = self.require_signature {
            builder.require_valid_signature(v);
        }
        if let Some(v) = &self.state_dir {
            builder.state_dir(Some(v.clone()));
        }
        if let Some(v) = &self.rsync_program {
            builder.rsync_program(v.clone());
        }
        if let Some(v) = &self.gpg_program {
            builder.gpg_program(v.clone());
        }
        Ok(builder)
    }
}

pub fn secs_to_duration(field: &str, secs: f64) -> Result<Duration, MetadlError> {
    Duration::try_from_secs_f64(secs).map_err(|e| MetadlError::Config {
        message: format!("{} must be a non-negative number of seconds: {}", field, e),
    })
}

/// Parses a proxy URL once so every client shares the same value.
pub fn resolve_proxy(proxy: &str) -> Result<Proxy, MetadlError> {
    Proxy::all(proxy).map_err(|e| MetadlError::Config {
        message: format!("invalid proxy `{}`: {}", proxy, e),
    })
}

/// Immutable engine settings, built once and shared as `Arc<EngineConfig>`.
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Upper bound of concurrent segment fetches per file.
    #[builder(default = 5)]
    pub max_connections: u64,
    /// Concurrent fetches against one mirror unless the mirror says otherwise.
    #[builder(default = 1)]
    pub connections_per_mirror: u32,
    #[builder(default = DEFAULT_MIN_SEGMENT_SIZE)]
    pub min_segment_size: u64,
    /// Consecutive failures before a mirror is excluded for the session.
    #[builder(default = 3)]
    pub max_mirror_failures: u32,
    /// Distinct mirrors a single segment may be tried on.
    #[builder(default = 3)]
    pub max_mirrors_per_segment: usize,
    /// Attempts of one segment on one mirror.
    #[builder(default = 2)]
    pub max_attempts_per_mirror: u32,
    /// Retries performed by the HTTP middleware for a single request.
    #[builder(default = 3)]
    pub http_retries: u32,
    #[builder(default = Duration::from_millis(500))]
    pub wait_between_retries: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub connect_timeout: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub stall_timeout: Duration,
    #[builder(default = location_from_locale())]
    pub preferred_location: Option<String>,
    #[builder(default = None)]
    pub proxy: Option<Proxy>,
    /// Extra HTTP headers sent with every request.
    #[builder(default = None)]
    pub headers: Option<HeaderMap>,
    #[builder(default = DEFAULT_USER_AGENT.to_string())]
    pub user_agent: String,
    #[builder(default = false)]
    pub accept_invalid_certs: bool,
    /// Keep downloaded bytes of a failed file for a later resume.
    #[builder(default = true)]
    pub keep_partial_on_failure: bool,
    #[builder(default = true)]
    pub resume_enabled: bool,
    /// Where resume records live. Next to the destination when None.
    #[builder(default = None)]
    pub state_dir: Option<PathBuf>,
    #[builder(default = true)]
    pub allow_gzip: bool,
    #[builder(default = true)]
    pub probe_unknown_size: bool,
    /// Check the whole-file digest even when every chunk verified.
    #[builder(default = false)]
    pub always_verify_whole_file: bool,
    #[builder(default = true)]
    pub verify_resumed_segments: bool,
    /// Report an existing, verifying destination as completed without network.
    #[builder(default = true)]
    pub skip_existing_verified: bool,
    #[builder(default = 4)]
    pub checker_workers: usize,
    #[builder(default = 1)]
    pub max_concurrent_files: usize,
    #[builder(default = false)]
    pub use_server_time: bool,
    #[builder(default = false)]
    pub require_valid_signature: bool,
    #[builder(default = PathBuf::from("rsync"))]
    pub rsync_program: PathBuf,
    #[builder(default = PathBuf::from("gpg"))]
    pub gpg_program: PathBuf,
    /// Capacity of the progress event channel.
    #[builder(default = 1024)]
    pub event_buffer: usize,
}

impl EngineConfig {
    /// Policy for the HTTP middleware.
    pub fn http_retry_policy(&self) -> FixedThenExponentialRetry {
        FixedThenExponentialRetry::new(self.http_retries, self.wait_between_retries, 3)
    }

    /// Backoff between attempts of a segment on the mirror that just failed it.
    pub fn segment_retry_policy(&self) -> FixedThenExponentialRetry {
        FixedThenExponentialRetry::new(self.max_attempts_per_mirror, self.wait_between_retries, 1)
    }
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.connections_per_mirror == Some(0) {
            return Err("connections_per_mirror must be at least 1".to_string());
        }
        if self.min_segment_size == Some(0) {
            return Err("min_segment_size must be at least 1".to_string());
        }
        if self.max_mirrors_per_segment == Some(0) {
            return Err("max_mirrors_per_segment must be at least 1".to_string());
        }
        if self.max_attempts_per_mirror == Some(0) {
            return Err("max_attempts_per_mirror must be at least 1".to_string());
        }
        if self.checker_workers == Some(0) {
            return Err("checker_workers must be at least 1".to_string());
        }
        if self.max_concurrent_files == Some(0) {
            return Err("max_concurrent_files must be at least 1".to_string());
        }
        if self.stall_timeout == Some(Duration::ZERO) {
            return Err("stall_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfigBuilder::default().build().unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.max_mirror_failures, 3);
        assert_eq!(config.max_mirrors_per_segment, 3);
        assert_eq!(config.max_attempts_per_mirror, 2);
        assert_eq!(config.min_segment_size, 256 * 1024);
        assert!(config.resume_enabled);
        assert!(config.keep_partial_on_failure);
    }

    #[test]
    fn builder_rejects_zero_limits() {
        assert!(EngineConfigBuilder::default().max_connections(0).build().is_err());
        assert!(
            EngineConfigBuilder::default()
                .max_attempts_per_mirror(0)
                .build()
                .is_err()
        );
        let err: MetadlError = EngineConfigBuilder::default()
            .checker_workers(0)
            .build()
            .unwrap_err()
            .into();
        assert!(matches!(err, MetadlError::Config { .. }));
    }

    #[test]
    fn config_file_round_trips_and_feeds_builder() {
        let dir = tempdir().unwrap();
        let cfg = Config {
            max_connections: Some(8),
            wait_between_retries_secs: Some(0.25),
            location: Some("DE".to_string()),
            resume: Some(false),
            ..Default::default()
        };
        cfg.save_to_dir(dir.path()).unwrap();
        let loaded = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(loaded, cfg);

        let engine = loaded.to_builder().unwrap().build().unwrap();
        assert_eq!(engine.max_connections, 8);
        assert_eq!(engine.wait_between_retries, Duration::from_millis(250));
        assert_eq!(engine.preferred_location.as_deref(), Some("de"));
        assert!(!engine.resume_enabled);
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = tempdir().unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn negative_durations_and_bad_proxies_are_config_errors() {
        let cfg = Config {
            stall_timeout_secs: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(cfg.to_builder(), Err(MetadlError::Config { .. })));
        assert!(matches!(
            resolve_proxy("::not a url::"),
            Err(MetadlError::Config { .. })
        ));
    }
}
