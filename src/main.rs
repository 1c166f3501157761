use clap::Parser;
use metadl::{
    CheckReport, Checker, Config, Descriptor, DownloadCoordinator, DownloadReport, EngineConfig,
    MetadlError,
    config::{resolve_proxy, secs_to_duration},
    fs_utils::get_metadl_dir,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
mod args;
use args::Args;

#[tokio::main]
async fn main() -> Result<(), MetadlError> {
    let args = Args::parse();
    init_tracing();

    let text = tokio::fs::read_to_string(&args.descriptor)
        .await
        .map_err(|e| {
            MetadlError::io_with_context(
                e,
                format!("Failed to read descriptor {}", args.descriptor.display()),
            )
        })?;
    let descriptor = Descriptor::from_json(&text)?;
    let config = build_config(&args)?;

    let failed = if args.check {
        let reports = Checker::new(config.checker_workers)
            .check_descriptor(&descriptor, &args.output)
            .await?;
        reports.iter().filter(|r| !print_check(r)).count()
    } else {
        let coordinator = DownloadCoordinator::new(config)?;
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, saving progress");
                    cancel.cancel();
                }
            });
        }
        let reports = coordinator
            .download_descriptor(&descriptor, &args.output, &cancel)
            .await?;
        reports.iter().filter(|r| !print_download(r)).count()
    };

    if failed > 0 {
        eprintln!("{} file(s) failed", failed);
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();
}

/// Engine settings: `config.toml` in the data dir, overridden by arguments.
fn build_config(args: &Args) -> Result<EngineConfig, MetadlError> {
    let mut builder = Config::load_from_dir(get_metadl_dir())?.to_builder()?;
    if let Some(v) = args.max_connections {
        builder.max_connections(v);
    }
    if let Some(v) = &args.location {
        builder.preferred_location(Some(v.to_ascii_lowercase()));
    }
    if let Some(v) = &args.proxy {
        builder.proxy(Some(resolve_proxy(v)?));
    }
    if let Some(v) = args.retry {
        builder.http_retries(v);
    }
    if let Some(v) = args.waitretry {
        builder.wait_between_retries(secs_to_duration("--waitretry", v)?);
    }
    if let Some(v) = args.timeout {
        builder.stall_timeout(secs_to_duration("--timeout", v)?);
    }
    if let Some(v) = &args.user_agent {
        builder.user_agent(v.clone());
    }
    if args.no_resume {
        builder.resume_enabled(false);
    }
    if args.discard_partial {
        builder.keep_partial_on_failure(false);
    }
    if args.use_server_time {
        builder.use_server_time(true);
    }
    if args.accept_invalid_certs {
        builder.accept_invalid_certs(true);
    }
    if args.require_signature {
        builder.require_valid_signature(true);
    }
    if !args.headers.is_empty() {
        builder.headers(Some(parse_headers(&args.headers)?));
    }
    Ok(builder.build()?)
}

fn parse_headers(headers: &[String]) -> Result<HeaderMap, MetadlError> {
    let mut headers_map = HeaderMap::new();
    for header in headers {
        let Some((key, value)) = header.split_once(':') else {
            return Err(MetadlError::CliError {
                message: format!("Header must be in KEY:VALUE format: '{}'", header),
            });
        };
        let key = key.trim();
        let value = value.trim();
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| MetadlError::CliError {
            message: format!("Invalid header name: '{}'", key),
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| MetadlError::CliError {
            message: format!("Invalid header value for '{}': '{}'", key, value),
        })?;
        headers_map.append(name, value);
    }
    Ok(headers_map)
}

/// Prints one line for a downloaded file. Returns whether it completed.
fn print_download(report: &DownloadReport) -> bool {
    match report.failure() {
        None => {
            let stats = &report.stats;
            println!(
                "OK      {} ({} bytes, {} resumed, {:.1} KiB/s, {} failover(s))",
                report.path.display(),
                stats.bytes_transferred,
                stats.bytes_resumed,
                stats.throughput() / 1024.0,
                report.failovers.len(),
            );
            true
        }
        Some(failure) => {
            println!("FAILED  {}", failure);
            false
        }
    }
}

/// Prints one line for a checked file. Returns whether it passed.
fn print_check(report: &CheckReport) -> bool {
    if report.passed() {
        println!("OK      {}", report.path.display());
        return true;
    }
    let reason = match report.actual_size {
        None => "missing".to_string(),
        Some(actual) if !report.size_ok() => format!(
            "size {} does not match {}",
            actual,
            report.expected_size.unwrap_or_default()
        ),
        Some(_) => {
            let failed: Vec<String> = report
                .failed_chunks()
                .map(|c| c.index.to_string())
                .collect();
            if failed.is_empty() {
                "whole-file checksum mismatch".to_string()
            } else {
                format!("chunk(s) {} corrupt", failed.join(", "))
            }
        }
    };
    println!("FAILED  {}: {}", report.path.display(), reason);
    false
}
