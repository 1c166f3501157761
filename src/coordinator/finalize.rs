use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::descriptor::{LiveEntry, Signature};
use crate::error::{IntegrityError, MetadlError};
use crate::fs_utils::set_file_mtime_async;
use crate::planner::SegmentPlan;
use crate::signature::{SignatureVerdict, SignatureVerifier};
use crate::verifier::{ChecksumVerifier, Verdict};

/// Barrier check once every segment is written: size, then the whole-file
/// digest when chunks did not already cover it or `always` is set.
pub(crate) async fn verify_download(
    verifier: &ChecksumVerifier,
    live: &LiveEntry,
    plan: &SegmentPlan,
    destination: &Path,
    always: bool,
) -> Result<Option<Verdict>, MetadlError> {
    let actual = tokio::fs::metadata(destination)
        .await
        .map_err(|e| {
            MetadlError::io_with_context(
                e,
                format!("Failed to stat {} for verification", destination.display()),
            )
        })?
        .len();
    if let Some(expected) = live.size {
        if expected != actual {
            return Err(IntegrityError::SizeMismatch { expected, actual }.into());
        }
    }

    if plan.has_chunk_checksums() && !always {
        debug!(file = live.name(), "Every chunk verified, skipping whole-file digest");
        return Ok(None);
    }

    let verdict = verifier.verify_file(destination, &live.whole_digests).await?;
    match &verdict {
        Some(v) if !v.passed => Err(v.file_error().into()),
        Some(v) => {
            debug!(file = live.name(), algorithm = %v.algorithm, "Whole-file digest matches");
            Ok(verdict)
        }
        None => Ok(None),
    }
}

pub(crate) async fn apply_server_time(destination: &Path, mtime: i64) {
    match set_file_mtime_async(&destination, mtime).await {
        Ok(()) => debug!(mtime, "Applied server modification time"),
        Err(e) => warn!("Failed to set modification time of {}: {}", destination.display(), e),
    }
}

/// Runs the detached signature check. Only a rejection under `required`
/// fails the file; a verifier that cannot run is otherwise just logged.
pub(crate) async fn check_signature(
    verifier: &Arc<dyn SignatureVerifier>,
    destination: &Path,
    signature: &Signature,
    required: bool,
) -> Result<Option<SignatureVerdict>, MetadlError> {
    let verdict = match verifier.verify(destination, signature).await {
        Ok(verdict) => verdict,
        Err(e) if !required => {
            warn!("Signature of {} not checked: {}", destination.display(), e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    if verdict.passed {
        info!("Signature of {} is valid", destination.display());
    } else if required {
        return Err(IntegrityError::SignatureRejected {
            status: verdict.status,
        }
        .into());
    } else {
        warn!("Signature of {} rejected: {}", destination.display(), verdict.status);
    }
    Ok(Some(verdict))
}
