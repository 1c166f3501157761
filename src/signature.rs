use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::descriptor::Signature;
use crate::error::MetadlError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureVerdict {
    pub passed: bool,
    /// Tool output describing the outcome.
    pub status: String,
}

/// Checks a detached signature against a finished file.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(
        &self,
        file: &Path,
        signature: &Signature,
    ) -> Result<SignatureVerdict, MetadlError>;
}

/// Runs `gpg --batch --verify` and reads its machine status lines.
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    program: PathBuf,
}

impl GpgVerifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for GpgVerifier {
    fn default() -> Self {
        Self::new("gpg")
    }
}

#[async_trait]
impl SignatureVerifier for GpgVerifier {
    async fn verify(
        &self,
        file: &Path,
        signature: &Signature,
    ) -> Result<SignatureVerdict, MetadlError> {
        let sig_file = tempfile::Builder::new()
            .prefix("metadl-sig-")
            .suffix(".asc")
            .tempfile()?;
        tokio::fs::write(sig_file.path(), signature.body.as_bytes()).await?;

        let output = Command::new(&self.program)
            .arg("--batch")
            .arg("--status-fd")
            .arg("1")
            .arg("--verify")
            .arg(sig_file.path())
            .arg(file)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                MetadlError::io_with_context(
                    e,
                    format!("Failed to run {}", self.program.display()),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let status_lines: Vec<&str> = stdout
            .lines()
            .filter_map(|l| l.strip_prefix("[GNUPG:] "))
            .collect();
        let good = status_lines
            .iter()
            .any(|l| l.starts_with("GOODSIG") || l.starts_with("VALIDSIG"));
        let bad = status_lines
            .iter()
            .any(|l| l.starts_with("BADSIG") || l.starts_with("ERRSIG"));

        let status = if status_lines.is_empty() {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        } else {
            status_lines.join("\n")
        };
        let passed = output.status.success() && good && !bad;
        debug!(file = %file.display(), passed, "Signature checked");
        Ok(SignatureVerdict { passed, status })
    }
}
