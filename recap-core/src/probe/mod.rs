//! Container duration probing.
//!
//! A recording tool keeps the MP4 trailer open until it stops writing, so
//! probing an in-progress file fails with a recognisable diagnostic. Those
//! failures are retried by [`RetryPolicy`]; everything else is final.

mod retry;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexSet;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ProbeSection;

pub use retry::{Disposition, RetryError, RetryOutcome, RetryPolicy};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("probe exited with status {status:?}: {stderr}")]
    Tool { status: Option<i32>, stderr: String },
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe returned an unusable duration: {0:?}")]
    InvalidDuration(String),
    #[error("invalid incomplete-container signature: {0}")]
    Signature(#[from] regex::Error),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

/// ffprobe's diagnostic for an MP4 whose index has not been written yet.
pub const MOOV_ATOM_MISSING: &str = "moov atom not found";

#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// Single attempt; never retries on its own.
    async fn probe(&self, path: &Path) -> ProbeResult<f64>;
}

/// Maps raw probe failures onto retry decisions.
#[derive(Debug, Clone)]
pub struct ProbeClassifier {
    incomplete: RegexSet,
}

impl ProbeClassifier {
    pub fn new<I, S>(signatures: I) -> ProbeResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            incomplete: RegexSet::new(signatures)?,
        })
    }

    pub fn from_config(config: &ProbeSection) -> ProbeResult<Self> {
        Self::new(&config.incomplete_signatures)
    }

    pub fn is_incomplete(&self, error: &ProbeError) -> bool {
        match error {
            ProbeError::Tool { stderr, .. } => self.incomplete.is_match(stderr),
            ProbeError::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn classify(&self, error: &ProbeError) -> Disposition {
        if self.is_incomplete(error) {
            Disposition::Retry
        } else {
            Disposition::Abort
        }
    }
}

impl Default for ProbeClassifier {
    fn default() -> Self {
        Self {
            incomplete: RegexSet::new([MOOV_ATOM_MISSING]).unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

/// Parses ffprobe's bare `format=duration` output.
pub fn parse_duration(stdout: &str) -> ProbeResult<f64> {
    let raw = stdout.trim();
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(ProbeError::InvalidDuration(raw.to_string())),
    }
}

#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ProbeSection) -> Self {
        Self::new(
            &config.ffprobe_path,
            Duration::from_secs(config.timeout_seconds.max(1)),
        )
    }

    fn command(&self, path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .kill_on_drop(true)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path);
        command
    }
}

#[async_trait]
impl DurationProbe for FfprobeProber {
    async fn probe(&self, path: &Path) -> ProbeResult<f64> {
        let mut command = self.command(path);
        let output = match timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ProbeError::Spawn {
                    program: self.program.clone(),
                    source,
                })
            }
            Err(_) => return Err(ProbeError::Timeout(self.timeout)),
        };
        if !output.status.success() {
            return Err(ProbeError::Tool {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_duration(&String::from_utf8_lossy(&output.stdout))
    }
}
