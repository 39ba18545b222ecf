use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Shortest settle window that still outlasts a recorder's final flush.
pub const MIN_STABILITY_SECONDS: u64 = 15;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RecapConfig {
    pub paths: PathsSection,
    pub watch: WatchSection,
    pub probe: ProbeSection,
    pub history: HistorySection,
    pub mirror: MirrorSection,
}

impl RecapConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.state_db)
    }

    pub fn export_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.export_file)
    }

    /// Rejects values that would make the pipeline spin or never settle.
    pub fn validate(&self) -> Result<()> {
        if self.watch.file_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "watch.file_name",
                reason: "must not be empty".into(),
            });
        }
        if self.watch.stability_seconds < MIN_STABILITY_SECONDS {
            return Err(ConfigError::Invalid {
                field: "watch.stability_seconds",
                reason: format!("must be at least {MIN_STABILITY_SECONDS}"),
            });
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "watch.poll_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if self.probe.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "probe.max_attempts",
                reason: "must be greater than zero".into(),
            });
        }
        self.history.week_start()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub data_dir: String,
    pub state_db: String,
    pub export_file: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            state_db: "recap.sqlite".into(),
            export_file: "recap_monitor_log.csv".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub file_name: String,
    pub stability_seconds: u64,
    pub poll_interval_ms: u64,
    pub notify_poll_seconds: u64,
}

impl WatchSection {
    pub fn stability(&self) -> Duration {
        Duration::from_secs(self.stability_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notify_poll_interval(&self) -> Duration {
        Duration::from_secs(self.notify_poll_seconds.max(1))
    }
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            file_name: "video.mp4".into(),
            stability_seconds: 15,
            poll_interval_ms: 100,
            notify_poll_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub ffprobe_path: String,
    pub max_attempts: usize,
    pub retry_interval_seconds: u64,
    pub timeout_seconds: u64,
    pub incomplete_signatures: Vec<String>,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            ffprobe_path: "ffprobe".into(),
            max_attempts: 720,
            retry_interval_seconds: 2,
            timeout_seconds: 30,
            incomplete_signatures: vec!["moov atom not found".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub recent_limit: usize,
    pub log_capacity: usize,
    pub load_log_limit: usize,
    pub week_start: String,
}

impl HistorySection {
    pub fn week_start(&self) -> Result<Weekday> {
        Weekday::from_str(self.week_start.trim()).map_err(|_| ConfigError::Invalid {
            field: "history.week_start",
            reason: format!("unknown weekday {:?}", self.week_start),
        })
    }
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            recent_limit: 5,
            log_capacity: 100,
            load_log_limit: 20,
            week_start: "sunday".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MirrorSection {
    pub enabled: bool,
    pub base_url: String,
    pub project_id: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for MirrorSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://firestore.googleapis.com/v1/".into(),
            project_id: String::new(),
            api_key: None,
            timeout_seconds: 15,
        }
    }
}

pub fn load_recap_config<P: AsRef<Path>>(path: P) -> Result<RecapConfig> {
    let config: RecapConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
