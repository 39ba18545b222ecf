pub mod export;
pub mod stats;

use std::path::PathBuf;

use std::collections::HashSet;

use chrono::{DateTime, Duration, DurationRound, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{keys, StagedWrite, StateStore, StoreResult};

pub use export::{ExportError, ExportResult, ExportRow, HistoryExport, EXPORT_HEADER};
pub use stats::{compute_stats, daily_totals, AggregateStats, DailyBucket};

/// One accounted clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEvent {
    pub path: PathBuf,
    pub duration: f64,
    pub timestamp: String,
    pub game_name: String,
}

impl VideoEvent {
    pub fn new(path: PathBuf, duration: f64, game_name: impl Into<String>) -> Self {
        Self::at(path, duration, game_name, Utc::now())
    }

    pub fn at(
        path: PathBuf,
        duration: f64,
        game_name: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            path,
            duration,
            timestamp: format_timestamp(recorded_at),
            game_name: game_name.into(),
        }
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    state: StateStore,
}

impl HistoryLog {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Oldest first.
    pub fn load(&self) -> StoreResult<Vec<VideoEvent>> {
        self.state.get_or(keys::VIDEOS, Vec::new())
    }

    pub fn stage(videos: &[VideoEvent]) -> StoreResult<StagedWrite> {
        StagedWrite::new(keys::VIDEOS, videos)
    }

    pub fn recent(&self, limit: usize) -> StoreResult<Vec<VideoEvent>> {
        Ok(recent_of(&self.load()?, limit))
    }

    pub fn find(&self, timestamp: &str) -> StoreResult<Option<VideoEvent>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|event| event.timestamp == timestamp))
    }
}

/// First millisecond at or after `now` whose timestamp no event in `videos`
/// already carries.
pub fn next_free_timestamp(videos: &[VideoEvent], now: DateTime<Utc>) -> DateTime<Utc> {
    let step = Duration::milliseconds(1);
    let taken: HashSet<&str> = videos.iter().map(|event| event.timestamp.as_str()).collect();
    let mut candidate = now.duration_trunc(step).unwrap_or(now);
    while taken.contains(format_timestamp(candidate).as_str()) {
        candidate += step;
    }
    candidate
}

/// Most-recent-first tail of `videos`.
pub fn recent_of(videos: &[VideoEvent], limit: usize) -> Vec<VideoEvent> {
    videos.iter().rev().take(limit).cloned().collect()
}
