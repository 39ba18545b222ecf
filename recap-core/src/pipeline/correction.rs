use chrono::Local;
use serde::Serialize;
use tracing::debug;

use super::{IngestPipeline, PipelineResult};
use crate::events::ShellEvent;
use crate::goals::{find_goal, GoalSnapshot};
use crate::history::{compute_stats, recent_of, AggregateStats, HistoryLog, VideoEvent};
use crate::mirror::document_id;
use crate::store::{keys, StagedWrite};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionReport {
    pub stats: AggregateStats,
    /// Empty when nothing matched the timestamp.
    pub recent_videos: Vec<VideoEvent>,
    #[serde(skip)]
    pub removed: Option<VideoEvent>,
}

impl IngestPipeline {
    /// Deletes the event recorded at `timestamp` and reverses its credit.
    ///
    /// The file stays marked as processed. The flat export is regenerated
    /// from the remaining history instead of being edited in place.
    pub fn retract(&self, timestamp: &str) -> PipelineResult<CorrectionReport> {
        let inner = &self.inner;
        let (removed, videos, snapshot) = {
            let guard = inner.state.write_guard()?;
            let mut videos = inner.history.load()?;
            let Some(index) = videos.iter().position(|event| event.timestamp == timestamp) else {
                drop(guard);
                debug!(timestamp, "no history entry to retract");
                return Ok(CorrectionReport {
                    stats: self.stats()?,
                    recent_videos: Vec::new(),
                    removed: None,
                });
            };
            let removed = videos.remove(index);
            let mut goals = inner.goals.list()?;
            let mut writes = vec![HistoryLog::stage(&videos)?];
            let snapshot = match find_goal(&mut goals, &removed.game_name) {
                Some(goal) => {
                    goal.debit(removed.duration);
                    writes.push(StagedWrite::new(keys::GOALS, &goals)?);
                    Some(goals)
                }
                None => None,
            };
            inner.state.put_many(writes)?;
            (removed, videos, snapshot)
        };

        if let Err(err) = inner.export.rebuild(&videos) {
            inner
                .logbook
                .error(format!("Failed to regenerate history export: {err}"));
        }
        if let Some(goals) = snapshot {
            let active_goal = inner
                .goals
                .active_name()?
                .filter(|name| goals.iter().any(|goal| &goal.name == name));
            inner
                .events
                .emit(ShellEvent::MetaUpdate(GoalSnapshot { goals, active_goal }));
        }
        inner.logbook.info(format!(
            "Removed {:.0}s of {} recorded at {}",
            removed.duration, removed.game_name, removed.timestamp
        ));
        self.spawn_mirror_delete(&removed.timestamp);

        Ok(CorrectionReport {
            stats: compute_stats(&videos, &Local::now(), inner.week_start),
            recent_videos: recent_of(&videos, inner.recent_limit),
            removed: Some(removed),
        })
    }

    fn spawn_mirror_delete(&self, timestamp: &str) {
        let Some(mirror) = self.inner.mirror.clone() else {
            return;
        };
        let Some(identity) = self.sync_identity() else {
            return;
        };
        let doc_id = document_id(timestamp);
        let logbook = self.inner.logbook.clone();
        self.inner.tasks.spawn(async move {
            match mirror.delete(&identity, &doc_id).await {
                Ok(()) => logbook.info("Removed from remote mirror"),
                Err(err) => logbook.error(format!("Remote mirror delete failed: {err}")),
            }
        });
    }
}
