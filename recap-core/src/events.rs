use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::goals::{Goal, GoalSnapshot};
use crate::history::{AggregateStats, VideoEvent};
use crate::logbook::{LogEntry, LogLevel};

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadData {
    pub monitoring_path: Option<PathBuf>,
    pub stats: AggregateStats,
    pub logs: Vec<LogEntry>,
    pub sync_identity: String,
    pub recent_videos: Vec<VideoEvent>,
    pub goals: Vec<Goal>,
    pub active_goal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoProcessed {
    pub video: VideoEvent,
    pub stats: AggregateStats,
    pub recent_videos: Vec<VideoEvent>,
}

/// Push notifications for the UI shell.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", content = "payload", rename_all = "kebab-case")]
pub enum ShellEvent {
    LoadData(LoadData),
    LogMessage { level: LogLevel, message: String },
    MetaUpdate(GoalSnapshot),
    VideoProcessed(VideoProcessed),
    #[serde(rename_all = "camelCase")]
    GoalReached { game_name: String },
}

impl ShellEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            ShellEvent::LoadData(_) => "load-data",
            ShellEvent::LogMessage { .. } => "log-message",
            ShellEvent::MetaUpdate(_) => "meta-update",
            ShellEvent::VideoProcessed(_) => "video-processed",
            ShellEvent::GoalReached { .. } => "goal-reached",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ShellEvent) {
        // No subscriber is fine: the shell may not be attached.
        let _ = self.tx.send(event);
    }
}
