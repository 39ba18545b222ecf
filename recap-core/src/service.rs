use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RecapConfig;
use crate::error::ConfigError;
use crate::events::{EventBus, LoadData, ShellEvent};
use crate::goals::{GoalError, GoalImportRow, GoalLedger, GoalSnapshot};
use crate::history::{daily_totals, AggregateStats, DailyBucket, HistoryExport, HistoryLog};
use crate::logbook::{LogEntry, Logbook};
use crate::mirror::{FirestoreMirror, RemoteMirror};
use crate::pipeline::{CorrectionReport, IngestPipeline, PipelineError};
use crate::probe::{DurationProbe, FfprobeProber, ProbeClassifier, ProbeError, RetryPolicy};
use crate::store::{keys, SqliteKvStore, StateStore, StoreError};
use crate::watcher::{watch_folder, WatchError, WatchSettings};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Goal(#[from] GoalError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub success: bool,
    pub message: String,
    pub submitted: usize,
}

struct WatchSession {
    root: PathBuf,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

/// Operation surface used by the shell: goal management, watch control,
/// backlog scans, corrections and read models.
pub struct RecapService {
    config: RecapConfig,
    state: StateStore,
    goals: GoalLedger,
    history: HistoryLog,
    pipeline: IngestPipeline,
    logbook: Logbook,
    events: EventBus,
    watch: WatchSettings,
    shutdown: CancellationToken,
    session: Mutex<Option<WatchSession>>,
}

impl std::fmt::Debug for RecapService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecapService")
            .field("pipeline", &self.pipeline)
            .field("watching", &self.watched_root())
            .finish_non_exhaustive()
    }
}

impl RecapService {
    /// Opens the SQLite state under `paths.data_dir` and wires ffprobe plus
    /// the optional Firestore mirror.
    pub fn open(config: RecapConfig) -> ServiceResult<Self> {
        config.validate()?;
        if let Err(err) = std::fs::create_dir_all(&config.paths.data_dir) {
            warn!(error = %err, dir = %config.paths.data_dir, "could not create data directory");
        }
        let store = SqliteKvStore::builder()
            .path(config.state_db_path())
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        let state = StateStore::new(Arc::new(store));
        let prober: Arc<dyn DurationProbe> = Arc::new(FfprobeProber::from_config(&config.probe));
        let mirror = if config.mirror.enabled {
            match FirestoreMirror::from_config(&config.mirror) {
                Ok(mirror) => Some(Arc::new(mirror) as Arc<dyn RemoteMirror>),
                Err(err) => {
                    warn!(error = %err, "remote mirror disabled");
                    None
                }
            }
        } else {
            None
        };
        Self::with_parts(config, state, prober, mirror)
    }

    /// Wires the service around injected collaborators.
    pub fn with_parts(
        config: RecapConfig,
        state: StateStore,
        prober: Arc<dyn DurationProbe>,
        mirror: Option<Arc<dyn RemoteMirror>>,
    ) -> ServiceResult<Self> {
        let week_start = config.history.week_start()?;
        let events = EventBus::new();
        let logbook = Logbook::new(state.clone(), events.clone(), config.history.log_capacity);
        let pipeline =
            IngestPipeline::builder(state.clone(), prober, HistoryExport::new(config.export_path()))
                .classifier(ProbeClassifier::from_config(&config.probe)?)
                .retry_policy(RetryPolicy::from_probe_config(&config.probe))
                .mirror(mirror)
                .events(events.clone())
                .logbook(logbook.clone())
                .recent_limit(config.history.recent_limit)
                .week_start(week_start)
                .build();
        Ok(Self {
            watch: WatchSettings::from_config(&config.watch),
            goals: GoalLedger::new(state.clone()),
            history: HistoryLog::new(state.clone()),
            config,
            state,
            pipeline,
            logbook,
            events,
            shutdown: CancellationToken::new(),
            session: Mutex::new(None),
        })
    }

    /// Replaces the settle settings derived from the config for later watch sessions.
    pub fn with_watch_settings(mut self, settings: WatchSettings) -> Self {
        self.watch = settings;
        self
    }

    pub fn config(&self) -> &RecapConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn logbook(&self) -> &Logbook {
        &self.logbook
    }

    fn publish_goals(&self, snapshot: GoalSnapshot) -> GoalSnapshot {
        self.events.emit(ShellEvent::MetaUpdate(snapshot.clone()));
        snapshot
    }

    pub fn goals(&self) -> ServiceResult<GoalSnapshot> {
        Ok(self.goals.snapshot()?)
    }

    pub fn add_goal(&self, name: &str, target_minutes: u32) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.add(name.trim(), target_minutes)?;
        self.logbook
            .info(format!("Added goal {} ({target_minutes} min)", name.trim()));
        Ok(self.publish_goals(snapshot))
    }

    pub fn remove_goal(&self, name: &str) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.remove(name)?;
        self.logbook.info(format!("Removed goal {name}"));
        Ok(self.publish_goals(snapshot))
    }

    pub fn import_goals(&self, rows: &[GoalImportRow]) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.import(rows)?;
        self.logbook.info(format!(
            "Imported goal list with {} goals",
            snapshot.goals.len()
        ));
        Ok(self.publish_goals(snapshot))
    }

    pub fn reset_goals(&self) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.reset()?;
        self.logbook.info("Goal progress reset");
        Ok(self.publish_goals(snapshot))
    }

    pub fn set_active_goal(&self, name: &str) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.set_active(name)?;
        self.logbook.info(format!("Now tracking {name}"));
        Ok(self.publish_goals(snapshot))
    }

    pub fn clear_active_goal(&self) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.clear_active()?;
        self.logbook.info("Tracking paused");
        Ok(self.publish_goals(snapshot))
    }

    pub fn toggle_active_goal(&self, name: &str) -> ServiceResult<GoalSnapshot> {
        let snapshot = self.goals.toggle_active(name)?;
        match &snapshot.active_goal {
            Some(active) => self.logbook.info(format!("Now tracking {active}")),
            None => self.logbook.info("Tracking paused"),
        }
        Ok(self.publish_goals(snapshot))
    }

    pub fn monitoring_path(&self) -> ServiceResult<Option<PathBuf>> {
        Ok(self.state.get(keys::MONITORING_PATH)?)
    }

    pub fn watched_root(&self) -> Option<PathBuf> {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.as_ref().map(|session| session.root.clone()))
    }

    /// Persists `root` and restarts the watch on it. Needs a Tokio runtime.
    pub fn select_root(&self, root: &Path) -> ServiceResult<PathBuf> {
        if !root.is_dir() {
            return Err(ServiceError::NotADirectory(root.to_path_buf()));
        }
        let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        self.state.put(keys::MONITORING_PATH, &root)?;
        self.start_watch(&root)?;
        Ok(root)
    }

    /// Restarts the watch on the persisted root, if it still exists.
    pub fn resume(&self) -> ServiceResult<Option<PathBuf>> {
        match self.monitoring_path()? {
            Some(root) if root.is_dir() => {
                self.start_watch(&root)?;
                Ok(Some(root))
            }
            Some(root) => {
                self.logbook.warn(format!(
                    "Monitoring folder {} is no longer available",
                    root.display()
                ));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn start_watch(&self, root: &Path) -> ServiceResult<()> {
        self.stop_watch();
        let cancel = self.shutdown.child_token();
        let mut ready = watch_folder(root, &self.watch, &cancel)?;
        let pipeline = self.pipeline.clone();
        let logbook = self.logbook.clone();
        let token = cancel.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(path) = ready.next_ready().await {
                logbook.info(format!("Detected {}", path.display()));
                pipeline.submit(path, token.clone());
            }
        });
        self.logbook.info(format!("Monitoring {}", root.display()));
        if let Ok(mut session) = self.session.lock() {
            *session = Some(WatchSession {
                root: root.to_path_buf(),
                cancel,
                forwarder,
            });
        }
        Ok(())
    }

    /// Tears the watch down and cancels its pending probe retries.
    pub fn stop_watch(&self) {
        let previous = self.session.lock().ok().and_then(|mut session| session.take());
        if let Some(previous) = previous {
            info!(root = %previous.root.display(), "stopping watch");
            previous.cancel.cancel();
            previous.forwarder.abort();
        }
    }

    fn active_cancel(&self) -> CancellationToken {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.as_ref().map(|session| session.cancel.clone()))
            .unwrap_or_else(|| self.shutdown.child_token())
    }

    /// Submits unprocessed files found under the persisted root.
    pub fn scan(&self) -> ServiceResult<ScanReport> {
        let root = match self.monitoring_path()? {
            Some(root) if root.is_dir() => root,
            _ => {
                return Ok(ScanReport {
                    success: false,
                    message: "No valid monitoring folder selected".into(),
                    submitted: 0,
                })
            }
        };
        self.logbook.info(format!("Scanning {}", root.display()));
        let submitted = self
            .pipeline
            .scan_backlog(&root, &self.watch, &self.active_cancel())?;
        let message = if submitted == 0 {
            "Everything is up to date".to_string()
        } else {
            format!("Found {submitted} new files")
        };
        Ok(ScanReport {
            success: true,
            message,
            submitted,
        })
    }

    pub fn delete_video(&self, timestamp: &str) -> ServiceResult<CorrectionReport> {
        Ok(self.pipeline.retract(timestamp)?)
    }

    pub fn daily_history(&self) -> ServiceResult<BTreeMap<String, DailyBucket>> {
        Ok(daily_totals(&self.history.load()?))
    }

    pub fn stats(&self) -> ServiceResult<AggregateStats> {
        Ok(self.pipeline.stats()?)
    }

    pub fn recent_videos(&self) -> ServiceResult<Vec<crate::history::VideoEvent>> {
        Ok(self.pipeline.recent_videos()?)
    }

    /// Regenerates the CSV export from structured history.
    pub fn rebuild_export(&self) -> ServiceResult<PathBuf> {
        let videos = self.history.load()?;
        self.pipeline
            .export()
            .rebuild(&videos)
            .map_err(PipelineError::from)?;
        Ok(self.pipeline.export().path().to_path_buf())
    }

    pub fn sync_identity(&self) -> Option<String> {
        self.pipeline.sync_identity()
    }

    pub fn set_sync_identity(&self, identity: Option<&str>) -> ServiceResult<()> {
        match identity.map(str::trim).filter(|id| !id.is_empty()) {
            Some(identity) => {
                self.state.put(keys::SYNC_IDENTITY, identity)?;
                self.logbook.info("Sync identity saved");
            }
            None => {
                self.state.remove(keys::SYNC_IDENTITY)?;
                self.logbook.info("Sync identity cleared");
            }
        }
        Ok(())
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.logbook.recent(limit)
    }

    /// Snapshot pushed to a freshly attached shell; also broadcast as `load-data`.
    pub fn load_data(&self) -> ServiceResult<LoadData> {
        let snapshot = self.goals.snapshot()?;
        let data = LoadData {
            monitoring_path: self.monitoring_path()?,
            stats: self.stats()?,
            logs: self.logbook.recent(self.config.history.load_log_limit),
            sync_identity: self.sync_identity().unwrap_or_default(),
            recent_videos: self.recent_videos()?,
            goals: snapshot.goals,
            active_goal: snapshot.active_goal,
        };
        self.events.emit(ShellEvent::LoadData(data.clone()));
        Ok(data)
    }

    /// Stops watching, cancels retries and waits for background work.
    pub async fn shutdown(&self) {
        self.stop_watch();
        self.shutdown.cancel();
        self.pipeline.drain().await;
    }
}
