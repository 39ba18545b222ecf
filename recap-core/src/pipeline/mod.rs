//! Exactly-once accounting of settled clips.
//!
//! Each file walks `Detected -> DedupCheck -> Probing -> Attributing ->
//! Logged -> Synced -> Done`. Goal progress and history are committed in one
//! batch before the path is marked processed, so a crash in between leaves
//! the file eligible for another attempt instead of silently lost.

mod correction;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Local, Utc, Weekday};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn, Instrument};

use crate::dedup::{ledger_key, DedupLedger};
use crate::events::{EventBus, ShellEvent, VideoProcessed};
use crate::goals::{find_goal, GoalError, GoalLedger, GoalSnapshot};
use crate::history::{
    compute_stats, next_free_timestamp, recent_of, AggregateStats, ExportError, HistoryExport,
    HistoryLog, VideoEvent,
};
use crate::logbook::Logbook;
use crate::mirror::{MirrorDocument, RemoteMirror};
use crate::probe::{DurationProbe, ProbeClassifier, RetryError, RetryPolicy};
use crate::store::{keys, StagedWrite, StateStore, StoreError};
use crate::watcher::{find_candidates, WatchSettings};

pub use correction::CorrectionReport;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Goal(#[from] GoalError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Detected,
    DedupCheck,
    Probing,
    Attributing,
    Logged,
    Synced,
    Done,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Detected => "detected",
            IngestStage::DedupCheck => "dedup-check",
            IngestStage::Probing => "probing",
            IngestStage::Attributing => "attributing",
            IngestStage::Logged => "logged",
            IngestStage::Synced => "synced",
            IngestStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    /// Another attempt for the same path is still running.
    InFlight,
    NoActiveGoal,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Done(VideoEvent),
    Skipped(SkipReason),
    Failed { stage: IngestStage, reason: String },
}

impl IngestOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, IngestOutcome::Done(_))
    }
}

enum Commit {
    Recorded(Recorded),
    AlreadyProcessed,
    NoActiveGoal,
}

struct Recorded {
    event: VideoEvent,
    snapshot: GoalSnapshot,
    goal_reached: bool,
    videos: Vec<VideoEvent>,
    export: Result<(), ExportError>,
}

/// Removes the path from the in-flight set when the attempt ends.
struct InFlightClaim {
    set: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl InFlightClaim {
    fn acquire(set: &Arc<Mutex<HashSet<PathBuf>>>, path: &Path) -> Option<Self> {
        if !lock_claims(set).insert(path.to_path_buf()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        lock_claims(&self.set).remove(&self.path);
    }
}

// A panic while holding the set leaves it consistent, so poisoning is ignored.
fn lock_claims(set: &Mutex<HashSet<PathBuf>>) -> MutexGuard<'_, HashSet<PathBuf>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct IngestPipelineBuilder {
    state: StateStore,
    prober: Arc<dyn DurationProbe>,
    export: HistoryExport,
    classifier: ProbeClassifier,
    retry: RetryPolicy,
    mirror: Option<Arc<dyn RemoteMirror>>,
    events: EventBus,
    logbook: Option<Logbook>,
    recent_limit: usize,
    week_start: Weekday,
}

impl IngestPipelineBuilder {
    pub fn classifier(mut self, classifier: ProbeClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn mirror(mut self, mirror: Option<Arc<dyn RemoteMirror>>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn logbook(mut self, logbook: Logbook) -> Self {
        self.logbook = Some(logbook);
        self
    }

    pub fn recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn week_start(mut self, week_start: Weekday) -> Self {
        self.week_start = week_start;
        self
    }

    pub fn build(self) -> IngestPipeline {
        let logbook = self
            .logbook
            .unwrap_or_else(|| Logbook::new(self.state.clone(), self.events.clone(), 100));
        IngestPipeline {
            inner: Arc::new(PipelineInner {
                goals: GoalLedger::new(self.state.clone()),
                dedup: DedupLedger::new(self.state.clone()),
                history: HistoryLog::new(self.state.clone()),
                state: self.state,
                export: self.export,
                prober: self.prober,
                classifier: self.classifier,
                retry: self.retry,
                mirror: self.mirror,
                logbook,
                events: self.events,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                tasks: TaskTracker::new(),
                recent_limit: self.recent_limit,
                week_start: self.week_start,
            }),
        }
    }
}

struct PipelineInner {
    state: StateStore,
    goals: GoalLedger,
    dedup: DedupLedger,
    history: HistoryLog,
    export: HistoryExport,
    prober: Arc<dyn DurationProbe>,
    classifier: ProbeClassifier,
    retry: RetryPolicy,
    mirror: Option<Arc<dyn RemoteMirror>>,
    logbook: Logbook,
    events: EventBus,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    tasks: TaskTracker,
    recent_limit: usize,
    week_start: Weekday,
}

/// Cheap to clone; clones share ledgers, the in-flight set and background tasks.
#[derive(Clone)]
pub struct IngestPipeline {
    inner: Arc<PipelineInner>,
}

impl fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("export", &self.inner.export.path())
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl IngestPipeline {
    pub fn builder(
        state: StateStore,
        prober: Arc<dyn DurationProbe>,
        export: HistoryExport,
    ) -> IngestPipelineBuilder {
        IngestPipelineBuilder {
            state,
            prober,
            export,
            classifier: ProbeClassifier::default(),
            retry: RetryPolicy::new(720, std::time::Duration::from_secs(2)),
            mirror: None,
            events: EventBus::new(),
            logbook: None,
            recent_limit: 5,
            week_start: Weekday::Sun,
        }
    }

    pub fn logbook(&self) -> &Logbook {
        &self.inner.logbook
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn export(&self) -> &HistoryExport {
        &self.inner.export
    }

    pub fn week_start(&self) -> Weekday {
        self.inner.week_start
    }

    pub fn recent_limit(&self) -> usize {
        self.inner.recent_limit
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        lock_claims(&self.inner.in_flight).contains(path)
    }

    /// Weekly and monthly totals relative to the local clock.
    pub fn stats(&self) -> PipelineResult<AggregateStats> {
        let videos = self.inner.history.load()?;
        Ok(compute_stats(&videos, &Local::now(), self.inner.week_start))
    }

    pub fn recent_videos(&self) -> PipelineResult<Vec<VideoEvent>> {
        Ok(self.inner.history.recent(self.inner.recent_limit)?)
    }

    /// The configured remote-sync identity, if any.
    pub fn sync_identity(&self) -> Option<String> {
        match self.inner.state.get::<String>(keys::SYNC_IDENTITY) {
            Ok(identity) => identity.filter(|id| !id.trim().is_empty()),
            Err(err) => {
                warn!(error = %err, "failed to read sync identity");
                None
            }
        }
    }

    /// Runs one file through the whole state machine. Never panics and never
    /// returns an error: failures end up in the logbook.
    pub async fn ingest(&self, path: PathBuf, cancel: &CancellationToken) -> IngestOutcome {
        let path = std::path::absolute(&path).unwrap_or(path);
        let span = info_span!("ingest", path = %path.display());
        self.ingest_inner(path, cancel).instrument(span).await
    }

    async fn ingest_inner(&self, path: PathBuf, cancel: &CancellationToken) -> IngestOutcome {
        let inner = &self.inner;
        let Some(_claim) = InFlightClaim::acquire(&inner.in_flight, &path) else {
            debug!("already in flight; ignoring duplicate detection");
            return IngestOutcome::Skipped(SkipReason::InFlight);
        };

        match inner.dedup.contains(&path) {
            Ok(true) => {
                debug!("already processed");
                return IngestOutcome::Skipped(SkipReason::AlreadyProcessed);
            }
            Ok(false) => {}
            Err(err) => return self.fail(IngestStage::DedupCheck, &path, err.to_string()),
        }

        let active = match inner.goals.active_goal() {
            Ok(Some(goal)) => goal,
            Ok(None) => {
                inner.logbook.warn(format!(
                    "Skipped {}: no active goal selected",
                    path.display()
                ));
                return IngestOutcome::Skipped(SkipReason::NoActiveGoal);
            }
            Err(err) => return self.fail(IngestStage::DedupCheck, &path, err.to_string()),
        };
        inner
            .logbook
            .info(format!("Processing {} for {}", path.display(), active.name));

        let prober = &inner.prober;
        let classifier = &inner.classifier;
        let logbook = &inner.logbook;
        let max_attempts = inner.retry.max_attempts();
        let probed = inner
            .retry
            .run(
                cancel,
                |_| prober.probe(&path),
                |err| classifier.classify(err),
                |err, left| {
                    if left + 1 == max_attempts {
                        logbook.info(format!(
                            "Waiting for {} to be finalized ({left} attempts left)",
                            path.display()
                        ));
                    } else {
                        debug!(error = %err, attempts_left = left, "container still incomplete");
                    }
                },
            )
            .await;
        let duration = match probed {
            Ok(outcome) => outcome.result,
            Err(RetryError::Cancelled { attempts }) => {
                debug!(attempts, "probe cancelled by watch teardown");
                return IngestOutcome::Skipped(SkipReason::Cancelled);
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                return self.fail(
                    IngestStage::Probing,
                    &path,
                    format!("still incomplete after {attempts} attempts: {last}"),
                );
            }
            Err(RetryError::Permanent { error, .. }) => {
                return self.fail(IngestStage::Probing, &path, error.to_string());
            }
        };
        if cancel.is_cancelled() {
            debug!("watch torn down before commit; dropping result");
            return IngestOutcome::Skipped(SkipReason::Cancelled);
        }

        let recorded = match self.commit(&path, duration) {
            Ok(Commit::Recorded(recorded)) => recorded,
            Ok(Commit::AlreadyProcessed) => {
                return IngestOutcome::Skipped(SkipReason::AlreadyProcessed)
            }
            Ok(Commit::NoActiveGoal) => {
                inner.logbook.warn(format!(
                    "Skipped {}: active goal was cleared while probing",
                    path.display()
                ));
                return IngestOutcome::Skipped(SkipReason::NoActiveGoal);
            }
            Err(err) => return self.fail(IngestStage::Attributing, &path, err.to_string()),
        };
        self.announce(recorded)
    }

    fn fail(&self, stage: IngestStage, path: &Path, reason: String) -> IngestOutcome {
        self.inner.logbook.error(format!(
            "Failed to process {} ({stage}): {reason}",
            path.display()
        ));
        IngestOutcome::Failed { stage, reason }
    }

    /// Attributing and Logged, under the store's write guard.
    fn commit(&self, path: &Path, duration: f64) -> PipelineResult<Commit> {
        let inner = &self.inner;
        let _guard = inner.state.write_guard()?;
        if inner.dedup.contains(path)? {
            return Ok(Commit::AlreadyProcessed);
        }
        let Some(active_name) = inner.goals.active_name()? else {
            return Ok(Commit::NoActiveGoal);
        };
        let mut goals = inner.goals.list()?;
        let Some(goal) = find_goal(&mut goals, &active_name) else {
            return Ok(Commit::NoActiveGoal);
        };
        let goal_reached = goal.credit(duration);

        let mut videos = inner.history.load()?;
        let recorded_at = next_free_timestamp(&videos, Utc::now());
        let event = VideoEvent::at(path.to_path_buf(), duration, active_name.clone(), recorded_at);
        videos.push(event.clone());
        inner.state.put_many(vec![
            StagedWrite::new(keys::GOALS, &goals)?,
            HistoryLog::stage(&videos)?,
        ])?;
        let export = inner.export.append(&event);
        inner.state.put_many(vec![inner.dedup.stage_mark(path)?])?;
        debug!(stage = %IngestStage::Logged, duration, goal = %active_name, "committed");

        Ok(Commit::Recorded(Recorded {
            event,
            snapshot: GoalSnapshot {
                goals,
                active_goal: Some(active_name),
            },
            goal_reached,
            videos,
            export,
        }))
    }

    fn announce(&self, recorded: Recorded) -> IngestOutcome {
        let inner = &self.inner;
        let Recorded {
            event,
            snapshot,
            goal_reached,
            videos,
            export,
        } = recorded;
        if let Err(err) = export {
            inner
                .logbook
                .error(format!("Failed to append to history export: {err}"));
        }
        inner.logbook.success(format!(
            "+{:.0}s recorded for {}",
            event.duration, event.game_name
        ));
        inner.events.emit(ShellEvent::MetaUpdate(snapshot));
        if goal_reached {
            inner
                .logbook
                .success(format!("Goal reached: {}", event.game_name));
            inner.events.emit(ShellEvent::GoalReached {
                game_name: event.game_name.clone(),
            });
        }

        self.spawn_mirror_upsert(&event);

        let stats = compute_stats(&videos, &Local::now(), inner.week_start);
        inner.events.emit(ShellEvent::VideoProcessed(VideoProcessed {
            video: event.clone(),
            stats,
            recent_videos: recent_of(&videos, inner.recent_limit),
        }));
        debug!(stage = %IngestStage::Done, "ingest finished");
        IngestOutcome::Done(event)
    }

    /// Fire-and-forget; the outcome only reaches the logbook.
    fn spawn_mirror_upsert(&self, event: &VideoEvent) {
        let Some(mirror) = self.inner.mirror.clone() else {
            return;
        };
        let Some(identity) = self.sync_identity() else {
            return;
        };
        let document = MirrorDocument::from_event(event);
        let logbook = self.inner.logbook.clone();
        self.inner.tasks.spawn(async move {
            match mirror.upsert(&identity, &document).await {
                Ok(()) => {
                    debug!(stage = %IngestStage::Synced, doc = %document.doc_id, "mirrored");
                    logbook.info("Synced to remote mirror");
                }
                Err(err) => logbook.error(format!("Remote mirror sync failed: {err}")),
            }
        });
    }

    /// Runs [`IngestPipeline::ingest`] in the background.
    pub fn submit(&self, path: PathBuf, cancel: CancellationToken) -> JoinHandle<IngestOutcome> {
        let pipeline = self.clone();
        self.inner
            .tasks
            .spawn(async move { pipeline.ingest(path, &cancel).await })
    }

    /// Submits every matching file under `root` that is neither processed
    /// nor already in flight. Returns how many were submitted.
    pub fn scan_backlog(
        &self,
        root: &Path,
        settings: &WatchSettings,
        cancel: &CancellationToken,
    ) -> PipelineResult<usize> {
        let processed = self.inner.dedup.load()?;
        let mut submitted = 0;
        for path in find_candidates(root, settings) {
            let marked = processed.get(&ledger_key(&path)).copied().unwrap_or(false);
            if marked || self.is_in_flight(&path) {
                continue;
            }
            self.submit(path, cancel.clone());
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Waits for every submitted ingest and pending mirror call.
    pub async fn drain(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }
}
