use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use recap_core::dedup::DedupLedger;
use recap_core::history::export::ExportRow;
use recap_core::mirror::MirrorResult;
use recap_core::{
    DurationProbe, EventBus, GoalLedger, HistoryExport, HistoryLog, IngestOutcome, IngestPipeline,
    IngestStage, LogLevel, Logbook, MirrorDocument, MirrorError, ProbeError, ProbeResult,
    RemoteMirror, RetryPolicy, ShellEvent, SkipReason, StateStore, WatchSettings,
};

const INCOMPLETE: &str = "[mov,mp4,m4a,3gp,3g2,mj2 @ 0x7f] moov atom not found";

/// Reports an unfinished container for the first `incomplete_for` calls.
struct ScriptedProber {
    incomplete_for: usize,
    durations: HashMap<PathBuf, f64>,
    default_duration: f64,
    calls: AtomicUsize,
}

impl ScriptedProber {
    fn steady(duration: f64) -> Self {
        Self {
            incomplete_for: 0,
            durations: HashMap::new(),
            default_duration: duration,
            calls: AtomicUsize::new(0),
        }
    }

    fn incomplete_for(attempts: usize, duration: f64) -> Self {
        Self {
            incomplete_for: attempts,
            ..Self::steady(duration)
        }
    }

    fn with(mut self, path: &Path, duration: f64) -> Self {
        self.durations.insert(path.to_path_buf(), duration);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurationProbe for ScriptedProber {
    async fn probe(&self, path: &Path) -> ProbeResult<f64> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.incomplete_for {
            return Err(ProbeError::Tool {
                status: Some(1),
                stderr: INCOMPLETE.into(),
            });
        }
        Ok(self
            .durations
            .get(path)
            .copied()
            .unwrap_or(self.default_duration))
    }
}

struct BrokenProber;

#[async_trait]
impl DurationProbe for BrokenProber {
    async fn probe(&self, _path: &Path) -> ProbeResult<f64> {
        Err(ProbeError::Tool {
            status: Some(1),
            stderr: "Invalid data found when processing input".into(),
        })
    }
}

/// Blocks every probe until released.
struct GatedProber {
    release: Notify,
}

#[async_trait]
impl DurationProbe for GatedProber {
    async fn probe(&self, _path: &Path) -> ProbeResult<f64> {
        self.release.notified().await;
        Ok(30.0)
    }
}

#[derive(Default)]
struct RecordingMirror {
    upserts: Mutex<Vec<(String, MirrorDocument)>>,
    deletes: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait]
impl RemoteMirror for RecordingMirror {
    async fn upsert(&self, identity: &str, document: &MirrorDocument) -> MirrorResult<()> {
        if self.fail {
            return Err(MirrorError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.upserts
            .lock()
            .unwrap()
            .push((identity.to_string(), document.clone()));
        Ok(())
    }

    async fn delete(&self, identity: &str, doc_id: &str) -> MirrorResult<()> {
        self.deletes
            .lock()
            .unwrap()
            .push((identity.to_string(), doc_id.to_string()));
        Ok(())
    }
}

struct Harness {
    dir: TempDir,
    state: StateStore,
    goals: GoalLedger,
    history: HistoryLog,
    dedup: DedupLedger,
    logbook: Logbook,
    events: EventBus,
    pipeline: IngestPipeline,
}

impl Harness {
    fn new(prober: Arc<dyn DurationProbe>) -> Self {
        Self::build(prober, None, RetryPolicy::new(720, Duration::from_secs(2)))
    }

    fn build(
        prober: Arc<dyn DurationProbe>,
        mirror: Option<Arc<dyn RemoteMirror>>,
        retry: RetryPolicy,
    ) -> Self {
        let dir = tempdir().unwrap();
        let state = StateStore::in_memory();
        let events = EventBus::new();
        let logbook = Logbook::new(state.clone(), events.clone(), 100);
        let pipeline = IngestPipeline::builder(
            state.clone(),
            prober,
            HistoryExport::new(dir.path().join("out/recap_monitor_log.csv")),
        )
        .retry_policy(retry)
        .mirror(mirror)
        .events(events.clone())
        .logbook(logbook.clone())
        .build();
        Self {
            goals: GoalLedger::new(state.clone()),
            history: HistoryLog::new(state.clone()),
            dedup: DedupLedger::new(state.clone()),
            dir,
            state,
            logbook,
            events,
            pipeline,
        }
    }

    fn clip(&self, session: &str) -> PathBuf {
        let folder = self.dir.path().join("clips").join(session);
        std::fs::create_dir_all(&folder).unwrap();
        let path = folder.join("video.mp4");
        std::fs::write(&path, b"mp4").unwrap();
        path
    }

    fn seconds_of(&self, goal: &str) -> f64 {
        self.goals
            .list()
            .unwrap()
            .into_iter()
            .find(|g| g.name == goal)
            .map(|g| g.current_seconds)
            .unwrap()
    }

    fn logs_at(&self, level: LogLevel) -> usize {
        self.logbook
            .recent(1000)
            .into_iter()
            .filter(|entry| entry.level == level)
            .count()
    }

    /// accumulated(G) == sum of durations attributed to G, for every goal.
    fn assert_attribution_invariant(&self) {
        let videos = self.history.load().unwrap();
        for goal in self.goals.list().unwrap() {
            let attributed: f64 = videos
                .iter()
                .filter(|video| video.game_name == goal.name)
                .map(|video| video.duration)
                .sum();
            assert!(
                (goal.current_seconds - attributed).abs() < 1e-9,
                "{} has {} but history attributes {}",
                goal.name,
                goal.current_seconds,
                attributed
            );
        }
    }
}

#[tokio::test]
async fn same_path_is_counted_once() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(125.5)));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let clip = h.clip("a");
    let cancel = CancellationToken::new();

    let first = h.pipeline.ingest(clip.clone(), &cancel).await;
    let second = h.pipeline.ingest(clip.clone(), &cancel).await;

    assert!(first.is_done());
    assert_eq!(second, IngestOutcome::Skipped(SkipReason::AlreadyProcessed));
    assert_eq!(h.seconds_of("Hades"), 125.5);
    assert_eq!(h.history.load().unwrap().len(), 1);
    assert!(h.dedup.contains(&clip).unwrap());
    assert_eq!(h.pipeline.export().read().unwrap().len(), 1);
}

#[tokio::test]
async fn durations_follow_the_active_goal() {
    let a = PathBuf::from("/recordings/one/video.mp4");
    let b = PathBuf::from("/recordings/two/video.mp4");
    let c = PathBuf::from("/recordings/three/video.mp4");
    let prober = ScriptedProber::steady(1.0)
        .with(&a, 600.0)
        .with(&b, 45.25)
        .with(&c, 90.0);
    let h = Harness::new(Arc::new(prober));
    h.goals.add("Hades", 10).unwrap();
    h.goals.add("Celeste", 30).unwrap();
    let cancel = CancellationToken::new();

    h.goals.set_active("Hades").unwrap();
    assert!(h.pipeline.ingest(a.clone(), &cancel).await.is_done());
    h.goals.set_active("Celeste").unwrap();
    assert!(h.pipeline.ingest(b.clone(), &cancel).await.is_done());
    assert!(h.pipeline.ingest(c.clone(), &cancel).await.is_done());

    assert_eq!(h.seconds_of("Hades"), 600.0);
    assert_eq!(h.seconds_of("Celeste"), 135.25);
    let hades = h.goals.list().unwrap().into_iter().find(|g| g.name == "Hades").unwrap();
    assert!(hades.completed);
    h.assert_attribution_invariant();
}

#[tokio::test]
async fn completing_a_goal_announces_it() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(61.0)));
    h.goals.add("Hades", 1).unwrap();
    h.goals.set_active("Hades").unwrap();
    let mut rx = h.events.subscribe();

    h.pipeline
        .ingest(h.clip("a"), &CancellationToken::new())
        .await;

    let mut channels = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ShellEvent::VideoProcessed(processed) = &event {
            assert_eq!(processed.recent_videos.len(), 1);
            assert_eq!(processed.video.game_name, "Hades");
        }
        channels.push(event.channel());
    }
    assert!(channels.contains(&"meta-update"));
    assert!(channels.contains(&"goal-reached"));
    assert_eq!(channels.last(), Some(&"video-processed"));
}

#[tokio::test]
async fn deleting_an_event_reverses_its_credit() {
    let first = PathBuf::from("/recordings/one/video.mp4");
    let second = PathBuf::from("/recordings/two/video.mp4");
    let prober = ScriptedProber::steady(1.0).with(&first, 40.0).with(&second, 3000.0);
    let h = Harness::new(Arc::new(prober));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let cancel = CancellationToken::new();

    h.pipeline.ingest(first, &cancel).await;
    let before = h.seconds_of("Hades");
    let IngestOutcome::Done(event) = h.pipeline.ingest(second.clone(), &cancel).await else {
        panic!("expected the clip to be recorded");
    };
    assert_eq!(h.seconds_of("Hades"), before + 3000.0);

    let report = h.pipeline.retract(&event.timestamp).unwrap();

    assert_eq!(h.seconds_of("Hades"), before);
    assert_eq!(report.removed.as_ref(), Some(&event));
    assert_eq!(report.recent_videos.len(), 1);
    assert!(h.history.find(&event.timestamp).unwrap().is_none());
    // The file stays accounted for.
    assert!(h.dedup.contains(&second).unwrap());
    h.assert_attribution_invariant();
}

#[tokio::test]
async fn debits_clamp_at_zero_after_manual_resets() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(100.0)));
    h.goals.add("Hades", 1).unwrap();
    h.goals.set_active("Hades").unwrap();
    let IngestOutcome::Done(event) = h.pipeline.ingest(h.clip("a"), &CancellationToken::new()).await
    else {
        panic!("expected the clip to be recorded");
    };
    h.goals.reset().unwrap();

    h.pipeline.retract(&event.timestamp).unwrap();

    let goal = h.goals.list().unwrap().remove(0);
    assert_eq!(goal.current_seconds, 0.0);
    assert!(!goal.completed);
}

#[tokio::test]
async fn retracting_an_unknown_timestamp_changes_nothing() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(10.0)));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    h.pipeline.ingest(h.clip("a"), &CancellationToken::new()).await;

    let report = h.pipeline.retract("1999-01-01T00:00:00.000Z").unwrap();

    assert!(report.removed.is_none());
    assert!(report.recent_videos.is_empty());
    assert_eq!(h.history.load().unwrap().len(), 1);
    assert_eq!(h.seconds_of("Hades"), 10.0);
}

#[tokio::test]
async fn files_without_an_active_goal_are_left_unmarked() {
    let prober = Arc::new(ScriptedProber::steady(50.0));
    let h = Harness::new(prober.clone());
    h.goals.add("Hades", 60).unwrap();
    let clip = h.clip("a");

    let outcome = h.pipeline.ingest(clip.clone(), &CancellationToken::new()).await;

    assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::NoActiveGoal));
    assert_eq!(h.logs_at(LogLevel::Warn), 1);
    assert_eq!(h.seconds_of("Hades"), 0.0);
    assert!(h.history.load().unwrap().is_empty());
    assert!(!h.dedup.contains(&clip).unwrap());
    assert_eq!(prober.calls(), 0);

    // Eligible again once a goal is active.
    h.goals.set_active("Hades").unwrap();
    assert!(h.pipeline.ingest(clip, &CancellationToken::new()).await.is_done());
}

#[tokio::test]
async fn dangling_active_goal_counts_as_none() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(50.0)));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    h.state
        .put(recap_core::store::keys::ACTIVE_GOAL, "Removed Game")
        .unwrap();

    let outcome = h.pipeline.ingest(h.clip("a"), &CancellationToken::new()).await;
    assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::NoActiveGoal));
}

#[tokio::test(start_paused = true)]
async fn incomplete_containers_are_retried_until_finalized() {
    let prober = Arc::new(ScriptedProber::incomplete_for(3, 812.0));
    let h = Harness::new(prober.clone());
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();

    let outcome = h.pipeline.ingest(h.clip("a"), &CancellationToken::new()).await;

    let IngestOutcome::Done(event) = outcome else {
        panic!("expected convergence, got {outcome:?}");
    };
    assert_eq!(event.duration, 812.0);
    assert_eq!(prober.calls(), 4);
    assert_eq!(h.history.load().unwrap().len(), 1);
    assert_eq!(h.logs_at(LogLevel::Error), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_record_nothing() {
    let prober = Arc::new(ScriptedProber::incomplete_for(usize::MAX, 812.0));
    let h = Harness::build(
        prober.clone(),
        None,
        RetryPolicy::new(5, Duration::from_secs(2)),
    );
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let clip = h.clip("a");

    let outcome = h.pipeline.ingest(clip.clone(), &CancellationToken::new()).await;

    assert!(matches!(
        outcome,
        IngestOutcome::Failed {
            stage: IngestStage::Probing,
            ..
        }
    ));
    assert_eq!(prober.calls(), 5);
    assert!(h.history.load().unwrap().is_empty());
    assert_eq!(h.logs_at(LogLevel::Error), 1);
    assert!(!h.dedup.contains(&clip).unwrap());
}

#[tokio::test]
async fn permanent_probe_failures_are_not_retried() {
    let h = Harness::new(Arc::new(BrokenProber));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();

    let outcome = h.pipeline.ingest(h.clip("a"), &CancellationToken::new()).await;

    assert!(matches!(outcome, IngestOutcome::Failed { .. }));
    assert_eq!(h.logs_at(LogLevel::Error), 1);
    assert!(h.history.load().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_pending_retries_without_mutation() {
    let prober = Arc::new(ScriptedProber::incomplete_for(usize::MAX, 5.0));
    let h = Harness::new(prober.clone());
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let cancel = CancellationToken::new();
    let clip = h.clip("a");

    let handle = h.pipeline.submit(clip.clone(), cancel.clone());
    tokio::time::sleep(Duration::from_secs(7)).await;
    cancel.cancel();
    let outcome = handle.await.unwrap();

    assert_eq!(outcome, IngestOutcome::Skipped(SkipReason::Cancelled));
    assert!(prober.calls() >= 3);
    assert!(h.history.load().unwrap().is_empty());
    assert!(!h.pipeline.is_in_flight(&clip));
}

#[tokio::test]
async fn concurrent_detections_of_one_path_probe_once() {
    let prober = Arc::new(GatedProber {
        release: Notify::new(),
    });
    let h = Harness::new(prober.clone());
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let clip = h.clip("a");
    let cancel = CancellationToken::new();

    let first = h.pipeline.submit(clip.clone(), cancel.clone());
    while !h.pipeline.is_in_flight(&clip) {
        tokio::task::yield_now().await;
    }
    let second = h.pipeline.ingest(clip.clone(), &cancel).await;
    prober.release.notify_one();

    assert_eq!(second, IngestOutcome::Skipped(SkipReason::InFlight));
    assert!(first.await.unwrap().is_done());
    assert_eq!(h.history.load().unwrap().len(), 1);
    assert_eq!(h.seconds_of("Hades"), 30.0);
}

#[tokio::test]
async fn back_to_back_commits_get_distinct_timestamps() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(5.0)));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let cancel = CancellationToken::new();

    for i in 0..20 {
        let path = PathBuf::from(format!("/recordings/{i}/video.mp4"));
        assert!(h.pipeline.ingest(path, &cancel).await.is_done());
    }

    let history = h.history.load().unwrap();
    let mut timestamps: Vec<&str> = history.iter().map(|e| e.timestamp.as_str()).collect();
    assert_eq!(timestamps.len(), 20);
    assert!(timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    timestamps.dedup();
    assert_eq!(timestamps.len(), 20);

    let target = history[7].clone();
    let report = h.pipeline.retract(&target.timestamp).unwrap();
    assert_eq!(report.removed, Some(target));
    assert_eq!(h.history.load().unwrap().len(), 19);
    assert_eq!(h.seconds_of("Hades"), 95.0);
}

#[tokio::test]
async fn export_regenerates_consistently_with_history() {
    let paths: Vec<PathBuf> = (0..4)
        .map(|i| PathBuf::from(format!("/recordings/\"quoted\", {i}/video.mp4")))
        .collect();
    let mut prober = ScriptedProber::steady(1.0);
    for (i, path) in paths.iter().enumerate() {
        prober = prober.with(path, 100.0 * (i as f64 + 1.0) + 0.456);
    }
    let h = Harness::new(Arc::new(prober));
    h.goals.add("Hades, \"Remastered\"", 60).unwrap();
    h.goals.set_active("Hades, \"Remastered\"").unwrap();
    let cancel = CancellationToken::new();

    let mut recorded = Vec::new();
    for path in &paths {
        if let IngestOutcome::Done(event) = h.pipeline.ingest(path.clone(), &cancel).await {
            recorded.push(event);
        }
    }
    h.pipeline.retract(&recorded[1].timestamp).unwrap();
    h.pipeline.retract(&recorded[3].timestamp).unwrap();

    let rows = h.pipeline.export().read().unwrap();
    let history = h.history.load().unwrap();
    let expected: Vec<(String, String, String, String)> = history
        .iter()
        .map(|event| {
            (
                event.timestamp.clone(),
                event.game_name.clone(),
                format!("{:.2}", event.duration),
                event.path.to_string_lossy().into_owned(),
            )
        })
        .collect();
    let actual: Vec<(String, String, String, String)> = rows
        .into_iter()
        .map(|row: ExportRow| {
            (
                row.timestamp,
                row.game,
                format!("{:.2}", row.duration_seconds),
                row.path,
            )
        })
        .collect();
    assert_eq!(history.len(), 2);
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn mirror_receives_events_only_with_an_identity() {
    let mirror = Arc::new(RecordingMirror::default());
    let h = Harness::build(
        Arc::new(ScriptedProber::steady(42.0)),
        Some(mirror.clone()),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let cancel = CancellationToken::new();

    h.pipeline.ingest(h.clip("a"), &cancel).await;
    h.pipeline.drain().await;
    assert!(mirror.upserts.lock().unwrap().is_empty());

    h.state
        .put(recap_core::store::keys::SYNC_IDENTITY, "player-1")
        .unwrap();
    let IngestOutcome::Done(event) = h.pipeline.ingest(h.clip("b"), &cancel).await else {
        panic!("expected the clip to be recorded");
    };
    h.pipeline.retract(&event.timestamp).unwrap();
    h.pipeline.drain().await;

    let upserts = mirror.upserts.lock().unwrap();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].0, "player-1");
    assert_eq!(upserts[0].1.duration, 42.0);
    assert_eq!(upserts[0].1.timestamp, event.timestamp);
    assert!(!upserts[0].1.doc_id.contains(':'));
    let deletes = mirror.deletes.lock().unwrap();
    assert_eq!(deletes.as_slice(), &[("player-1".to_string(), upserts[0].1.doc_id.clone())]);
}

#[tokio::test]
async fn mirror_failures_do_not_undo_local_accounting() {
    let mirror = Arc::new(RecordingMirror {
        fail: true,
        ..RecordingMirror::default()
    });
    let h = Harness::build(
        Arc::new(ScriptedProber::steady(42.0)),
        Some(mirror),
        RetryPolicy::new(3, Duration::from_millis(10)),
    );
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    h.state
        .put(recap_core::store::keys::SYNC_IDENTITY, "player-1")
        .unwrap();

    let outcome = h.pipeline.ingest(h.clip("a"), &CancellationToken::new()).await;
    h.pipeline.drain().await;

    assert!(outcome.is_done());
    assert_eq!(h.seconds_of("Hades"), 42.0);
    assert_eq!(h.logs_at(LogLevel::Error), 1);
}

#[tokio::test]
async fn backlog_scan_submits_only_unprocessed_files() {
    let h = Harness::new(Arc::new(ScriptedProber::steady(20.0)));
    h.goals.add("Hades", 60).unwrap();
    h.goals.set_active("Hades").unwrap();
    let done = h.clip("2024-01-01");
    h.pipeline.ingest(done, &CancellationToken::new()).await;
    h.clip("2024-01-02");
    h.clip("2024/nested/2024-01-03");
    std::fs::write(h.dir.path().join("clips/notes.txt"), b"x").unwrap();

    let settings = WatchSettings {
        file_name: "video.mp4".into(),
        stability: Duration::from_secs(15),
        poll_interval: Duration::from_millis(100),
        notify_poll_interval: Duration::from_secs(2),
    };
    let submitted = h
        .pipeline
        .scan_backlog(&h.dir.path().join("clips"), &settings, &CancellationToken::new())
        .unwrap();
    h.pipeline.drain().await;

    assert_eq!(submitted, 2);
    assert_eq!(h.history.load().unwrap().len(), 3);
    assert_eq!(h.seconds_of("Hades"), 60.0);

    let again = h
        .pipeline
        .scan_backlog(&h.dir.path().join("clips"), &settings, &CancellationToken::new())
        .unwrap();
    assert_eq!(again, 0);
}
