pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod goals;
pub mod history;
pub mod logbook;
pub mod mirror;
pub mod pipeline;
pub mod probe;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod watcher;

pub use config::{
    load_recap_config, HistorySection, MirrorSection, PathsSection, ProbeSection, RecapConfig,
    WatchSection,
};
pub use dedup::DedupLedger;
pub use error::{ConfigError, Result};
pub use events::{EventBus, LoadData, ShellEvent, VideoProcessed};
pub use goals::{Goal, GoalError, GoalImportRow, GoalLedger, GoalResult, GoalSnapshot};
pub use history::{
    AggregateStats, DailyBucket, ExportError, ExportRow, HistoryExport, HistoryLog, VideoEvent,
};
pub use logbook::{LogEntry, LogLevel, Logbook};
pub use mirror::{FirestoreMirror, MirrorDocument, MirrorError, MirrorResult, RemoteMirror};
pub use pipeline::{
    CorrectionReport, IngestOutcome, IngestPipeline, IngestPipelineBuilder, IngestStage,
    PipelineError, PipelineResult, SkipReason,
};
pub use probe::{
    Disposition, DurationProbe, FfprobeProber, ProbeClassifier, ProbeError, ProbeResult,
    RetryError, RetryOutcome, RetryPolicy,
};
pub use service::{RecapService, ScanReport, ServiceError, ServiceResult};
pub use store::{KvStore, MemoryKvStore, SqliteKvStore, SqliteKvStoreBuilder, StateStore, StoreError};
pub use watcher::{watch_folder, ReadyFiles, WatchError, WatchResult, WatchSettings};
