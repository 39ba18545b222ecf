use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use recap_core::history::export::format_duration;
use recap_core::{
    load_recap_config, AggregateStats, CorrectionReport, DailyBucket, GoalImportRow, GoalSnapshot,
    LogEntry, RecapConfig, RecapService, ScanReport, ShellEvent, VideoEvent,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] recap_core::ConfigError),
    #[error("{0}")]
    Service(#[from] recap_core::ServiceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Recording time tracker", long_about = None)]
pub struct Cli {
    /// Path to recap.toml; built-in defaults apply when the file is absent
    #[arg(long, default_value = "configs/recap.toml")]
    pub config: PathBuf,
    /// Overrides paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Summary of goals, folder and totals
    Status,
    /// Weekly and monthly totals
    Stats,
    /// Recent log entries
    Logs(LimitArgs),
    /// Goal management
    #[command(subcommand)]
    Goal(GoalCommands),
    /// Watch the folder and process new recordings until Ctrl-C
    Watch(RootArgs),
    /// Process recordings the watcher never saw
    Scan(RootArgs),
    /// Recorded clips
    #[command(subcommand)]
    History(HistoryCommands),
    /// Remote sync identity
    #[command(subcommand)]
    Identity(IdentityCommands),
}

#[derive(Args, Debug)]
pub struct LimitArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct RootArgs {
    /// Folder to monitor; replaces the stored one
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum GoalCommands {
    List,
    Add(GoalAddArgs),
    Remove(GoalNameArgs),
    /// Replace the goal list from a JSON array of `{name, target}`
    Import(GoalImportArgs),
    /// Zero all progress and pause tracking
    Reset,
    Activate(GoalNameArgs),
    Deactivate,
    /// Activate, or pause if already active
    Toggle(GoalNameArgs),
}

#[derive(Args, Debug)]
pub struct GoalAddArgs {
    pub name: String,
    /// Target in minutes
    #[arg(long, default_value_t = recap_core::goals::DEFAULT_TARGET_MINUTES)]
    pub target: u32,
}

#[derive(Args, Debug)]
pub struct GoalNameArgs {
    pub name: String,
}

#[derive(Args, Debug)]
pub struct GoalImportArgs {
    pub file: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommands {
    Recent,
    /// Totals per UTC day
    Daily,
    /// Remove an entry by its timestamp and reverse its credit
    Delete(DeleteArgs),
    /// Regenerate the CSV export from stored history
    Export,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub timestamp: String,
}

#[derive(Subcommand, Debug)]
pub enum IdentityCommands {
    Set(IdentitySetArgs),
    Clear,
}

#[derive(Args, Debug)]
pub struct IdentitySetArgs {
    pub identity: String,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let format = cli.format;

    match &cli.command {
        Commands::Status => render(&context.status()?, format)?,
        Commands::Stats => render(&context.service.stats()?, format)?,
        Commands::Logs(args) => render(&LogList(context.service.recent_logs(args.limit)), format)?,
        Commands::Goal(command) => render(&context.goal(command)?, format)?,
        Commands::Watch(args) => context.watch(args, format).await?,
        Commands::Scan(args) => render(&context.scan(args).await?, format)?,
        Commands::History(command) => context.history(command, format)?,
        Commands::Identity(command) => render(&context.identity(command)?, format)?,
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

fn load_config(cli: &Cli) -> Result<RecapConfig> {
    let mut config = if cli.config.exists() {
        load_recap_config(&cli.config)?
    } else {
        debug!(path = %cli.config.display(), "config file not found; using defaults");
        RecapConfig::default()
    };
    if let Some(data_dir) = &cli.data_dir {
        config.paths.data_dir = data_dir.to_string_lossy().into_owned();
    }
    Ok(config)
}

struct AppContext {
    service: RecapService,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_config(cli)?;
        Ok(Self {
            service: RecapService::open(config)?,
        })
    }

    fn status(&self) -> Result<StatusReport> {
        let data = self.service.load_data()?;
        Ok(StatusReport {
            monitoring_path: data.monitoring_path,
            active_goal: data.active_goal,
            goals: data.goals.len(),
            completed_goals: data.goals.iter().filter(|goal| goal.completed).count(),
            stats: data.stats,
            sync_identity: Some(data.sync_identity).filter(|id| !id.is_empty()),
            recent_videos: data.recent_videos,
        })
    }

    fn goal(&self, command: &GoalCommands) -> Result<GoalSnapshot> {
        let snapshot = match command {
            GoalCommands::List => self.service.goals()?,
            GoalCommands::Add(args) => self.service.add_goal(&args.name, args.target)?,
            GoalCommands::Remove(args) => self.service.remove_goal(&args.name)?,
            GoalCommands::Import(args) => {
                let raw = fs::read_to_string(&args.file)?;
                let rows: Vec<GoalImportRow> = serde_json::from_str(&raw)?;
                self.service.import_goals(&rows)?
            }
            GoalCommands::Reset => self.service.reset_goals()?,
            GoalCommands::Activate(args) => self.service.set_active_goal(&args.name)?,
            GoalCommands::Deactivate => self.service.clear_active_goal()?,
            GoalCommands::Toggle(args) => self.service.toggle_active_goal(&args.name)?,
        };
        Ok(snapshot)
    }

    fn start(&self, args: &RootArgs) -> Result<PathBuf> {
        match &args.root {
            Some(root) => Ok(self.service.select_root(root)?),
            None => self.service.resume()?.ok_or_else(|| {
                AppError::MissingResource(
                    "no monitoring folder stored; pass --root".to_string(),
                )
            }),
        }
    }

    async fn watch(&self, args: &RootArgs, format: OutputFormat) -> Result<()> {
        let mut rx = self.service.events().subscribe();
        self.start(args)?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = rx.recv() => match event {
                    Ok(event) => render(&event, format)?,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output lagging"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.service.shutdown().await;
        Ok(())
    }

    async fn scan(&self, args: &RootArgs) -> Result<ScanReport> {
        if args.root.is_some() {
            self.start(args)?;
            self.service.stop_watch();
        }
        let report = self.service.scan()?;
        self.service.pipeline().drain().await;
        self.service.shutdown().await;
        Ok(report)
    }

    fn history(&self, command: &HistoryCommands, format: OutputFormat) -> Result<()> {
        match command {
            HistoryCommands::Recent => {
                render(&VideoList(self.service.recent_videos()?), format)
            }
            HistoryCommands::Daily => render(&DailyReport(self.service.daily_history()?), format),
            HistoryCommands::Delete(args) => {
                render(&self.service.delete_video(&args.timestamp)?, format)
            }
            HistoryCommands::Export => {
                let path = self.service.rebuild_export()?;
                render(&ExportReport { path }, format)
            }
        }
    }

    fn identity(&self, command: &IdentityCommands) -> Result<IdentityReport> {
        match command {
            IdentityCommands::Set(args) => self.service.set_sync_identity(Some(&args.identity))?,
            IdentityCommands::Clear => self.service.set_sync_identity(None)?,
        }
        Ok(IdentityReport {
            identity: self.service.sync_identity(),
        })
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    monitoring_path: Option<PathBuf>,
    active_goal: Option<String>,
    goals: usize,
    completed_goals: usize,
    stats: AggregateStats,
    sync_identity: Option<String>,
    recent_videos: Vec<VideoEvent>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let folder = self
            .monitoring_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut lines = vec![
            format!("Folder: {folder}"),
            format!(
                "Active goal: {}",
                self.active_goal.as_deref().unwrap_or("none (paused)")
            ),
            format!("Goals: {} ({} completed)", self.goals, self.completed_goals),
            self.stats.display(),
        ];
        if let Some(identity) = &self.sync_identity {
            lines.push(format!("Sync identity: {identity}"));
        }
        if !self.recent_videos.is_empty() {
            lines.push("Recent:".to_string());
            lines.extend(self.recent_videos.iter().map(|video| format!("  {}", video_line(video))));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for AggregateStats {
    fn display(&self) -> String {
        format!(
            "This week: {} | This month: {}",
            format_duration(self.total_weekly),
            format_duration(self.total_monthly)
        )
    }
}

impl DisplayFallback for GoalSnapshot {
    fn display(&self) -> String {
        if self.goals.is_empty() {
            return "No goals".to_string();
        }
        self.goals
            .iter()
            .map(|goal| {
                let marker = if self.active_goal.as_deref() == Some(goal.name.as_str()) {
                    '*'
                } else {
                    ' '
                };
                let done = if goal.completed { " done" } else { "" };
                format!(
                    "{marker} {} {} / {:02}:{:02}:00{done}",
                    goal.name,
                    format_duration(goal.current_seconds),
                    goal.target_minutes / 60,
                    goal.target_minutes % 60
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for ScanReport {
    fn display(&self) -> String {
        self.message.clone()
    }
}

impl DisplayFallback for CorrectionReport {
    fn display(&self) -> String {
        match &self.removed {
            Some(video) => format!("Removed {}\n{}", video_line(video), self.stats.display()),
            None => "No entry with that timestamp".to_string(),
        }
    }
}

impl DisplayFallback for ShellEvent {
    fn display(&self) -> String {
        match self {
            ShellEvent::LogMessage { level, message } => format!("[{level}] {message}"),
            ShellEvent::VideoProcessed(processed) => format!(
                "[{}] {} | {}",
                self.channel(),
                video_line(&processed.video),
                processed.stats.display()
            ),
            ShellEvent::GoalReached { game_name } => {
                format!("[{}] {game_name}", self.channel())
            }
            ShellEvent::MetaUpdate(snapshot) => {
                format!("[{}]\n{}", self.channel(), snapshot.display())
            }
            ShellEvent::LoadData(_) => format!("[{}]", self.channel()),
        }
    }
}

fn video_line(video: &VideoEvent) -> String {
    format!(
        "{} {} {} {}",
        video.timestamp,
        video.game_name,
        format_duration(video.duration),
        video.path.display()
    )
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct LogList(Vec<LogEntry>);

impl DisplayFallback for LogList {
    fn display(&self) -> String {
        if self.0.is_empty() {
            return "No log entries".to_string();
        }
        self.0
            .iter()
            .map(|entry| format!("{} [{}] {}", entry.timestamp, entry.level, entry.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct VideoList(Vec<VideoEvent>);

impl DisplayFallback for VideoList {
    fn display(&self) -> String {
        if self.0.is_empty() {
            return "No recordings yet".to_string();
        }
        self.0.iter().map(video_line).collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct DailyReport(BTreeMap<String, DailyBucket>);

impl DisplayFallback for DailyReport {
    fn display(&self) -> String {
        if self.0.is_empty() {
            return "No recordings yet".to_string();
        }
        self.0
            .iter()
            .rev()
            .map(|(day, bucket)| {
                format!(
                    "{day}: {} across {} clips",
                    format_duration(bucket.total_seconds),
                    bucket.entries.len()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
struct ExportReport {
    path: PathBuf,
}

impl DisplayFallback for ExportReport {
    fn display(&self) -> String {
        format!("Export written to {}", self.path.display())
    }
}

#[derive(Debug, Serialize)]
struct IdentityReport {
    identity: Option<String>,
}

impl DisplayFallback for IdentityReport {
    fn display(&self) -> String {
        match &self.identity {
            Some(identity) => format!("Sync identity: {identity}"),
            None => "Sync disabled".to_string(),
        }
    }
}
