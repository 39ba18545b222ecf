//! Flat CSV projection of the structured history.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use super::VideoEvent;

pub const EXPORT_HEADER: &str = "Timestamp,Game,Duration_Fmt,Duration_Sec,Duration_Hours,Path";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("malformed export line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

pub type ExportResult<T> = Result<T, ExportError>;

/// One parsed row of the export file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub timestamp: String,
    pub game: String,
    pub duration_fmt: String,
    pub duration_seconds: f64,
    pub duration_hours: f64,
    pub path: String,
}

/// Floored `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0);
    let hours = (total / 3600.0).floor() as u64;
    let minutes = ((total % 3600.0) / 60.0).floor() as u64;
    let secs = (total % 60.0).floor() as u64;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

pub fn format_row(event: &VideoEvent) -> String {
    format!(
        "{},{},{},{:.2},{:.4},{}",
        event.timestamp,
        quote(&event.game_name),
        format_duration(event.duration),
        event.duration,
        event.duration / 3600.0,
        quote(&event.path.to_string_lossy()),
    )
}

pub fn render(events: &[VideoEvent]) -> String {
    let mut content = String::with_capacity(64 * (events.len() + 1));
    content.push_str(EXPORT_HEADER);
    content.push('\n');
    for event in events {
        content.push_str(&format_row(event));
        content.push('\n');
    }
    content
}

pub fn parse(contents: &str) -> ExportResult<Vec<ExportRow>> {
    let records =
        split_records(contents).map_err(|(line, reason)| ExportError::Malformed { line, reason })?;
    let mut rows = Vec::with_capacity(records.len());
    for Record { line: line_no, fields } in records {
        if line_no == 1 && fields.join(",") == EXPORT_HEADER {
            continue;
        }
        let [timestamp, game, duration_fmt, seconds, hours, path]: [String; 6] =
            fields.try_into().map_err(|fields: Vec<String>| ExportError::Malformed {
                line: line_no,
                reason: format!("expected 6 fields, found {}", fields.len()),
            })?;
        let number = |raw: &str, column: &str| {
            raw.parse::<f64>().map_err(|_| ExportError::Malformed {
                line: line_no,
                reason: format!("invalid {column}: {raw}"),
            })
        };
        rows.push(ExportRow {
            duration_seconds: number(&seconds, "Duration_Sec")?,
            duration_hours: number(&hours, "Duration_Hours")?,
            timestamp,
            game,
            duration_fmt,
            path,
        });
    }
    Ok(rows)
}

/// A logical CSV record and the physical line it starts on.
struct Record {
    line: usize,
    fields: Vec<String>,
}

/// Quoted fields may span lines; blank lines outside quotes are skipped.
fn split_records(contents: &str) -> Result<Vec<Record>, (usize, String)> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = contents.chars().peekable();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut line = 1;
    let mut record_line = 1;
    while let Some(ch) = chars.next() {
        match (ch, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            ('"', true) => in_quotes = false,
            ('"', false) if current.is_empty() && !was_quoted => {
                in_quotes = true;
                was_quoted = true;
            }
            (',', false) => {
                fields.push(std::mem::take(&mut current));
                was_quoted = false;
            }
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(std::mem::take(&mut current));
                let blank = fields.len() == 1 && !was_quoted && fields[0].trim().is_empty();
                let fields = std::mem::take(&mut fields);
                if !blank {
                    records.push(Record {
                        line: record_line,
                        fields,
                    });
                }
                was_quoted = false;
                line += 1;
                record_line = line;
            }
            (other, quoted) => {
                if other == '\n' && quoted {
                    line += 1;
                }
                current.push(other);
            }
        }
    }
    if in_quotes {
        return Err((record_line, "unterminated quoted field".into()));
    }
    if !fields.is_empty() || was_quoted || !current.trim().is_empty() {
        fields.push(current);
        records.push(Record {
            line: record_line,
            fields,
        });
    }
    Ok(records)
}

/// Append-only CSV file kept consistent with the structured history.
#[derive(Debug, Clone)]
pub struct HistoryExport {
    path: PathBuf,
}

impl HistoryExport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> ExportError {
        ExportError::Io {
            source,
            path: self.path.clone(),
        }
    }

    pub fn append(&self, event: &VideoEvent) -> ExportResult<()> {
        self.ensure_parent()?;
        let needs_header = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.io_error(err))?;
        let mut chunk = String::new();
        if needs_header {
            chunk.push_str(EXPORT_HEADER);
            chunk.push('\n');
        }
        chunk.push_str(&format_row(event));
        chunk.push('\n');
        file.write_all(chunk.as_bytes())
            .map_err(|err| self.io_error(err))
    }

    /// Rewrites the whole file from `events`, replacing it atomically.
    pub fn rebuild(&self, events: &[VideoEvent]) -> ExportResult<()> {
        let parent = self.ensure_parent()?;
        let mut temp = NamedTempFile::new_in(&parent).map_err(|err| self.io_error(err))?;
        temp.write_all(render(events).as_bytes())
            .map_err(|err| self.io_error(err))?;
        temp.persist(&self.path)
            .map_err(|err| self.io_error(err.error))?;
        Ok(())
    }

    pub fn read(&self) -> ExportResult<Vec<ExportRow>> {
        let contents = fs::read_to_string(&self.path).map_err(|err| self.io_error(err))?;
        parse(&contents)
    }

    fn ensure_parent(&self) -> ExportResult<PathBuf> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|source| ExportError::Io {
            source,
            path: parent.clone(),
        })?;
        Ok(parent)
    }
}
