//! Flapping audit log: JSON lines, one decision per line.
//!
//! Every line is a self-contained JSON object with an RFC 3339 timestamp and
//! an `event` tag, so a crash loop can be reconstructed after the fact with
//! `grep` or `jq`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A structured event in the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// Everything the flapping detector decides.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// `times` deaths landed inside `within` seconds.
    FlappingDetected {
        show: String,
        deaths: usize,
        span_secs: f64,
    },
    /// The show was stopped and a restart armed.
    RetryScheduled {
        show: String,
        attempt: u32,
        retry_in_secs: f64,
    },
    /// A retry timer fired and the show was started again.
    RetryStarted { show: String },
    /// Retries were exhausted and the show was terminated.
    Terminated { show: String, max_retry: u32 },
    /// Deaths reached the threshold too slowly to count as flapping.
    Recovered { show: String, span_secs: f64 },
    /// Flapping thresholds were (re)loaded from the controller.
    ConfigRefreshed {
        show: String,
        times: u32,
        within: f64,
        retry_in: f64,
        max_retry: u32,
    },
    /// An operator cleared the show's flapping state.
    Reset { show: String, cancelled_retry: bool },
    /// A command sent to the controller failed.
    CommandFailed { command: String, reason: String },
}

/// Writer for JSON lines audit logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open (or create) the log at `path`, creating parent directories.
    /// Existing content is appended to.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "audit log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Log an event, downgrading write failures to a warning.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "audit log write failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
