use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::vault::util::now_utc;

pub const EVENTS_FILE_NAME: &str = "events.log";

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub at: DateTime<Utc>,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(logs_dir: &Path, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create {}", logs_dir.display()))?;
    let event = LifecycleEvent {
        at: now_utc(),
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = logs_dir.join(EVENTS_FILE_NAME);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Receives the one-line summary of a finished archive or retry run.
pub trait Notifier {
    fn notify(&self, phase: &str, ok: bool, summary: &str) -> Result<()>;
}

/// Default sink: the events log itself.
#[derive(Debug, Clone)]
pub struct EventLogNotifier {
    logs_dir: PathBuf,
}

impl EventLogNotifier {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }
}

impl Notifier for EventLogNotifier {
    fn notify(&self, phase: &str, ok: bool, summary: &str) -> Result<()> {
        let status = if ok { "ok" } else { "failed" };
        append_event(&self.logs_dir, phase, status, summary)
    }
}
