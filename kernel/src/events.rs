//! Append-only kernel event log.
//!
//! One JSON object per line at `<logs-dir>/events.jsonl`. Events are
//! never rewritten; a failed append is logged and surfaced as `false`
//! so the runner can carry on (the log is observability, not state).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Event type. The set is open-ended on disk; unknown kinds deserialize
/// as [`EventKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Completed,
    Failed,
    Escalated,
    RepairCreated,
    Error,
    #[serde(other)]
    Other,
}

/// A single event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub issue_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EventRecord {
    pub fn new(kind: EventKind, issue_id: Option<&str>) -> Self {
        Self {
            timestamp: utc_now_rfc3339(),
            kind,
            issue_id: issue_id.map(|s| s.to_string()),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// Current UTC time as an ISO-8601 string with a `Z` suffix.
pub fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Append-only event log backed by a JSON Lines file.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Conventional location under a repo root: `.dev-kernel/logs/events.jsonl`.
    pub fn for_repo(repo_root: &Path) -> Self {
        Self::new(repo_root.join(".dev-kernel").join("logs").join("events.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Returns `false` on I/O failure (logged, not fatal).
    pub fn append(&self, event: &EventRecord) -> bool {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Failed to create event log dir");
                return false;
            }
        }

        let line = match serde_json::to_string(event) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to serialize event");
                return false;
            }
        };

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));

        match result {
            Ok(()) => {
                debug!(kind = ?event.kind, issue_id = ?event.issue_id, "Event logged");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to append event");
                false
            }
        }
    }

    /// Read the log back. Malformed lines are skipped.
    pub fn read_all(&self) -> Vec<EventRecord> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}
