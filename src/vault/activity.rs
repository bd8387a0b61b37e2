//! Per-operation audit trail

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Vault operations that are audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Upload,
    Get,
    List,
    Download,
    Delete,
    DeleteAll,
    Export,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Upload => "upload",
            Action::Get => "get",
            Action::List => "list",
            Action::Download => "download",
            Action::Delete => "delete",
            Action::DeleteAll => "delete_all",
            Action::Export => "export",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audited operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub owner_id: String,
    pub action: Action,
    /// Record the operation applied to, if any
    pub file_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Sink for audit events.
///
/// Recording is infallible from the caller's point of view: an audit sink
/// that cannot keep up must not fail the operation it describes.
pub trait ActivityLog: Send + Sync {
    fn record(&self, entry: ActivityEntry);
}

/// Emits every entry as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, entry: ActivityEntry) {
        info!(
            target: "vaultcore::activity",
            owner = %entry.owner_id,
            action = %entry.action,
            file = entry.file_id.as_deref().unwrap_or("-"),
            "activity"
        );
    }
}

/// Keeps entries in memory, oldest first
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().clone()
    }

    /// Actions recorded for one owner, in order
    pub fn actions_of(&self, owner_id: &str) -> Vec<Action> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .map(|e| e.action)
            .collect()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, entry: ActivityEntry) {
        self.entries.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: &str, action: Action) -> ActivityEntry {
        ActivityEntry {
            owner_id: owner.to_string(),
            action,
            file_id: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_log_keeps_order() {
        let log = MemoryActivityLog::new();
        log.record(entry("U1", Action::Upload));
        log.record(entry("U2", Action::List));
        log.record(entry("U1", Action::Download));

        assert_eq!(log.entries().len(), 3);
        assert_eq!(log.actions_of("U1"), vec![Action::Upload, Action::Download]);
    }

    #[test]
    fn test_action_names() {
        assert_eq!(Action::DeleteAll.to_string(), "delete_all");
        assert_eq!(serde_json::to_string(&Action::DeleteAll).unwrap(), "\"delete_all\"");
        assert_eq!(Action::Export.as_str(), "export");
    }

    #[test]
    fn test_tracing_log_accepts_entries() {
        TracingActivityLog.record(entry("U1", Action::Get));
    }
}
