use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

use crate::error::CuaError;

pub const AUDIT_CAPACITY: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub action: String,
    pub description: String,
    pub target: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AuditEntry {
    pub fn new(
        level: AuditLevel,
        action: &str,
        description: &str,
        target: &str,
        result: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            action: action.to_string(),
            description: description.to_string(),
            target: target.to_string(),
            result: result.to_string(),
            error: None,
            metadata: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// In-memory ring plus optional JSON-lines file. Lives under the guardrails
/// mutex, so appends are serialized.
pub struct AuditLog {
    ring: VecDeque<AuditEntry>,
    sink: Option<BufWriter<File>>,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self { ring: VecDeque::with_capacity(AUDIT_CAPACITY), sink: None }
    }

    pub fn open(path: Option<&Path>) -> Result<Self, CuaError> {
        let mut log = Self::in_memory();
        if let Some(path) = path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CuaError::Config(format!("audit log {}: {e}", path.display())))?;
            log.sink = Some(BufWriter::new(file));
        }
        Ok(log)
    }

    pub fn append(&mut self, entry: AuditEntry) {
        if let Some(sink) = self.sink.as_mut() {
            let written = serde_json::to_string(&entry)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(sink, "{line}"))
                .and_then(|_| sink.flush());
            if let Err(e) = written {
                warn!(error = %e, "audit sink write failed");
            }
        }
        if self.ring.len() >= AUDIT_CAPACITY {
            self.ring.drain(..AUDIT_CAPACITY / 4);
        }
        self.ring.push_back(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest_quarter() {
        let mut log = AuditLog::in_memory();
        for i in 0..AUDIT_CAPACITY {
            log.append(AuditEntry::new(AuditLevel::Info, &i.to_string(), "", "", "allowed"));
        }
        assert_eq!(log.len(), AUDIT_CAPACITY);
        log.append(AuditEntry::new(AuditLevel::Info, "overflow", "", "", "allowed"));
        let entries = log.entries();
        assert_eq!(entries.len(), AUDIT_CAPACITY - AUDIT_CAPACITY / 4 + 1);
        assert_eq!(entries[0].action, "250");
        assert_eq!(entries.last().unwrap().action, "overflow");
    }

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(Some(&path)).unwrap();
            let entry =
                AuditEntry::new(AuditLevel::Block, "type_text", "Type", "password", "blocked");
            log.append(entry.with_error("safety"));
        }
        {
            let mut log = AuditLog::open(Some(&path)).unwrap();
            let entry = AuditEntry::new(AuditLevel::Info, "click", "Click", "(1, 2)", "success");
            log.append(entry.with_metadata(json!({ "step": 2 })));
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditEntry> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].level, AuditLevel::Block);
        assert_eq!(lines[0].error.as_deref(), Some("safety"));
        assert_eq!(lines[1].metadata, Some(json!({ "step": 2 })));
        assert!(!text.lines().next().unwrap().contains("metadata"));
    }
}
