//! Append-only progress and log records

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use taskstore::{IndexValue, Record, now_ms};

/// One progress checkpoint of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: String,

    #[serde(default)]
    pub seq: i64,

    pub task_id: String,

    /// Human-readable stage label ("LU decomposition", ...)
    pub stage: String,

    /// Overall completion in [0, 100]
    pub percentage: f64,

    pub timestamp: i64,
}

impl ProgressRecord {
    pub fn new(task_id: impl Into<String>, stage: impl Into<String>, percentage: f64) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            task_id: task_id.into(),
            stage: stage.into(),
            percentage: percentage.clamp(0.0, 100.0),
            timestamp: now_ms(),
        }
    }
}

impl Record for ProgressRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.timestamp
    }

    fn collection_name() -> &'static str {
        "task_progress"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields
    }

    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

/// Severity of a task log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One log line of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,

    #[serde(default)]
    pub seq: i64,

    pub task_id: String,

    pub level: LogLevel,

    pub message: String,

    pub timestamp: i64,
}

impl LogRecord {
    pub fn new(task_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            seq: 0,
            task_id: task_id.into(),
            level,
            message: message.into(),
            timestamp: now_ms(),
        }
    }

    pub fn info(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task_id, LogLevel::Info, message)
    }

    pub fn warn(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task_id, LogLevel::Warn, message)
    }

    pub fn error(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(task_id, LogLevel::Error, message)
    }
}

impl Record for LogRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.timestamp
    }

    fn collection_name() -> &'static str {
        "task_logs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("level".to_string(), IndexValue::String(self.level.to_string()));
        fields
    }

    fn set_seq(&mut self, seq: i64) {
        self.seq = seq;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_is_clamped() {
        assert_eq!(ProgressRecord::new("t", "x", 120.0).percentage, 100.0);
        assert_eq!(ProgressRecord::new("t", "x", -3.0).percentage, 0.0);
    }

    #[test]
    fn test_log_level_serializes_uppercase() {
        let record = LogRecord::warn("t", "slow");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["level"], "WARN");
    }
}
