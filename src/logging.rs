//! Logging module for audit trails
//!
//! Records every tool call the model triggered, with its arguments, outcome
//! and duration, as one JSON object per line.

use crate::config::AuditConfig;
use crate::plugins::{ToolCallRequest, ToolExecutionResult, ToolStatus};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Session ID for the current process
static SESSION_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

/// Secret patterns for redaction
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // API keys and tokens
        Regex::new(
            r#"(?i)(api[_-]?key|token|secret|password|passwd|pwd)\s*[=:]\s*['"]?([^'"\s]+)['"]?"#,
        )
        .unwrap(),
        // Bearer tokens
        Regex::new(r"(?i)bearer\s+[a-zA-Z0-9._-]+").unwrap(),
        // AWS keys
        Regex::new(r"AKIA[A-Z0-9]{16}").unwrap(),
        // Private keys
        Regex::new(r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----").unwrap(),
        // Generic long alphanumeric strings that might be keys
        Regex::new(r"[a-zA-Z0-9_-]{32,}").unwrap(),
    ]
});

const MAX_PREVIEW: usize = 500;

/// Log entry structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: LogEvent,
    /// User running the process
    pub user: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub arguments: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Types of log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// A tool call finished, in any state
    ToolCall,
    /// A marked block could not be parsed
    Malformed,
}

/// JSON-lines audit log of tool activity
pub struct ToolAuditLogger {
    config: AuditConfig,
    log_file: Mutex<Option<BufWriter<File>>>,
}

impl ToolAuditLogger {
    /// Create a new audit logger
    pub fn new(config: AuditConfig) -> Self {
        let log_file = if config.enabled {
            Self::open_log_file(&config.log_path)
        } else {
            None
        };

        Self {
            config,
            log_file: Mutex::new(log_file),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Open or create the log file
    fn open_log_file(path: &Path) -> Option<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create log directory: {}", e);
                return None;
            }
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                error!("Failed to open log file {:?}: {}", path, e);
                None
            }
        }
    }

    /// Record a finished tool call
    pub fn log_tool_call(&self, request: &ToolCallRequest, result: &ToolExecutionResult) {
        if !self.config.enabled {
            return;
        }

        let preview = result.payload.as_ref().map(|payload| {
            let text = match payload {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            truncate_preview(&self.redact_if_needed(&text))
        });

        let mut entry = self.entry(LogEvent::ToolCall);
        entry.tool_name = Some(request.tool_name.clone());
        entry.arguments = request
            .arguments
            .iter()
            .map(|(k, v)| (k.to_string(), truncate_preview(&self.redact_if_needed(v))))
            .collect();
        entry.status = Some(result.status);
        entry.result_preview = preview;
        entry.error = result
            .error_message
            .as_deref()
            .map(|e| truncate_preview(&self.redact_if_needed(e)));
        entry.duration_ms = Some(result.duration.as_millis() as u64);

        self.write_entry(&entry);
    }

    /// Record a marked block that was skipped
    pub fn log_malformed(&self, reason: &str) {
        if !self.config.enabled {
            return;
        }

        let mut entry = self.entry(LogEvent::Malformed);
        entry.error = Some(reason.to_string());
        self.write_entry(&entry);
    }

    fn entry(&self, event: LogEvent) -> LogEntry {
        LogEntry {
            session_id: SESSION_ID.clone(),
            timestamp: Utc::now(),
            event,
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            cwd: std::env::current_dir()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| ".".to_string()),
            tool_name: None,
            arguments: vec![],
            status: None,
            result_preview: None,
            error: None,
            duration_ms: None,
        }
    }

    /// Write a log entry, rotating first when the file has grown too large
    fn write_entry(&self, entry: &LogEntry) {
        let json = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize log entry: {}", e);
                return;
            }
        };

        let Ok(mut guard) = self.log_file.lock() else {
            warn!("Audit log lock poisoned; dropping entry");
            return;
        };
        self.maybe_rotate(&mut guard);

        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file, "{}", json) {
                error!("Failed to write log entry: {}", e);
            }
            if let Err(e) = file.flush() {
                warn!("Failed to flush log file: {}", e);
            }
        }
    }

    fn redact_if_needed(&self, text: &str) -> String {
        if self.config.redact_secrets {
            redact_secrets(text)
        } else {
            text.to_string()
        }
    }

    fn maybe_rotate(&self, log_file: &mut Option<BufWriter<File>>) {
        let path = &self.config.log_path;
        if let Ok(metadata) = fs::metadata(path) {
            if metadata.len() > self.config.max_log_size {
                self.rotate_logs(log_file);
            }
        }
    }

    /// Rotate log files
    fn rotate_logs(&self, log_file: &mut Option<BufWriter<File>>) {
        let path = &self.config.log_path;
        debug!("Rotating log files");

        // Close current file
        *log_file = None;

        for i in (1..self.config.log_retention).rev() {
            let old = format!("{}.{}", path.display(), i);
            let new = format!("{}.{}", path.display(), i + 1);
            let _ = fs::rename(&old, &new);
        }

        let rotated = format!("{}.1", path.display());
        let _ = fs::rename(path, &rotated);

        *log_file = Self::open_log_file(path);
    }

    /// Get session ID
    pub fn session_id() -> &'static str {
        &SESSION_ID
    }
}

/// Redact secrets from text
fn redact_secrets(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in SECRET_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

/// Truncate text for preview
fn truncate_preview(text: &str) -> String {
    if text.len() <= MAX_PREVIEW {
        return text.to_string();
    }
    let mut end = MAX_PREVIEW;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &text[..end])
}
