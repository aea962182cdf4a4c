//! Plugin protocol definitions
//!
//! Request, response and result types shared by the parser, both invocation
//! protocols and the executor.

use crate::error::ToolError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::ops::Range;
use std::time::Duration;

/// Ordered string arguments of a tool call.
///
/// Inserting an existing key replaces its value in place, so the key keeps
/// the position of its first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    entries: Vec<(String, String)>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value, returning the previous one
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Get a parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Get a required parameter
    pub fn require(&self, name: &str) -> Result<&str, String> {
        self.get(name)
            .ok_or_else(|| format!("Missing required parameter: {}", name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Arguments {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = Arguments::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

impl Serialize for Arguments {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A tool invocation parsed out of model text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    /// Tool name from the reserved first key
    pub tool_name: String,
    /// Remaining key/value pairs
    pub arguments: Arguments,
    /// Byte range of the whole marked block in the source text
    pub span: Range<usize>,
}

impl ToolCallRequest {
    pub fn new(tool_name: &str, arguments: Arguments) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            arguments,
            span: 0..0,
        }
    }
}

/// Envelope written to a stdio plugin's stdin
#[derive(Debug, Serialize)]
pub struct StdioRequest<'a> {
    pub tool: &'a str,
    pub arguments: &'a Arguments,
}

/// Status reported by a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Response envelope returned by either protocol
#[derive(Debug, Clone, PartialEq)]
pub struct PluginResponse {
    pub status: ResponseStatus,
    /// Opaque payload; `Some(Value::Null)` means an explicit null result
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl PluginResponse {
    /// Create a success response
    pub fn success(result: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: &str) -> Self {
        Self {
            status: ResponseStatus::Error,
            result: None,
            error: Some(message.to_string()),
        }
    }

    /// Parse and validate the single JSON object a stdio plugin printed
    pub fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| format!("invalid JSON output from plugin: {}", e))?;
        Self::from_value(value)
    }

    /// Validate an envelope against the response schema
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("plugin output is not a JSON object".to_string());
        };

        let status = match map.get("status").and_then(Value::as_str) {
            Some("success") => ResponseStatus::Success,
            Some("error") => ResponseStatus::Error,
            Some(other) => return Err(format!("unknown response status: {}", other)),
            None => return Err("response is missing the status field".to_string()),
        };

        let result = map.remove("result");
        let error = map.remove("error").map(|e| match e {
            Value::String(s) => s,
            other => other.to_string(),
        });

        match status {
            ResponseStatus::Success if result.is_none() => {
                Err("success response is missing the result field".to_string())
            }
            ResponseStatus::Error if error.is_none() => {
                Err("error response is missing the error field".to_string())
            }
            _ => Ok(Self {
                status,
                result,
                error,
            }),
        }
    }

    /// Collapse into the payload or the plugin's error message
    pub fn into_outcome(self) -> Result<Value, ToolError> {
        match self.status {
            ResponseStatus::Success => self.result.ok_or_else(|| {
                ToolError::Process("success response is missing the result field".to_string())
            }),
            ResponseStatus::Error => Err(ToolError::Plugin(
                self.error
                    .unwrap_or_else(|| "plugin reported an error".to_string()),
            )),
        }
    }
}

/// Final state of one tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failure,
    Timeout,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Failure => "failure",
            ToolStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub tool_name: String,
    pub status: ToolStatus,
    pub payload: Option<Value>,
    pub error_message: Option<String>,
    pub duration: Duration,
}

impl ToolExecutionResult {
    pub fn success(tool_name: &str, payload: Value, duration: Duration) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            status: ToolStatus::Success,
            payload: Some(payload),
            error_message: None,
            duration,
        }
    }

    /// Build a failed result; `ToolError::Timeout` yields the timeout status
    pub fn from_error(tool_name: &str, error: ToolError, duration: Duration) -> Self {
        let status = match error {
            ToolError::Timeout(_) => ToolStatus::Timeout,
            _ => ToolStatus::Failure,
        };
        Self {
            tool_name: tool_name.to_string(),
            status,
            payload: None,
            error_message: Some(error.to_string()),
            duration,
        }
    }

    pub fn from_outcome(
        tool_name: &str,
        outcome: Result<Value, ToolError>,
        duration: Duration,
    ) -> Self {
        match outcome {
            Ok(payload) => Self::success(tool_name, payload, duration),
            Err(e) => Self::from_error(tool_name, e, duration),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}
