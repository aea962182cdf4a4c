//! Tool executor
//!
//! Resolves each parsed request against the registry, runs the calls with
//! bounded concurrency and renders the ordered results for the model.

use super::adapter::ToolAdapter;
use super::direct::DirectAdapter;
use super::manifest::Protocol;
use super::protocol::{ToolCallRequest, ToolExecutionResult, ToolStatus};
use super::registry::PluginRegistry;
use super::stdio::StdioAdapter;
use crate::config::PluginConfig;
use crate::error::ToolError;
use crate::logging::ToolAuditLogger;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const RESULTS_OPEN: &str = "[[TOOL_RESULTS";
pub const RESULTS_CLOSE: &str = "TOOL_RESULTS_END]]";

/// Execution limits taken from the plugin configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorLimits {
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub result_preview_chars: usize,
}

impl From<&PluginConfig> for ExecutorLimits {
    fn from(config: &PluginConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            default_timeout: config.default_timeout(),
            result_preview_chars: config.result_preview_chars,
        }
    }
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self::from(&PluginConfig::default())
    }
}

/// Results of one batch, in request order, plus their rendering
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub results: Vec<ToolExecutionResult>,
    pub rendered: String,
}

/// Runs batches of tool calls
pub struct ToolExecutor {
    registry: Arc<PluginRegistry>,
    stdio: Arc<dyn ToolAdapter>,
    direct: Arc<dyn ToolAdapter>,
    limits: ExecutorLimits,
    audit: Option<Arc<ToolAuditLogger>>,
}

impl ToolExecutor {
    /// Executor with the standard adapters configured from `config`
    pub fn new(registry: Arc<PluginRegistry>, config: &PluginConfig) -> Self {
        Self::with_adapters(
            registry,
            Arc::new(StdioAdapter::new(
                config.grace_period(),
                config.stderr_excerpt_bytes,
            )),
            Arc::new(DirectAdapter::new()),
            ExecutorLimits::from(config),
        )
    }

    pub fn with_adapters(
        registry: Arc<PluginRegistry>,
        stdio: Arc<dyn ToolAdapter>,
        direct: Arc<dyn ToolAdapter>,
        limits: ExecutorLimits,
    ) -> Self {
        Self {
            registry,
            stdio,
            direct,
            limits,
            audit: None,
        }
    }

    /// Record every finished call in an audit log
    pub fn with_audit(mut self, audit: Arc<ToolAuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Run one request to completion
    pub async fn execute_one(&self, request: &ToolCallRequest) -> ToolExecutionResult {
        let Some(instance) = self.registry.resolve(&request.tool_name) else {
            debug!("No plugin provides tool '{}'", request.tool_name);
            return ToolExecutionResult::from_error(
                &request.tool_name,
                ToolError::NotFound(request.tool_name.clone()),
                Duration::ZERO,
            );
        };

        let timeout = instance.manifest.timeout.unwrap_or(self.limits.default_timeout);
        let adapter = match instance.protocol() {
            Protocol::Stdio => &self.stdio,
            Protocol::Direct => &self.direct,
        };
        adapter.invoke(&instance, request, timeout).await
    }

    /// Run a batch of requests and render their results in request order
    pub async fn execute(&self, requests: &[ToolCallRequest]) -> ExecutionReport {
        let mut indexed: Vec<(usize, ToolExecutionResult)> = stream::iter(requests.iter().enumerate())
            .map(|(index, request)| async move { (index, self.execute_one(request).await) })
            .buffer_unordered(self.limits.max_concurrency.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        let results: Vec<ToolExecutionResult> = indexed.into_iter().map(|(_, r)| r).collect();
        for (request, result) in requests.iter().zip(&results) {
            info!(
                "Tool '{}' finished: {} in {:?}",
                result.tool_name, result.status, result.duration
            );
            if let Some(audit) = &self.audit {
                audit.log_tool_call(request, result);
            }
        }

        let rendered = render_results(&results, self.limits.result_preview_chars);
        ExecutionReport { results, rendered }
    }
}

/// Render ordered results as the block handed back to the model.
///
/// Durations are deliberately absent so identical outcomes render identically.
pub fn render_results(results: &[ToolExecutionResult], preview_chars: usize) -> String {
    if results.is_empty() {
        return String::new();
    }

    let entries: Vec<String> = results
        .iter()
        .map(|result| {
            let detail = match result.status {
                ToolStatus::Success => format!(
                    "- content: {}",
                    preview(&payload_text(result.payload.as_ref()), preview_chars)
                ),
                ToolStatus::Failure | ToolStatus::Timeout => format!(
                    "- error: {}",
                    result.error_message.as_deref().unwrap_or("unknown error")
                ),
            };
            format!(
                "- tool_name: {}\n- status: {}\n{}",
                result.tool_name, result.status, detail
            )
        })
        .collect();

    format!("{}\n{}\n{}", RESULTS_OPEN, entries.join("\n\n"), RESULTS_CLOSE)
}

fn payload_text(payload: Option<&Value>) -> String {
    match payload {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => match map.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => Value::Object(map.clone()).to_string(),
        },
        Some(other) => other.to_string(),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
