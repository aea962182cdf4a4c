//! Conversation reinjection
//!
//! Runs one conversational turn: a completion, the tool calls it asked for,
//! and a single follow-up completion that sees their results.

use crate::completion::{ChatMessage, CompletionService};
use crate::error::CompletionError;
use crate::logging::ToolAuditLogger;
use crate::plugins::{self, ExecutionReport, ToolExecutor};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix of the synthetic user message carrying tool results
pub const PAYLOAD_MARKER: &str = "<!-- TOOL_PAYLOAD -->";

/// Everything a finished turn produced
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Input conversation plus every message the turn appended, ending with
    /// the final assistant reply
    pub messages: Vec<ChatMessage>,
    pub final_response: String,
    /// Present when the first completion requested tools
    pub report: Option<ExecutionReport>,
    pub malformed: usize,
}

pub struct ConversationReinjector {
    completion: Arc<dyn CompletionService>,
    executor: Arc<ToolExecutor>,
    audit: Option<Arc<ToolAuditLogger>>,
}

impl ConversationReinjector {
    pub fn new(completion: Arc<dyn CompletionService>, executor: Arc<ToolExecutor>) -> Self {
        Self {
            completion,
            executor,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<ToolAuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Run one turn.
    ///
    /// Tool calls in the follow-up completion are returned as text and never
    /// executed, so a turn makes at most two completion requests.
    pub async fn run_turn(
        &self,
        mut messages: Vec<ChatMessage>,
    ) -> Result<TurnOutcome, CompletionError> {
        let first = self.completion.complete(&messages).await?;
        let parsed = plugins::parse(&first);

        for span in &parsed.malformed {
            warn!("Ignoring malformed tool request at {:?}: {}", span.span, span.reason);
            if let Some(audit) = &self.audit {
                audit.log_malformed(&span.reason.to_string());
            }
        }
        let malformed = parsed.malformed.len();

        if parsed.requests.is_empty() {
            debug!("No tool calls in completion");
            messages.push(ChatMessage::assistant(first.clone()));
            return Ok(TurnOutcome {
                messages,
                final_response: first,
                report: None,
                malformed,
            });
        }

        info!("Executing {} tool call(s)", parsed.requests.len());
        let report = self.executor.execute(&parsed.requests).await;

        messages.push(ChatMessage::assistant(first));
        messages.push(ChatMessage::user(format!(
            "{}\n{}",
            PAYLOAD_MARKER, report.rendered
        )));

        let follow_up = self.completion.complete(&messages).await?;
        if plugins::contains_tool_call(&follow_up) {
            debug!("Follow-up completion requested more tools; not executed this turn");
        }
        messages.push(ChatMessage::assistant(follow_up.clone()));

        Ok(TurnOutcome {
            messages,
            final_response: follow_up,
            report: Some(report),
            malformed,
        })
    }
}
