//! Invocation contract shared by both protocols

use super::protocol::{ToolCallRequest, ToolExecutionResult};
use super::registry::PluginInstance;
use async_trait::async_trait;
use std::time::Duration;

/// Runs one resolved request against a plugin instance.
///
/// Implementations never return an error: every failure, including a timeout,
/// is reported through the returned result.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn invoke(
        &self,
        instance: &PluginInstance,
        request: &ToolCallRequest,
        timeout: Duration,
    ) -> ToolExecutionResult;
}
