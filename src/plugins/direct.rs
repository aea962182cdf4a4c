//! Direct (in-process) plugins
//!
//! A direct plugin is a Rust object implementing [`DirectPlugin`], selected by
//! the manifest's `entryPoint.script` from a [`DirectCatalog`].

use super::adapter::ToolAdapter;
use super::protocol::{Arguments, PluginResponse, ToolCallRequest, ToolExecutionResult};
use super::registry::{PluginHandle, PluginInstance};
use crate::error::ToolError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fixed set of collaborators handed to every direct plugin
#[derive(Debug, Clone)]
pub struct PluginDependencies {
    /// Root of the host project
    pub project_base_path: PathBuf,
    /// Root directory the plugins were loaded from
    pub plugin_root: PathBuf,
    /// Identifier of the running session
    pub session_id: String,
}

/// Capability interface every direct plugin implements
#[async_trait]
pub trait DirectPlugin: Send + Sync {
    /// One-time setup before the plugin is marked ready
    async fn initialize(
        &self,
        settings: &Map<String, Value>,
        deps: &PluginDependencies,
    ) -> anyhow::Result<()>;

    /// Handle one tool call
    async fn process_tool_call(&self, arguments: Arguments) -> anyhow::Result<PluginResponse>;

    /// Release resources at registry teardown
    async fn shutdown(&self) {}
}

type PluginFactory = Box<dyn Fn() -> Arc<dyn DirectPlugin> + Send + Sync>;

/// Compiled-in direct plugins, keyed by `entryPoint.script`
#[derive(Default)]
pub struct DirectCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl DirectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a script key
    pub fn register<F>(&mut self, script: &str, factory: F)
    where
        F: Fn() -> Arc<dyn DirectPlugin> + Send + Sync + 'static,
    {
        self.factories.insert(script.to_string(), Box::new(factory));
    }

    pub fn contains(&self, script: &str) -> bool {
        self.factories.contains_key(script)
    }

    /// Create a fresh plugin object for a script key
    pub fn instantiate(&self, script: &str) -> Option<Arc<dyn DirectPlugin>> {
        self.factories.get(script).map(|factory| factory())
    }

    pub fn scripts(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

/// Invokes direct plugins in a spawned task raced against the timeout.
///
/// A timed-out call is reported as `timeout`, but its task is only detached,
/// not stopped: the plugin body keeps running until it finishes on its own.
#[derive(Debug, Default, Clone)]
pub struct DirectAdapter;

impl DirectAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn call(
        &self,
        instance: &PluginInstance,
        request: &ToolCallRequest,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let PluginHandle::Direct(plugin) = &instance.handle else {
            return Err(ToolError::Plugin(format!(
                "plugin '{}' is not a direct plugin",
                instance.name()
            )));
        };

        let plugin = Arc::clone(plugin);
        let arguments = request.arguments.clone();
        let task = tokio::spawn(async move { plugin.process_tool_call(arguments).await });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                warn!(
                    "Direct plugin '{}' exceeded {:?} for tool '{}'; call left running",
                    instance.name(),
                    timeout,
                    request.tool_name
                );
                Err(ToolError::Timeout(timeout))
            }
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    "plugin panicked".to_string()
                } else {
                    format!("plugin task failed: {}", join_error)
                };
                Err(ToolError::Plugin(message))
            }
            Ok(Ok(Err(e))) => Err(ToolError::Plugin(format!("{:#}", e))),
            Ok(Ok(Ok(response))) => response.into_outcome(),
        }
    }
}

#[async_trait]
impl ToolAdapter for DirectAdapter {
    async fn invoke(
        &self,
        instance: &PluginInstance,
        request: &ToolCallRequest,
        timeout: Duration,
    ) -> ToolExecutionResult {
        let start = Instant::now();
        debug!(
            "Calling direct plugin '{}' for tool '{}'",
            instance.name(),
            request.tool_name
        );
        let outcome = self.call(instance, request, timeout).await;
        ToolExecutionResult::from_outcome(&request.tool_name, outcome, start.elapsed())
    }
}
