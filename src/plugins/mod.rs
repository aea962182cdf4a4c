//! Plugin system for toolrelay
//!
//! Finds tool calls in model output, dispatches them to stdio or in-process
//! plugins and renders the results for the next completion.

#![allow(dead_code)]
#![allow(unused_imports)]

mod adapter;
mod builtin;
mod direct;
mod executor;
mod manifest;
mod parser;
mod protocol;
mod registry;
mod stdio;

pub use adapter::ToolAdapter;
pub use builtin::{catalog as builtin_catalog, EchoPlugin, FileReaderPlugin};
pub use direct::{DirectAdapter, DirectCatalog, DirectPlugin, PluginDependencies};
pub use executor::{render_results, ExecutionReport, ExecutorLimits, ToolExecutor};
pub use manifest::{EntryPoint, InvocationCommand, PluginManifest, Protocol};
pub use parser::{contains_tool_call, parse, MalformedReason, MalformedSpan, ParseOutcome};
pub use protocol::{
    Arguments, PluginResponse, ResponseStatus, ToolCallRequest, ToolExecutionResult, ToolStatus,
};
pub use registry::{PluginHandle, PluginInstance, PluginRegistry, PluginStatus, DEFAULT_MANIFEST_FILE};
pub use stdio::StdioAdapter;

#[cfg(test)]
pub(crate) use registry::tests::fixture as registry_fixture;
