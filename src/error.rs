//! Error types for toolrelay

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for toolrelay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Plugin registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Fatal errors of plugin subsystem startup
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Plugin root {path:?} is unreadable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a single plugin is excluded from dispatch
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginInitError {
    #[error("Manifest not found: {0}")]
    MissingManifest(String),

    #[error("Failed to read manifest: {0}")]
    Read(String),

    #[error("Failed to parse manifest: {0}")]
    Parse(String),

    #[error("Invalid manifest: {0}")]
    Invalid(String),

    #[error("Entry point not resolvable: {0}")]
    EntryPoint(String),

    #[error("Duplicate plugin name: {0}")]
    DuplicateName(String),

    #[error("Initialization failed: {0}")]
    Initialize(String),
}

/// Per-call failures; every variant ends up inside a `ToolExecutionResult`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("{0}")]
    Process(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Plugin(String),
}

/// Completion service errors
#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse completion response: {0}")]
    Parse(String),

    #[error("Completion service unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_messages() {
        assert_eq!(
            ToolError::NotFound("Weather".to_string()).to_string(),
            "unknown tool: Weather"
        );
        assert_eq!(
            ToolError::Timeout(Duration::from_millis(1500)).to_string(),
            "timed out after 1500ms"
        );
    }

    #[test]
    fn test_registry_error_wraps() {
        let err = RegistryError::RootUnreadable {
            path: PathBuf::from("/nope"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let relay: RelayError = err.into();
        assert!(relay.to_string().contains("/nope"));
    }
}
