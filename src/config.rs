//! Configuration management for toolrelay
//!
//! Handles loading and merging configuration from multiple sources:
//! 1. Compiled defaults
//! 2. System config (/etc/toolrelay/config.toml)
//! 3. User config (~/.toolrelay/config.toml)
//! 4. CLI-specified config file
//! 5. Environment variables

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub plugins: PluginConfig,
    pub completion: CompletionConfig,
    pub audit: AuditConfig,
}

/// Plugin subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Enable plugins
    pub enabled: bool,
    /// Root directory holding one subdirectory per plugin
    pub directory: PathBuf,
    /// Manifest file name expected in each plugin directory
    pub manifest_file: String,
    /// Maximum tool calls running at once within a turn
    pub max_concurrency: usize,
    /// Timeout used when a manifest declares none (milliseconds)
    pub default_timeout_ms: u64,
    /// Wait between SIGTERM and SIGKILL for a timed-out stdio plugin (milliseconds)
    pub grace_period_ms: u64,
    /// Bytes of stderr kept in failure diagnostics
    pub stderr_excerpt_bytes: usize,
    /// Characters of a payload kept in the rendered results block
    pub result_preview_chars: usize,
    /// Base path handed to direct plugins
    pub project_base_path: Option<PathBuf>,
}

/// Completion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Chat completions endpoint URL
    pub endpoint: String,
    /// Model identifier
    pub model: String,
    /// Environment variable containing API key
    pub api_key_env: String,
    /// Maximum tokens for response
    pub max_tokens: u32,
    /// Request timeout in seconds
    pub timeout: u64,
    /// Temperature for generation
    pub temperature: f32,
}

/// Tool call audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Record every executed tool call
    pub enabled: bool,
    /// Log file path
    pub log_path: PathBuf,
    /// Maximum log file size before rotation
    pub max_log_size: u64,
    /// Number of rotated logs to keep
    pub log_retention: u32,
    /// Redact secrets from logs
    pub redact_secrets: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: true,
            directory: home.join(".toolrelay/plugins"),
            manifest_file: "plugin-manifest.json".to_string(),
            max_concurrency: 4,
            default_timeout_ms: 60_000,
            grace_period_ms: 250,
            stderr_excerpt_bytes: 2048,
            result_preview_chars: 1000,
            project_base_path: None,
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 2048,
            timeout: 60,
            temperature: 0.7,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            enabled: false,
            log_path: home.join(".toolrelay/logs/tools.log"),
            max_log_size: 10 * 1024 * 1024, // 10MB
            log_retention: 5,
            redact_secrets: true,
        }
    }
}

impl PluginConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Base path for direct plugins, falling back to the current directory
    pub fn base_path(&self) -> PathBuf {
        self.project_base_path.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(cli_config: Option<&Path>) -> Result<Self, ConfigError> {
        let mut layers: Vec<PathBuf> = Vec::new();

        let system_config = Path::new("/etc/toolrelay/config.toml");
        if system_config.exists() {
            debug!("Loading system config from {:?}", system_config);
            layers.push(system_config.to_path_buf());
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".toolrelay/config.toml");
            if user_config.exists() {
                debug!("Loading user config from {:?}", user_config);
                layers.push(user_config);
            }
        }

        if let Some(path) = cli_config {
            debug!("Loading CLI config from {:?}", path);
            layers.push(path.to_path_buf());
        }

        let mut config = Self::from_layers(&layers)?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Build a config from files in increasing precedence.
    ///
    /// Keys a file leaves out keep the value from earlier layers.
    fn from_layers(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in paths {
            merge_tables(&mut merged, read_table(path)?);
        }
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("TOOLRELAY_PLUGIN_DIR") {
            self.plugins.directory = PathBuf::from(dir);
        }
        if let Ok(limit) = std::env::var("TOOLRELAY_MAX_CONCURRENCY") {
            match limit.parse() {
                Ok(n) => self.plugins.max_concurrency = n,
                Err(_) => debug!("Ignoring invalid TOOLRELAY_MAX_CONCURRENCY={}", limit),
            }
        }
        if let Ok(endpoint) = std::env::var("TOOLRELAY_ENDPOINT") {
            self.completion.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("TOOLRELAY_MODEL") {
            self.completion.model = model;
        }
        if let Ok(log) = std::env::var("TOOLRELAY_AUDIT_LOG") {
            self.audit.enabled = true;
            self.audit.log_path = PathBuf::from(log);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plugins.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "plugins.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.plugins.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "plugins.default_timeout_ms must be positive".to_string(),
            ));
        }
        if self.plugins.manifest_file.is_empty() {
            return Err(ConfigError::MissingField("plugins.manifest_file".to_string()));
        }
        if self.completion.endpoint.is_empty() {
            return Err(ConfigError::MissingField("completion.endpoint".to_string()));
        }
        if self.completion.model.is_empty() {
            return Err(ConfigError::MissingField("completion.model".to_string()));
        }
        Ok(())
    }

    /// Get API key from environment
    pub fn get_api_key(&self) -> Option<String> {
        std::env::var(&self.completion.api_key_env).ok()
    }
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
    let table: toml::Table = toml::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
    // Reject wrong types per layer so the error names the file
    let _: Config = toml::Value::Table(table.clone())
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
    Ok(table)
}

/// Overlay `layer` onto `base`, descending into nested tables
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.plugins.enabled);
        assert_eq!(config.plugins.max_concurrency, 4);
        assert_eq!(config.plugins.manifest_file, "plugin-manifest.json");
        assert_eq!(config.plugins.default_timeout(), Duration::from_secs(60));
        assert!(!config.audit.enabled);
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_invalid() {
        let mut config = Config::default();
        config.plugins.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [plugins]
            directory = "/opt/plugins"
            max_concurrency = 8
            grace_period_ms = 100

            [completion]
            model = "qwen-plus"

            [audit]
            enabled = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.plugins.directory, PathBuf::from("/opt/plugins"));
        assert_eq!(config.plugins.max_concurrency, 8);
        assert_eq!(config.plugins.grace_period(), Duration::from_millis(100));
        assert_eq!(config.completion.model, "qwen-plus");
        assert!(config.audit.enabled);
        // Untouched fields keep their defaults
        assert_eq!(config.plugins.stderr_excerpt_bytes, 2048);
    }

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_layer_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = write(
            temp_dir.path(),
            "config.toml",
            "[plugins]\ndefault_timeout_ms = 5000\n\n[completion]\nendpoint = \"http://localhost:8080/v1/chat/completions\"\n",
        );

        let config = Config::from_layers(&[path]).unwrap();

        assert_eq!(config.plugins.default_timeout_ms, 5000);
        assert_eq!(
            config.completion.endpoint,
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(config.completion.model, "gpt-4o-mini");
    }

    #[test]
    fn test_later_layer_keeps_unset_flags() {
        let temp_dir = TempDir::new().unwrap();
        let user = write(
            temp_dir.path(),
            "user.toml",
            "[plugins]\nenabled = false\nmax_concurrency = 2\n\n[audit]\nenabled = true\nredact_secrets = false\n",
        );
        let cli = write(
            temp_dir.path(),
            "cli.toml",
            "[completion]\nmodel = \"qwen-plus\"\n",
        );

        let config = Config::from_layers(&[user, cli]).unwrap();

        assert!(!config.plugins.enabled);
        assert!(config.audit.enabled);
        assert!(!config.audit.redact_secrets);
        assert_eq!(config.plugins.max_concurrency, 2);
        assert_eq!(config.completion.model, "qwen-plus");
    }

    #[test]
    fn test_later_layer_can_restore_default_value() {
        let temp_dir = TempDir::new().unwrap();
        let user = write(temp_dir.path(), "user.toml", "[plugins]\nmax_concurrency = 16\n");
        let cli = write(temp_dir.path(), "cli.toml", "[plugins]\nmax_concurrency = 4\n");

        let config = Config::from_layers(&[user, cli]).unwrap();
        assert_eq!(config.plugins.max_concurrency, 4);
    }

    #[test]
    fn test_bad_layer_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let broken = write(temp_dir.path(), "broken.toml", "[plugins\nbroken");
        let err = Config::from_layers(&[broken]).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let mistyped = write(temp_dir.path(), "typed.toml", "[plugins]\nmax_concurrency = \"many\"\n");
        let err = Config::from_layers(&[mistyped]).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(message) if message.contains("typed.toml")));
    }
}
