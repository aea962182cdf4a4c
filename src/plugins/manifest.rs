//! Plugin manifest format
//!
//! Each plugin directory carries one `plugin-manifest.json` describing its
//! protocol, entry point and the tools it advertises, plus an optional
//! `config.env` with plugin-specific settings.

use crate::error::PluginInitError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the optional per-plugin settings file
pub const CONFIG_ENV_FILE: &str = "config.env";

/// Invocation protocol of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Stdio,
    Direct,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Stdio => f.write_str("stdio"),
            Protocol::Direct => f.write_str("direct"),
        }
    }
}

/// Where a plugin's code lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    /// Command line spawned per call (stdio)
    Command(String),
    /// Key into the compiled-in direct plugin catalog (direct)
    Script(String),
}

/// One tool advertised by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationCommand {
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "string_or_json")]
    pub example: String,
}

/// Declared type of a configuration key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    String,
    Integer,
    Boolean,
}

/// Validated plugin manifest
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub description: String,
    pub protocol: Protocol,
    pub entry_point: EntryPoint,
    pub timeout: Option<Duration>,
    pub capabilities: Vec<InvocationCommand>,
    pub config_schema: BTreeMap<String, ConfigType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    #[serde(default)]
    name: String,
    display_name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    communication: CommunicationSection,
    #[serde(default)]
    entry_point: EntryPointSection,
    #[serde(default)]
    capabilities: CapabilitiesSection,
    #[serde(default)]
    config_schema: BTreeMap<String, SchemaEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct CommunicationSection {
    protocol: Option<String>,
    /// Milliseconds
    timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EntryPointSection {
    command: Option<String>,
    script: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesSection {
    #[serde(default)]
    invocation_commands: Vec<InvocationCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SchemaEntry {
    Type(String),
    Detailed {
        #[serde(rename = "type")]
        kind: String,
    },
}

fn string_or_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    })
}

impl PluginManifest {
    /// Load and validate a manifest file
    pub fn load(path: &Path) -> Result<Self, PluginInitError> {
        if !path.is_file() {
            return Err(PluginInitError::MissingManifest(path.display().to_string()));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| PluginInitError::Read(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse and validate manifest JSON
    pub fn parse(content: &str) -> Result<Self, PluginInitError> {
        let file: ManifestFile =
            serde_json::from_str(content).map_err(|e| PluginInitError::Parse(e.to_string()))?;
        Self::validate(file)
    }

    fn validate(file: ManifestFile) -> Result<Self, PluginInitError> {
        let name = file.name.trim().to_string();
        if name.is_empty() {
            return Err(PluginInitError::Invalid("name must not be empty".to_string()));
        }

        // Manifests without a protocol are treated as in-process plugins
        let protocol = match file.communication.protocol.as_deref().map(str::trim) {
            None | Some("direct") => Protocol::Direct,
            Some("stdio") => Protocol::Stdio,
            Some(other) => {
                return Err(PluginInitError::Invalid(format!(
                    "unknown protocol '{}' (expected stdio or direct)",
                    other
                )))
            }
        };

        let entry_point = match protocol {
            Protocol::Stdio => EntryPoint::Command(non_empty(
                file.entry_point.command,
                "entryPoint.command is required for stdio plugins",
            )?),
            Protocol::Direct => EntryPoint::Script(non_empty(
                file.entry_point.script,
                "entryPoint.script is required for direct plugins",
            )?),
        };

        let timeout = match file.communication.timeout {
            Some(0) => {
                return Err(PluginInitError::Invalid(
                    "communication.timeout must be positive".to_string(),
                ))
            }
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };

        let mut capabilities = Vec::with_capacity(file.capabilities.invocation_commands.len());
        for cmd in file.capabilities.invocation_commands {
            if cmd.command.trim().is_empty() {
                return Err(PluginInitError::Invalid(
                    "invocation command name must not be empty".to_string(),
                ));
            }
            capabilities.push(InvocationCommand {
                command: cmd.command.trim().to_string(),
                ..cmd
            });
        }

        let mut config_schema = BTreeMap::new();
        for (key, entry) in file.config_schema {
            let kind = match entry {
                SchemaEntry::Type(kind) | SchemaEntry::Detailed { kind } => kind,
            };
            let ty = match kind.as_str() {
                "integer" => ConfigType::Integer,
                "boolean" => ConfigType::Boolean,
                _ => ConfigType::String,
            };
            config_schema.insert(key, ty);
        }

        Ok(Self {
            display_name: file.display_name.unwrap_or_else(|| name.clone()),
            name,
            version: file.version.unwrap_or_default(),
            description: file.description.unwrap_or_default(),
            protocol,
            entry_point,
            timeout,
            capabilities,
            config_schema,
        })
    }

    /// Tool names this plugin claims; the plugin name when it lists none
    pub fn tool_names(&self) -> Vec<&str> {
        if self.capabilities.is_empty() {
            vec![self.name.as_str()]
        } else {
            self.capabilities.iter().map(|c| c.command.as_str()).collect()
        }
    }
}

fn non_empty(value: Option<String>, message: &str) -> Result<String, PluginInitError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(PluginInitError::Invalid(message.to_string())),
    }
}

/// Read `config.env` from a plugin directory; missing or broken files yield no entries
pub fn load_env_file(plugin_dir: &Path) -> BTreeMap<String, String> {
    let path = plugin_dir.join(CONFIG_ENV_FILE);
    if !path.exists() {
        debug!("No {} in {:?}", CONFIG_ENV_FILE, plugin_dir);
        return BTreeMap::new();
    }

    let iter = match dotenvy::from_path_iter(&path) {
        Ok(iter) => iter,
        Err(e) => {
            warn!("Failed to open {:?}: {}", path, e);
            return BTreeMap::new();
        }
    };

    let mut entries = BTreeMap::new();
    for item in iter {
        match item {
            Ok((key, value)) => {
                entries.insert(key, value);
            }
            Err(e) => {
                warn!("Error loading {:?}: {}", path, e);
                return BTreeMap::new();
            }
        }
    }
    debug!("Loaded {} settings from {:?}", entries.len(), path);
    entries
}

/// Build the settings handed to a direct plugin's `initialize`.
///
/// Each schema key is looked up in the plugin's own `config.env` first and the
/// process environment second, then converted to its declared type.
/// `DebugMode` is always present.
pub fn resolve_settings(
    manifest: &PluginManifest,
    plugin_env: &BTreeMap<String, String>,
    project_base_path: &Path,
) -> Result<Map<String, Value>, PluginInitError> {
    let lookup = |key: &str| {
        plugin_env
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    };

    let mut settings = Map::new();
    for (key, ty) in &manifest.config_schema {
        let Some(raw) = lookup(key) else {
            continue;
        };
        let value = match ty {
            ConfigType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| {
                    PluginInitError::Initialize(format!("{} must be an integer, got '{}'", key, raw))
                })?,
            ConfigType::Boolean => Value::Bool(raw.trim().eq_ignore_ascii_case("true")),
            ConfigType::String => Value::String(raw),
        };
        settings.insert(key.clone(), value);
    }

    let debug_mode = lookup("DebugMode").unwrap_or_else(|| "false".to_string());
    settings.insert(
        "DebugMode".to_string(),
        Value::Bool(debug_mode.trim().eq_ignore_ascii_case("true")),
    );
    settings.insert(
        "PROJECT_BASE_PATH".to_string(),
        Value::String(project_base_path.display().to_string()),
    );

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STDIO_MANIFEST: &str = r#"{
        "name": "DeepMemo",
        "displayName": "Deep Memory",
        "version": "1.2.0",
        "communication": { "protocol": "stdio", "timeout": 5000 },
        "entryPoint": { "command": "python3 main.py" },
        "capabilities": {
            "invocationCommands": [
                { "command": "DeepMemo", "description": "Search memories", "example": { "keyword": "rain" } }
            ]
        }
    }"#;

    #[test]
    fn test_parse_stdio_manifest() {
        let manifest = PluginManifest::parse(STDIO_MANIFEST).unwrap();
        assert_eq!(manifest.name, "DeepMemo");
        assert_eq!(manifest.display_name, "Deep Memory");
        assert_eq!(manifest.protocol, Protocol::Stdio);
        assert_eq!(manifest.entry_point, EntryPoint::Command("python3 main.py".to_string()));
        assert_eq!(manifest.timeout, Some(Duration::from_millis(5000)));
        assert_eq!(manifest.tool_names(), vec!["DeepMemo"]);
        assert!(manifest.capabilities[0].example.contains("\"keyword\""));
    }

    #[test]
    fn test_parse_direct_manifest_defaults() {
        let manifest = PluginManifest::parse(
            r#"{ "name": "Echo", "entryPoint": { "script": "echo" } }"#,
        )
        .unwrap();
        assert_eq!(manifest.protocol, Protocol::Direct);
        assert_eq!(manifest.display_name, "Echo");
        assert_eq!(manifest.timeout, None);
        assert_eq!(manifest.tool_names(), vec!["Echo"]);
    }

    #[test]
    fn test_invalid_manifests() {
        let cases = [
            r#"{ "name": "  ", "entryPoint": { "script": "echo" } }"#,
            r#"{ "name": "X", "communication": { "protocol": "grpc" }, "entryPoint": { "script": "x" } }"#,
            r#"{ "name": "X", "communication": { "protocol": "stdio" }, "entryPoint": { "script": "x" } }"#,
            r#"{ "name": "X", "communication": { "protocol": "direct" }, "entryPoint": {} }"#,
            r#"{ "name": "X", "communication": { "protocol": "stdio", "timeout": 0 }, "entryPoint": { "command": "x" } }"#,
            r#"{ "name": "X", "entryPoint": { "script": "x" }, "capabilities": { "invocationCommands": [ { "command": "" } ] } }"#,
        ];
        for case in cases {
            assert!(
                matches!(PluginManifest::parse(case), Err(PluginInitError::Invalid(_))),
                "expected invalid: {}",
                case
            );
        }
        assert!(matches!(
            PluginManifest::parse("{ not json"),
            Err(PluginInitError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let err = PluginManifest::load(&temp_dir.path().join("plugin-manifest.json")).unwrap_err();
        assert!(matches!(err, PluginInitError::MissingManifest(_)));
    }

    #[test]
    fn test_load_env_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_env_file(temp_dir.path()).is_empty());

        fs::write(
            temp_dir.path().join(CONFIG_ENV_FILE),
            "# comment\nAPI_URL=http://localhost:9000\nLIMIT=5\n",
        )
        .unwrap();
        let env = load_env_file(temp_dir.path());
        assert_eq!(env.get("API_URL").map(String::as_str), Some("http://localhost:9000"));
        assert_eq!(env.get("LIMIT").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_resolve_settings_typed() {
        let manifest = PluginManifest::parse(
            r#"{
                "name": "Daily",
                "entryPoint": { "script": "daily" },
                "configSchema": {
                    "TOOLRELAY_TEST_LIMIT": "integer",
                    "TOOLRELAY_TEST_STRICT": { "type": "boolean" },
                    "TOOLRELAY_TEST_LABEL": "string",
                    "TOOLRELAY_TEST_ABSENT": "string"
                }
            }"#,
        )
        .unwrap();

        let env: BTreeMap<String, String> = [
            ("TOOLRELAY_TEST_LIMIT", "12"),
            ("TOOLRELAY_TEST_STRICT", "True"),
            ("TOOLRELAY_TEST_LABEL", "diary"),
            ("DebugMode", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = resolve_settings(&manifest, &env, Path::new("/srv/app")).unwrap();
        assert_eq!(settings["TOOLRELAY_TEST_LIMIT"], Value::from(12));
        assert_eq!(settings["TOOLRELAY_TEST_STRICT"], Value::Bool(true));
        assert_eq!(settings["TOOLRELAY_TEST_LABEL"], Value::from("diary"));
        assert!(!settings.contains_key("TOOLRELAY_TEST_ABSENT"));
        assert_eq!(settings["DebugMode"], Value::Bool(true));
        assert_eq!(settings["PROJECT_BASE_PATH"], Value::from("/srv/app"));
    }

    #[test]
    fn test_resolve_settings_bad_integer() {
        let manifest = PluginManifest::parse(
            r#"{ "name": "D", "entryPoint": { "script": "d" }, "configSchema": { "TOOLRELAY_TEST_N": "integer" } }"#,
        )
        .unwrap();
        let env: BTreeMap<String, String> =
            [("TOOLRELAY_TEST_N".to_string(), "many".to_string())].into_iter().collect();
        assert!(matches!(
            resolve_settings(&manifest, &env, Path::new(".")),
            Err(PluginInitError::Initialize(_))
        ));
    }
}
