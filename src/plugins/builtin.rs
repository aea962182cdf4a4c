//! Built-in direct plugins
//!
//! Provides in-process plugins that need no external executable. A plugin
//! directory selects one with `entryPoint.script`.

use super::direct::{DirectCatalog, DirectPlugin, PluginDependencies};
use super::protocol::{Arguments, PluginResponse};
use anyhow::{bail, Context};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Default read cap in bytes
const DEFAULT_MAX_SIZE: u64 = 102_400;

/// Catalog of every built-in direct plugin
pub fn catalog() -> DirectCatalog {
    let mut catalog = DirectCatalog::new();
    catalog.register("echo", || Arc::new(EchoPlugin));
    catalog.register("file_reader", || Arc::new(FileReaderPlugin::default()));
    catalog
}

/// Returns its `text` argument unchanged
pub struct EchoPlugin;

#[async_trait]
impl DirectPlugin for EchoPlugin {
    async fn initialize(
        &self,
        _settings: &Map<String, Value>,
        _deps: &PluginDependencies,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn process_tool_call(&self, arguments: Arguments) -> anyhow::Result<PluginResponse> {
        Ok(match arguments.require("text") {
            Ok(text) => PluginResponse::success(Value::String(text.to_string())),
            Err(e) => PluginResponse::error(&e),
        })
    }
}

/// Reads files below a fixed root directory.
///
/// Settings: `ROOT` (defaults to the project base path) and `MAX_SIZE` in
/// bytes. Paths resolving outside the root are refused.
#[derive(Default)]
pub struct FileReaderPlugin {
    state: OnceCell<ReaderState>,
}

struct ReaderState {
    root: PathBuf,
    max_size: u64,
}

impl FileReaderPlugin {
    fn state(&self) -> anyhow::Result<&ReaderState> {
        self.state
            .get()
            .context("file reader used before initialization")
    }

    async fn read(&self, state: &ReaderState, path: &str, max_size: u64) -> anyhow::Result<Value> {
        let requested = state.root.join(path);
        let resolved = tokio::fs::canonicalize(&requested)
            .await
            .with_context(|| format!("Failed to open file: {}", path))?;
        if !resolved.starts_with(&state.root) {
            bail!("Path is outside the readable root: {}", path);
        }

        let file = tokio::fs::File::open(&resolved)
            .await
            .with_context(|| format!("Failed to open file: {}", path))?;
        // One extra byte tells a file of exactly max_size from a longer one
        let mut buffer = Vec::new();
        file.take(max_size + 1)
            .read_to_end(&mut buffer)
            .await
            .with_context(|| format!("Failed to read file: {}", path))?;

        let truncated = buffer.len() as u64 > max_size;
        buffer.truncate(max_size as usize);
        debug!("Read {} bytes from {:?}", buffer.len(), resolved);

        Ok(json!({
            "content": String::from_utf8_lossy(&buffer),
            "path": path,
            "size": buffer.len(),
            "truncated": truncated,
        }))
    }
}

#[async_trait]
impl DirectPlugin for FileReaderPlugin {
    async fn initialize(
        &self,
        settings: &Map<String, Value>,
        deps: &PluginDependencies,
    ) -> anyhow::Result<()> {
        let root = settings
            .get("ROOT")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| deps.project_base_path.clone());
        let root = canonical_dir(&root)?;
        let max_size = settings
            .get("MAX_SIZE")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_SIZE);

        debug!("File reader rooted at {:?} (max {} bytes)", root, max_size);
        if self.state.set(ReaderState { root, max_size }).is_err() {
            bail!("file reader initialized twice");
        }
        Ok(())
    }

    async fn process_tool_call(&self, arguments: Arguments) -> anyhow::Result<PluginResponse> {
        let state = self.state()?;
        let path = match arguments.require("path") {
            Ok(p) => p,
            Err(e) => return Ok(PluginResponse::error(&e)),
        };
        let max_size = match arguments.get("max_size").map(str::parse::<u64>) {
            None => state.max_size,
            Some(Ok(n)) => n.min(state.max_size),
            Some(Err(_)) => return Ok(PluginResponse::error("max_size must be a number")),
        };

        Ok(match self.read(state, path, max_size).await {
            Ok(payload) => PluginResponse::success(payload),
            Err(e) => PluginResponse::error(&format!("{:#}", e)),
        })
    }
}

fn canonical_dir(path: &Path) -> anyhow::Result<PathBuf> {
    let resolved = std::fs::canonicalize(path)
        .with_context(|| format!("root directory {:?} is not accessible", path))?;
    if !resolved.is_dir() {
        bail!("root {:?} is not a directory", resolved);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::protocol::ResponseStatus;
    use std::fs;
    use tempfile::TempDir;

    fn deps(root: &Path) -> PluginDependencies {
        PluginDependencies {
            project_base_path: root.to_path_buf(),
            plugin_root: root.to_path_buf(),
            session_id: "test".to_string(),
        }
    }

    fn args(pairs: &[(&str, &str)]) -> Arguments {
        pairs.iter().copied().collect()
    }

    async fn reader(root: &Path, settings: Map<String, Value>) -> FileReaderPlugin {
        let plugin = FileReaderPlugin::default();
        plugin.initialize(&settings, &deps(root)).await.unwrap();
        plugin
    }

    #[test]
    fn test_catalog() {
        assert_eq!(catalog().scripts(), vec!["echo", "file_reader"]);
    }

    #[tokio::test]
    async fn test_echo() {
        let response = EchoPlugin
            .process_tool_call(args(&[("text", "hello")]))
            .await
            .unwrap();
        assert_eq!(response, PluginResponse::success(Value::from("hello")));

        let missing = EchoPlugin.process_tool_call(args(&[])).await.unwrap();
        assert_eq!(missing.status, ResponseStatus::Error);
        assert_eq!(missing.error.as_deref(), Some("Missing required parameter: text"));
    }

    #[tokio::test]
    async fn test_read_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("test.txt"), "Hello, World!").unwrap();
        let plugin = reader(temp_dir.path(), Map::new()).await;

        let response = plugin
            .process_tool_call(args(&[("path", "test.txt")]))
            .await
            .unwrap();
        let payload = response.result.unwrap();
        assert_eq!(payload["content"], "Hello, World!");
        assert_eq!(payload["size"], 13);
        assert_eq!(payload["truncated"], false);
    }

    #[tokio::test]
    async fn test_read_file_truncated() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("big.txt"), "0123456789").unwrap();
        let mut settings = Map::new();
        settings.insert("MAX_SIZE".to_string(), Value::from(8));
        let plugin = reader(temp_dir.path(), settings).await;

        let payload = plugin
            .process_tool_call(args(&[("path", "big.txt")]))
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(payload["content"], "01234567");
        assert_eq!(payload["truncated"], true);

        // The argument can only lower the configured cap
        let payload = plugin
            .process_tool_call(args(&[("path", "big.txt"), ("max_size", "4")]))
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(payload["content"], "0123");
    }

    #[tokio::test]
    async fn test_read_file_exact_size_not_truncated() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("exact.txt"), "12345678").unwrap();
        let mut settings = Map::new();
        settings.insert("MAX_SIZE".to_string(), Value::from(8));
        let plugin = reader(temp_dir.path(), settings).await;

        let payload = plugin
            .process_tool_call(args(&[("path", "exact.txt")]))
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(payload["truncated"], false);
    }

    #[tokio::test]
    async fn test_read_outside_root_refused() {
        let outer = TempDir::new().unwrap();
        let root = outer.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(outer.path().join("secret.txt"), "nope").unwrap();
        let plugin = reader(&root, Map::new()).await;

        let response = plugin
            .process_tool_call(args(&[("path", "../secret.txt")]))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.error.unwrap().contains("outside the readable root"));
    }

    #[tokio::test]
    async fn test_read_file_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = reader(temp_dir.path(), Map::new()).await;

        let response = plugin
            .process_tool_call(args(&[("path", "missing.txt")]))
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.error.unwrap().starts_with("Failed to open file"));
    }

    #[tokio::test]
    async fn test_initialize_rejects_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = Map::new();
        settings.insert("ROOT".to_string(), Value::from("/definitely/not/here"));

        let plugin = FileReaderPlugin::default();
        assert!(plugin.initialize(&settings, &deps(temp_dir.path())).await.is_err());
        assert!(plugin.process_tool_call(args(&[("path", "x")])).await.is_err());
    }
}
