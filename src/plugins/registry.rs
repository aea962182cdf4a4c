//! Plugin registry
//!
//! Discovers plugins under a root directory, validates their manifests,
//! initializes direct plugins and builds the tool name → plugin binding.
//! The binding is immutable once loading finishes.

use super::direct::{DirectCatalog, DirectPlugin, PluginDependencies};
use super::manifest::{self, EntryPoint, PluginManifest, Protocol};
use super::parser::{MARKER_END, MARKER_START, TOOL_NAME_KEY, VALUE_CLOSE, VALUE_OPEN};
use crate::error::{PluginInitError, RegistryError};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Manifest file name used when no other is configured
pub const DEFAULT_MANIFEST_FILE: &str = "plugin-manifest.json";

/// Everything a stdio call needs to spawn its process
#[derive(Debug, Clone, PartialEq)]
pub struct StdioLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Runtime handle of a plugin
#[derive(Clone)]
pub enum PluginHandle {
    Stdio(StdioLaunch),
    Direct(Arc<dyn DirectPlugin>),
    /// Entry point could not be resolved
    Unavailable,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginHandle::Stdio(launch) => f.debug_tuple("Stdio").field(launch).finish(),
            PluginHandle::Direct(_) => f.write_str("Direct(..)"),
            PluginHandle::Unavailable => f.write_str("Unavailable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStatus {
    Ready,
    Failed,
}

/// A loaded plugin
#[derive(Debug, Clone)]
pub struct PluginInstance {
    pub manifest: PluginManifest,
    pub directory: PathBuf,
    pub handle: PluginHandle,
    pub status: PluginStatus,
    pub last_error: Option<PluginInitError>,
}

impl PluginInstance {
    pub fn ready(manifest: PluginManifest, directory: PathBuf, handle: PluginHandle) -> Self {
        Self {
            manifest,
            directory,
            handle,
            status: PluginStatus::Ready,
            last_error: None,
        }
    }

    fn failed(
        manifest: PluginManifest,
        directory: PathBuf,
        handle: PluginHandle,
        error: PluginInitError,
    ) -> Self {
        Self {
            manifest,
            directory,
            handle,
            status: PluginStatus::Failed,
            last_error: Some(error),
        }
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn protocol(&self) -> Protocol {
        self.manifest.protocol
    }

    pub fn is_ready(&self) -> bool {
        self.status == PluginStatus::Ready
    }
}

/// A plugin directory whose manifest could not be loaded at all
#[derive(Debug, Clone)]
pub struct PluginFailure {
    pub name: String,
    pub directory: PathBuf,
    pub error: PluginInitError,
}

/// Tool name → plugin binding built once at startup
#[derive(Debug, Default)]
pub struct PluginRegistry {
    instances: Vec<Arc<PluginInstance>>,
    failures: Vec<PluginFailure>,
    dispatch: HashMap<String, Arc<PluginInstance>>,
}

impl PluginRegistry {
    /// Registry with no plugins
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every plugin below `root`.
    ///
    /// Only an unreadable root is an error; individual plugins that fail are
    /// recorded and excluded from dispatch.
    pub async fn load_all(
        root: &Path,
        manifest_file: &str,
        catalog: &DirectCatalog,
        deps: &PluginDependencies,
    ) -> Result<Self, RegistryError> {
        let entries = fs::read_dir(root).map_err(|source| RegistryError::RootUnreadable {
            path: root.to_path_buf(),
            source,
        })?;

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter(|path| {
                !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(true, |n| n.starts_with('.'))
            })
            .collect();
        dirs.sort();

        let mut registry = Self::empty();
        for dir in dirs {
            registry.load_plugin(&dir, manifest_file, catalog, deps).await;
        }

        info!(
            "Loaded {} plugin(s) providing {} tool(s); {} failed",
            registry.ready_plugins().count(),
            registry.dispatch.len(),
            registry.failed_count()
        );
        Ok(registry)
    }

    async fn load_plugin(
        &mut self,
        dir: &Path,
        manifest_file: &str,
        catalog: &DirectCatalog,
        deps: &PluginDependencies,
    ) {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let manifest = match PluginManifest::load(&dir.join(manifest_file)) {
            Ok(manifest) => manifest,
            Err(error) => {
                warn!("Skipping plugin directory '{}': {}", dir_name, error);
                self.failures.push(PluginFailure {
                    name: dir_name,
                    directory: dir.to_path_buf(),
                    error,
                });
                return;
            }
        };

        if self.instances.iter().any(|p| p.name() == manifest.name) {
            let error = PluginInitError::DuplicateName(manifest.name.clone());
            warn!("Plugin in '{}' rejected: {}", dir_name, error);
            self.push_failed(manifest, dir, PluginHandle::Unavailable, error);
            return;
        }

        let plugin_env = manifest::load_env_file(dir);
        let handle = match resolve_entry_point(&manifest, dir, &plugin_env, catalog) {
            Ok(handle) => handle,
            Err(error) => {
                warn!("Plugin '{}' failed: {}", manifest.name, error);
                self.push_failed(manifest, dir, PluginHandle::Unavailable, error);
                return;
            }
        };

        let init_error = match &handle {
            PluginHandle::Direct(plugin) => {
                initialize_direct(plugin, &manifest, &plugin_env, deps).await.err()
            }
            _ => None,
        };
        if let Some(error) = init_error {
            warn!("Plugin '{}' failed: {}", manifest.name, error);
            self.push_failed(manifest, dir, handle, error);
            return;
        }

        let instance = Arc::new(PluginInstance::ready(manifest, dir.to_path_buf(), handle));
        for tool in instance.manifest.tool_names() {
            match self.dispatch.get(tool) {
                Some(owner) => warn!(
                    "Tool '{}' from plugin '{}' already provided by '{}'; keeping the first",
                    tool,
                    instance.name(),
                    owner.name()
                ),
                None => {
                    self.dispatch.insert(tool.to_string(), Arc::clone(&instance));
                }
            }
        }

        info!(
            "Loaded plugin '{}' ({}) v{} - {} protocol",
            instance.manifest.display_name,
            instance.name(),
            instance.manifest.version,
            instance.protocol()
        );
        self.instances.push(instance);
    }

    fn push_failed(
        &mut self,
        manifest: PluginManifest,
        dir: &Path,
        handle: PluginHandle,
        error: PluginInitError,
    ) {
        self.instances.push(Arc::new(PluginInstance::failed(
            manifest,
            dir.to_path_buf(),
            handle,
            error,
        )));
    }

    /// Look up the plugin bound to a tool name
    pub fn resolve(&self, tool_name: &str) -> Option<Arc<PluginInstance>> {
        self.dispatch.get(tool_name).cloned()
    }

    /// Registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dispatch.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn ready_plugins(&self) -> impl Iterator<Item = &Arc<PluginInstance>> {
        self.instances.iter().filter(|p| p.is_ready())
    }

    /// Names and errors of every plugin excluded from dispatch
    pub fn failed_plugins(&self) -> Vec<(&str, &PluginInitError)> {
        let loaded = self
            .instances
            .iter()
            .filter_map(|p| p.last_error.as_ref().map(|e| (p.name(), e)));
        let unloaded = self.failures.iter().map(|f| (f.name.as_str(), &f.error));
        loaded.chain(unloaded).collect()
    }

    fn failed_count(&self) -> usize {
        self.instances.iter().filter(|p| !p.is_ready()).count() + self.failures.len()
    }

    /// Tool documentation for the system prompt, including the call syntax
    pub fn describe_tools(&self) -> String {
        let mut sections = Vec::new();
        for plugin in self.ready_plugins() {
            for tool in plugin.manifest.tool_names() {
                // Only describe bindings this plugin actually owns
                let owned = self
                    .dispatch
                    .get(tool)
                    .is_some_and(|owner| Arc::ptr_eq(owner, plugin));
                if !owned {
                    continue;
                }
                let command = plugin.manifest.capabilities.iter().find(|c| c.command == tool);
                let description = command
                    .map(|c| c.description.as_str())
                    .filter(|d| !d.is_empty())
                    .unwrap_or(plugin.manifest.description.as_str());
                sections.push(describe_tool(tool, description, command.map(|c| c.example.as_str())));
            }
        }

        if sections.is_empty() {
            return String::new();
        }
        format!(
            "# Available tools\n\nYou can call the following tools. Use one when the request needs it.\n\n{}",
            sections.join("\n\n")
        )
    }

    /// Teardown: let direct plugins release their resources
    pub async fn shutdown(&self) {
        for plugin in self.ready_plugins() {
            if let PluginHandle::Direct(direct) = &plugin.handle {
                debug!("Shutting down plugin '{}'", plugin.name());
                direct.shutdown().await;
            }
        }
    }
}

/// Runs `initialize` in its own task so a panicking plugin fails alone
async fn initialize_direct(
    plugin: &Arc<dyn DirectPlugin>,
    manifest: &PluginManifest,
    plugin_env: &BTreeMap<String, String>,
    deps: &PluginDependencies,
) -> Result<(), PluginInitError> {
    let settings = manifest::resolve_settings(manifest, plugin_env, &deps.project_base_path)?;
    debug!("Initializing '{}' with {} setting(s)", manifest.name, settings.len());

    let plugin = Arc::clone(plugin);
    let deps = deps.clone();
    let task = tokio::spawn(async move { plugin.initialize(&settings, &deps).await });
    match task.await {
        Ok(result) => result.map_err(|e| PluginInitError::Initialize(format!("{:#}", e))),
        Err(join_error) if join_error.is_panic() => Err(PluginInitError::Initialize(
            "plugin panicked during initialization".to_string(),
        )),
        Err(join_error) => Err(PluginInitError::Initialize(format!(
            "initialization task failed: {}",
            join_error
        ))),
    }
}

fn describe_tool(tool: &str, description: &str, example: Option<&str>) -> String {
    let mut text = format!("## {}\n\n{}\n", tool, description);
    if let Some(example) = example.filter(|e| !e.is_empty()) {
        text.push_str(&format!("\nExample arguments:\n```json\n{}\n```\n", example));
    }
    text.push_str(&format!(
        "\nTo call this tool, output:\n\n{start}\n{key}:{open}{tool}{close},\nparam1:{open}value1{close},\nparam2:{open}value2{close}\n{end}\n\nWrap every value in {open} and {close}, separate parameters with commas, and keep the whole call between the two markers.",
        start = MARKER_START,
        end = MARKER_END,
        key = TOOL_NAME_KEY,
        open = VALUE_OPEN,
        close = VALUE_CLOSE,
        tool = tool,
    ));
    text
}

/// Turn a manifest entry point into a runtime handle
fn resolve_entry_point(
    manifest: &PluginManifest,
    dir: &Path,
    plugin_env: &BTreeMap<String, String>,
    catalog: &DirectCatalog,
) -> Result<PluginHandle, PluginInitError> {
    match &manifest.entry_point {
        EntryPoint::Command(command) => {
            let mut parts = command.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| PluginInitError::EntryPoint("empty command".to_string()))?;
            let program = resolve_program(program, dir).ok_or_else(|| {
                PluginInitError::EntryPoint(format!("executable not found: {}", program))
            })?;
            Ok(PluginHandle::Stdio(StdioLaunch {
                program,
                args: parts.map(str::to_string).collect(),
                cwd: dir.to_path_buf(),
                env: plugin_env.clone(),
            }))
        }
        EntryPoint::Script(script) => catalog
            .instantiate(script)
            .map(PluginHandle::Direct)
            .ok_or_else(|| {
                PluginInitError::EntryPoint(format!("no direct plugin registered as '{}'", script))
            }),
    }
}

/// Find the executable for a command's program word.
///
/// Words containing a path separator are taken relative to the plugin
/// directory; bare names are searched on `PATH`.
fn resolve_program(program: &str, dir: &Path) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            dir.join(candidate)
        };
        return is_executable(&path).then_some(path);
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|p| p.join(program))
        .find(|p| is_executable(p))
}

/// Check if a file is executable
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
