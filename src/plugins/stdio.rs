//! Stdio plugins
//!
//! Each call spawns a fresh process, writes one JSON request to its stdin,
//! closes stdin and reads one JSON response from stdout. The process runs in
//! its own process group so that a timeout can take down everything it
//! started.

use super::adapter::ToolAdapter;
use super::protocol::{PluginResponse, StdioRequest, ToolCallRequest, ToolExecutionResult};
use super::registry::{PluginHandle, PluginInstance, StdioLaunch};
use crate::error::ToolError;
use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Default delay between the polite and the forced kill
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// Default bound on the stderr text carried in a failure
pub const DEFAULT_STDERR_EXCERPT: usize = 2048;

/// Invokes stdio plugins, one process per call
#[derive(Debug, Clone)]
pub struct StdioAdapter {
    grace_period: Duration,
    stderr_excerpt_bytes: usize,
}

impl Default for StdioAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD, DEFAULT_STDERR_EXCERPT)
    }
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl StdioAdapter {
    pub fn new(grace_period: Duration, stderr_excerpt_bytes: usize) -> Self {
        Self {
            grace_period,
            stderr_excerpt_bytes,
        }
    }

    async fn call(
        &self,
        instance: &PluginInstance,
        request: &ToolCallRequest,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let PluginHandle::Stdio(launch) = &instance.handle else {
            return Err(ToolError::Process(format!(
                "plugin '{}' is not a stdio plugin",
                instance.name()
            )));
        };

        let envelope = serde_json::to_vec(&StdioRequest {
            tool: &request.tool_name,
            arguments: &request.arguments,
        })
        .map_err(|e| ToolError::Process(format!("failed to encode request: {}", e)))?;

        let mut child = spawn(launch)?;
        let pid = child.id();
        debug!(
            "Spawned '{}' (pid {:?}) for tool '{}'",
            launch.program.display(),
            pid,
            request.tool_name
        );

        let outcome = tokio::time::timeout(timeout, communicate(&mut child, envelope)).await;
        let result = match outcome {
            Ok(Ok(output)) => self.interpret(output),
            Ok(Err(e)) => {
                if let Some(pid) = pid {
                    signal_group(pid, GroupSignal::Kill);
                }
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill plugin process: {}", e);
                }
                Err(ToolError::Process(format!("plugin I/O failed: {}", e)))
            }
            Err(_) => {
                warn!(
                    "Plugin '{}' exceeded {:?} for tool '{}'; terminating",
                    instance.name(),
                    timeout,
                    request.tool_name
                );
                self.terminate(&mut child, pid).await;
                Err(ToolError::Timeout(timeout))
            }
        };
        result
    }

    fn interpret(&self, output: ProcessOutput) -> Result<Value, ToolError> {
        let stderr = self.excerpt(&output.stderr);

        if !output.status.success() {
            let exit = match output.status.code() {
                Some(code) => format!("plugin exited with status {}", code),
                None => "plugin was terminated by a signal".to_string(),
            };
            return Err(ToolError::Process(if stderr.is_empty() {
                exit
            } else {
                format!("{}: {}", exit, stderr)
            }));
        }

        if !stderr.is_empty() {
            debug!("Plugin stderr: {}", stderr);
        }

        PluginResponse::from_slice(&output.stdout)
            .map_err(ToolError::Process)?
            .into_outcome()
    }

    /// Leading part of stderr, cut on a character boundary
    fn excerpt(&self, stderr: &[u8]) -> String {
        let text = String::from_utf8_lossy(stderr);
        let text = text.trim();
        if text.len() <= self.stderr_excerpt_bytes {
            return text.to_string();
        }
        let mut end = self.stderr_excerpt_bytes;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL and reap
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            signal_group(pid, GroupSignal::Terminate);
        }
        if tokio::time::timeout(self.grace_period, leader_exit(child))
            .await
            .is_err()
        {
            debug!("Plugin ignored SIGTERM for {:?}; killing", self.grace_period);
        }

        // Whatever is left of the group goes too
        if let Some(pid) = pid {
            signal_group(pid, GroupSignal::Kill);
        }
        if let Err(e) = child.kill().await {
            warn!("Failed to kill plugin process: {}", e);
        }
    }
}

fn spawn(launch: &StdioLaunch) -> Result<Child, ToolError> {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .current_dir(&launch.cwd)
        .envs(&launch.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    command.spawn().map_err(|e| {
        ToolError::Process(format!(
            "failed to start '{}': {}",
            launch.program.display(),
            e
        ))
    })
}

async fn communicate(child: &mut Child, envelope: Vec<u8>) -> io::Result<ProcessOutput> {
    let pid = child.id();
    let stdin = child.stdin.take();
    let write = async move {
        if let Some(mut stdin) = stdin {
            match stdin.write_all(&envelope).await {
                // The plugin may exit without reading its request
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                other => other?,
            }
            // Dropping stdin delivers EOF
        }
        Ok::<_, io::Error>(())
    };

    let (written, stdout, stderr) = tokio::join!(
        write,
        read_to_end(child.stdout.take()),
        read_to_end(child.stderr.take())
    );
    written?;
    let (stdout, stderr) = (stdout?, stderr?);

    // Background children left in the group must not outlive the call
    leader_exit(child).await?;
    if let Some(pid) = pid {
        signal_group(pid, GroupSignal::Kill);
    }
    let status = child.wait().await?;

    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
    })
}

/// Wait for the group leader to exit without reaping it.
///
/// An unreaped leader keeps its pid, so the group id cannot be handed to a
/// new process group before the sweep.
#[cfg(target_os = "linux")]
async fn leader_exit(child: &mut Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = Pid::from_raw(pid as i32);
    tokio::task::spawn_blocking(move || loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

// No non-reaping wait here; the sweep follows the reap
#[cfg(not(target_os = "linux"))]
async fn leader_exit(child: &mut Child) -> io::Result<()> {
    child.wait().await.map(|_| ())
}

async fn read_to_end<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!("Failed to send {} to process group {}: {}", signal, pid, e),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) {}

#[async_trait]
impl ToolAdapter for StdioAdapter {
    async fn invoke(
        &self,
        instance: &PluginInstance,
        request: &ToolCallRequest,
        timeout: Duration,
    ) -> ToolExecutionResult {
        let start = Instant::now();
        let outcome = self.call(instance, request, timeout).await;
        ToolExecutionResult::from_outcome(&request.tool_name, outcome, start.elapsed())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugins::manifest::PluginManifest;
    use crate::plugins::protocol::{Arguments, ToolStatus};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn instance(dir: &Path, script: &str, env: &[(&str, &str)]) -> PluginInstance {
        let script_path = dir.join("main.sh");
        fs::write(&script_path, script).unwrap();
        let manifest = PluginManifest::parse(
            r#"{ "name": "Shell", "communication": { "protocol": "stdio" }, "entryPoint": { "command": "sh main.sh" } }"#,
        )
        .unwrap();
        let launch = StdioLaunch {
            program: PathBuf::from("sh"),
            args: vec![script_path.display().to_string()],
            cwd: dir.to_path_buf(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        };
        PluginInstance::ready(manifest, dir.to_path_buf(), PluginHandle::Stdio(launch))
    }

    fn request(tool: &str, args: &[(&str, &str)]) -> ToolCallRequest {
        ToolCallRequest::new(tool, args.iter().copied().collect::<Arguments>())
    }

    fn adapter() -> StdioAdapter {
        StdioAdapter::new(Duration::from_millis(100), 64)
    }

    #[tokio::test]
    async fn test_echo_envelope() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = instance(
            temp_dir.path(),
            "input=$(cat)\nprintf '{\"status\":\"success\",\"result\":%s}' \"$input\"\n",
            &[],
        );

        let result = adapter()
            .invoke(&plugin, &request("Echo", &[("text", "hello")]), Duration::from_secs(5))
            .await;

        assert_eq!(result.status, ToolStatus::Success, "{:?}", result.error_message);
        let payload = result.payload.unwrap();
        assert_eq!(payload["tool"], "Echo");
        assert_eq!(payload["arguments"]["text"], "hello");
    }

    #[tokio::test]
    async fn test_plugin_env_and_cwd() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("marker.txt"), "here").unwrap();
        let plugin = instance(
            temp_dir.path(),
            "cat > /dev/null\nprintf '{\"status\":\"success\",\"result\":\"%s:%s\"}' \"$MEMO_DB\" \"$(cat marker.txt)\"\n",
            &[("MEMO_DB", "/tmp/memo.db")],
        );

        let result = adapter()
            .invoke(&plugin, &request("Shell", &[]), Duration::from_secs(5))
            .await;
        assert_eq!(result.payload, Some(Value::from("/tmp/memo.db:here")));
    }

    #[tokio::test]
    async fn test_error_response() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = instance(
            temp_dir.path(),
            "cat > /dev/null\necho '{\"status\":\"error\",\"error\":\"no such memo\"}'\n",
            &[],
        );

        let result = adapter()
            .invoke(&plugin, &request("Shell", &[]), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, ToolStatus::Failure);
        assert_eq!(result.error_message.as_deref(), Some("no such memo"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = instance(
            temp_dir.path(),
            "echo 'database locked' >&2\nexit 3\n",
            &[],
        );

        let result = adapter()
            .invoke(&plugin, &request("Shell", &[]), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, ToolStatus::Failure);
        let message = result.error_message.unwrap();
        assert!(message.contains("status 3"), "{}", message);
        assert!(message.contains("database locked"), "{}", message);
    }

    #[tokio::test]
    async fn test_stderr_excerpt_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = instance(
            temp_dir.path(),
            "i=0\nwhile [ $i -lt 50 ]; do printf 'xxxxxxxxxx' >&2; i=$((i+1)); done\nexit 1\n",
            &[],
        );

        let result = adapter()
            .invoke(&plugin, &request("Shell", &[]), Duration::from_secs(5))
            .await;
        let message = result.error_message.unwrap();
        assert!(message.ends_with("..."));
        assert!(message.len() < 200, "{}", message.len());
    }

    #[tokio::test]
    async fn test_invalid_output() {
        let temp_dir = TempDir::new().unwrap();
        let cases = [
            "echo 'not json'\n",
            "echo '{\"status\":\"success\"}'\n",
            "echo '{\"status\":\"maybe\",\"result\":1}'\n",
            "true\n",
        ];
        for script in cases {
            let plugin = instance(temp_dir.path(), script, &[]);
            let result = adapter()
                .invoke(&plugin, &request("Shell", &[]), Duration::from_secs(5))
                .await;
            assert_eq!(result.status, ToolStatus::Failure, "script: {}", script);
            assert!(result.error_message.is_some());
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let temp_dir = TempDir::new().unwrap();
        let mut plugin = instance(temp_dir.path(), "", &[]);
        if let PluginHandle::Stdio(launch) = &mut plugin.handle {
            launch.program = temp_dir.path().join("missing-binary");
        }

        let result = adapter()
            .invoke(&plugin, &request("Shell", &[]), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, ToolStatus::Failure);
        assert!(result.error_message.unwrap().starts_with("failed to start"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("pid");
        let plugin = instance(
            temp_dir.path(),
            "echo $$ > pid\nsleep 5\necho '{\"status\":\"success\",\"result\":1}'\n",
            &[],
        );

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let result = adapter()
            .invoke(&plugin, &request("Slow", &[]), timeout)
            .await;
        let elapsed = start.elapsed();

        assert_eq!(result.status, ToolStatus::Timeout);
        assert_eq!(result.error_message.as_deref(), Some("timed out after 100ms"));
        assert!(elapsed < timeout + Duration::from_millis(300), "{:?}", elapsed);

        let pid: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(kill(Pid::from_raw(pid), None).is_err(), "process {} still alive", pid);
    }

    /// True once the process is gone or only a zombie awaiting its new parent
    fn process_gone(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), None).is_err() {
            return true;
        }
        fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| {
                stat.rsplit(')')
                    .next()
                    .map_or(false, |rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_background_child_swept_after_success() {
        let temp_dir = TempDir::new().unwrap();
        let pid_file = temp_dir.path().join("bgpid");
        let plugin = instance(
            temp_dir.path(),
            "sleep 30 >/dev/null 2>&1 &\necho $! > bgpid\necho '{\"status\":\"success\",\"result\":\"done\"}'\n",
            &[],
        );

        let result = adapter()
            .invoke(&plugin, &request("Spawner", &[]), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.payload, Some(Value::from("done")));

        let pid: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !process_gone(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(process_gone(pid), "background process {} outlived the call", pid);
    }

    #[tokio::test]
    async fn test_sigterm_ignored_is_killed() {
        let temp_dir = TempDir::new().unwrap();
        let plugin = instance(
            temp_dir.path(),
            "trap '' TERM\nwhile true; do sleep 1; done\n",
            &[],
        );

        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        let result = adapter()
            .invoke(&plugin, &request("Stubborn", &[]), timeout)
            .await;

        assert_eq!(result.status, ToolStatus::Timeout);
        // timeout + grace period + slack
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn test_excerpt_char_boundary() {
        let adapter = StdioAdapter::new(DEFAULT_GRACE_PERIOD, 5);
        assert_eq!(adapter.excerpt("  short  ".as_bytes()), "short");
        assert_eq!(adapter.excerpt("日本語テキスト".as_bytes()), "日...");
    }
}
