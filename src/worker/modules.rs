//! Payload modules and their isolated execution.
//!
//! A module is an executable in the modules directory. It receives the
//! step arguments as JSON on stdin and answers with one JSON object
//! `{result, output, serialized_output}` on stdout. Each run is a separate
//! OS process, killed on cancellation, timeout or drop.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rpc::{PayloadReply, ResultCode};
use crate::types::{Error, Result};

const OUTPUT_PREVIEW_CHARS: usize = 512;

/// Module name → executable path.
#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    dir: PathBuf,
}

impl ModuleRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `module`. Names must stay inside the modules directory.
    pub async fn resolve(&self, module: &str) -> Result<PathBuf> {
        if module.is_empty()
            || module.starts_with('/')
            || module.split(['/', '\\']).any(|part| part == ".." || part.is_empty())
        {
            return Err(Error::validation(format!("invalid module name '{}'", module)));
        }
        let path = self.dir.join(module);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(Error::validation(format!("module '{}' is not a file", module))),
            Err(_) => Err(Error::validation(format!("module '{}' does not exist", module))),
        }
    }
}

/// Runs modules as child processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    registry: ModuleRegistry,
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new(registry: ModuleRegistry, timeout: Option<Duration>) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Run `module` with `arguments`. Never fails: every problem is
    /// reported as an `error` reply, cancellation as `stopped`.
    pub async fn run(&self, module: &str, arguments: &Value, cancel: CancellationToken) -> PayloadReply {
        match self.spawn_and_wait(module, arguments, cancel).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(module, error = %e, "module run failed");
                PayloadReply::new(ResultCode::Error, e.to_string())
            }
        }
    }

    async fn spawn_and_wait(&self, module: &str, arguments: &Value, cancel: CancellationToken) -> Result<PayloadReply> {
        let path = self.registry.resolve(module).await?;
        let mut input = serde_json::to_vec(arguments)?;
        input.push(b'\n');

        let mut command = Command::new(&path);
        command.current_dir(&self.registry.dir);
        command.kill_on_drop(true);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own group, so grandchildren die with the module.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|e| Error::internal(format!("failed to spawn module '{}': {}", module, e)))?;
        let group = child.id();
        tracing::debug!(module, pid = ?group, "module started");

        let pipes = Pipes {
            stdout: tokio::spawn(read_all(child.stdout.take())),
            stderr: tokio::spawn(read_all(child.stderr.take())),
            stdin: child.stdin.take().map(|stdin| tokio::spawn(write_input(stdin, input))),
        };

        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                terminate(&mut child, group, pipes).await;
                tracing::info!(module, "module stopped");
                return Ok(PayloadReply::new(ResultCode::Stopped, "stopped"));
            }
            _ = deadline => {
                terminate(&mut child, group, pipes).await;
                return Err(Error::rpc_timeout(format!("module '{}' timed out", module)));
            }
        };
        // Leftover background processes would hold the pipes open.
        kill_group(group);
        if let Some(stdin) = &pipes.stdin {
            stdin.abort();
        }
        let status = status?;

        let stdout = pipes.stdout.await.map_err(|e| Error::internal(e.to_string()))?;
        let stderr = pipes.stderr.await.map_err(|e| Error::internal(e.to_string()))?;
        match PayloadReply::from_body(&serde_json::from_str::<Value>(stdout.trim()).unwrap_or(Value::Null)) {
            Ok(reply) => {
                tracing::debug!(module, %status, result = %reply.result, "module finished");
                Ok(reply)
            }
            Err(_) if !status.success() => Err(Error::internal(format!(
                "module '{}' exited with {}: {}",
                module,
                status,
                preview(&stderr)
            ))),
            Err(_) => Err(Error::validation(format!(
                "module '{}' returned malformed output: {}",
                module,
                preview(&stdout)
            ))),
        }
    }
}

/// I/O tasks attached to one module process.
#[derive(Debug)]
struct Pipes {
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
    stdin: Option<JoinHandle<()>>,
}

/// Kill the module and everything it started, then drop its pipes.
async fn terminate(child: &mut Child, group: Option<u32>, pipes: Pipes) {
    kill_group(group);
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "module kill failed");
    }
    pipes.stdout.abort();
    pipes.stderr.abort();
    if let Some(stdin) = pipes.stdin {
        stdin.abort();
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(group: Option<u32>) {
    let Some(pgid) = group.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: killpg takes plain integers and touches no memory.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        tracing::debug!(pgid, error = %err, "module process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

/// Feed the arguments to the module. A module may exit or close stdin
/// without reading them all.
async fn write_input(mut stdin: ChildStdin, input: Vec<u8>) {
    let mut written = stdin.write_all(&input).await;
    if written.is_ok() {
        written = stdin.shutdown().await;
    }
    match written {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            tracing::debug!("module closed stdin before reading its arguments")
        }
        Err(e) => tracing::warn!(error = %e, "module stdin write failed"),
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(source: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut source) = source {
        if let Err(e) = source.read_to_end(&mut buffer).await {
            tracing::debug!(error = %e, "module pipe read failed");
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn preview(text: &str) -> String {
    text.chars().take(OUTPUT_PREVIEW_CHARS).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    fn module(dir: &Path, name: &str, script: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn executor(dir: &Path, timeout: Option<Duration>) -> ProcessExecutor {
        ProcessExecutor::new(ModuleRegistry::new(dir), timeout)
    }

    #[tokio::test]
    async fn test_module_reply_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        module(
            dir.path(),
            "echo",
            r#"read input; printf '{"result":"ok","output":"got","serialized_output":%s}' "$input""#,
        );

        let reply = executor(dir.path(), None)
            .run("echo", &json!({"target": "10.0.0.1"}), CancellationToken::new())
            .await;
        assert_eq!(reply.result, ResultCode::Ok);
        assert_eq!(reply.output, "got");
        assert_eq!(reply.serialized_output, json!({"target": "10.0.0.1"}));
    }

    #[tokio::test]
    async fn test_crash_and_garbage_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        module(dir.path(), "crash", "echo boom >&2; exit 3");
        module(dir.path(), "garbage", "echo not-json");
        let executor = executor(dir.path(), None);

        let reply = executor.run("crash", &json!({}), CancellationToken::new()).await;
        assert_eq!(reply.result, ResultCode::Error);
        assert!(reply.output.contains("boom"));

        let reply = executor.run("garbage", &json!({}), CancellationToken::new()).await;
        assert_eq!(reply.result, ResultCode::Error);

        let reply = executor.run("missing", &json!({}), CancellationToken::new()).await;
        assert_eq!(reply.result, ResultCode::Error);
    }

    #[tokio::test]
    async fn test_cancel_stops_module() {
        let dir = tempfile::tempdir().unwrap();
        module(dir.path(), "sleepy", "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            executor(dir.path(), None).run("sleepy", &json!({}), cancel),
        )
        .await
        .unwrap();
        assert_eq!(reply.result, ResultCode::Stopped);
    }

    #[tokio::test]
    async fn test_timeout_is_error() {
        let dir = tempfile::tempdir().unwrap();
        module(dir.path(), "sleepy", "sleep 30");
        let reply = executor(dir.path(), Some(Duration::from_millis(100)))
            .run("sleepy", &json!({}), CancellationToken::new())
            .await;
        assert_eq!(reply.result, ResultCode::Error);
        assert!(reply.output.contains("timed out"));
    }

    fn bulky_arguments() -> Value {
        json!({"blob": "x".repeat(256 * 1024)})
    }

    #[tokio::test]
    async fn test_module_ignoring_large_arguments_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        module(dir.path(), "quick", r#"printf '{"result":"ok","output":"done"}'"#);

        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            executor(dir.path(), None).run("quick", &bulky_arguments(), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_eq!(reply.result, ResultCode::Ok);
        assert_eq!(reply.output, "done");
    }

    #[tokio::test]
    async fn test_cancel_wins_while_stdin_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        module(dir.path(), "sleepy", "sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let reply = tokio::time::timeout(
            Duration::from_secs(3),
            executor(dir.path(), Some(Duration::from_secs(10))).run("sleepy", &bulky_arguments(), cancel),
        )
        .await
        .unwrap();
        assert_eq!(reply.result, ResultCode::Stopped);
    }

    #[tokio::test]
    async fn test_timeout_wins_while_stdin_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        module(dir.path(), "sleepy", "sleep 30");

        let reply = tokio::time::timeout(
            Duration::from_secs(3),
            executor(dir.path(), Some(Duration::from_millis(500))).run(
                "sleepy",
                &bulky_arguments(),
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap();
        assert_eq!(reply.result, ResultCode::Error);
        assert!(reply.output.contains("timed out"));
    }

    /// Gone, or a zombie nobody has reaped yet.
    #[cfg(target_os = "linux")]
    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        module(
            dir.path(),
            "spawner",
            &format!("sleep 30 &\necho $! > {}\nwait", pid_file.display()),
        );
        let cancel = CancellationToken::new();
        let run = {
            let executor = executor(dir.path(), None);
            let cancel = cancel.clone();
            tokio::spawn(async move { executor.run("spawner", &json!({}), cancel).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let pid = loop {
            if let Ok(pid) = std::fs::read_to_string(&pid_file) {
                if !pid.trim().is_empty() {
                    break pid.trim().to_string();
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "module never started its child");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        cancel.cancel();
        let reply = tokio::time::timeout(Duration::from_secs(3), run).await.unwrap().unwrap();
        assert_eq!(reply.result, ResultCode::Stopped);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !process_gone(&pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(process_gone(&pid), "background child {} survived", pid);
    }

    #[tokio::test]
    async fn test_module_names_stay_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::new(dir.path());
        assert!(registry.resolve("../etc/passwd").await.is_err());
        assert!(registry.resolve("/bin/sh").await.is_err());
        assert!(registry.resolve("").await.is_err());
    }
}
