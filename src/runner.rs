//! Privileged Command Runner
//!
//! Runs one long-lived build command through the shell on a background task,
//! streaming combined stdout/stderr into an append-only [`OutputLog`].
//!
//! ARCHITECTURE: the child is spawned synchronously (so the borrowed session
//! environment never outlives the call), then a tokio task owns it. Log
//! growth is announced over a `watch` channel; subscribers only ever see the
//! latest length, so notifications are naturally batched.

use crate::credentials::Escalation;
use serde::Serialize;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Terminal classification of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutionStatus {
    /// Exit code 0
    Success,
    /// Non-zero exit code
    Failed(i32),
    /// Spawn/stream failure or death by signal
    Crashed(String),
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    /// Human-readable failure detail, `None` on success
    pub fn detail(&self) -> Option<String> {
        match self {
            ExecutionStatus::Success => None,
            ExecutionStatus::Failed(code) => Some(format!("Process exited with code {}", code)),
            ExecutionStatus::Crashed(message) => Some(message.clone()),
        }
    }
}

/// Ordered, ever-growing text log shared between the runner and readers
#[derive(Debug, Clone)]
pub struct OutputLog {
    text: Arc<Mutex<String>>,
    len_tx: Arc<watch::Sender<usize>>,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLog {
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            text: Arc::new(Mutex::new(String::new())),
            len_tx: Arc::new(len_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.text.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a chunk and notify subscribers
    pub fn append(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let len = {
            let mut text = self.lock();
            text.push_str(chunk);
            text.len()
        };
        self.len_tx.send_replace(len);
    }

    /// Full content so far
    pub fn snapshot(&self) -> String {
        self.lock().clone()
    }

    /// Content after byte `offset` (empty if `offset` is past the end or not a char boundary)
    pub fn since(&self, offset: usize) -> String {
        self.lock().get(offset..).unwrap_or_default().to_string()
    }

    /// Current length in bytes
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive the log length each time it grows (latest value only)
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.len_tx.subscribe()
    }
}

/// Handle to a running command; the status is delivered exactly once
#[derive(Debug)]
pub struct ExecutionHandle {
    log: OutputLog,
    task: JoinHandle<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn log(&self) -> &OutputLog {
        &self.log
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal status
    pub async fn wait(self) -> ExecutionStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => crashed(&self.log, format!("Runner task failed: {}", e)),
        }
    }
}

/// Spawns build commands under the shell
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: PathBuf,
}

impl CommandRunner {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Start `command` with the session secret in its environment.
    ///
    /// Returns immediately; must be called from within a tokio runtime.
    /// There is no retry: a failed execution is final for this handle.
    pub fn execute(&self, command: &str, escalation: &Escalation<'_>) -> ExecutionHandle {
        let log = OutputLog::new();

        let mut cmd = Command::new(&self.shell);
        // route stderr into the stdout pipe so both keep their relative order
        cmd.arg("-c")
            .arg(format!("exec 2>&1\n{}", command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        escalation.apply(&mut cmd);

        tracing::debug!("Spawning build command under {}", self.shell.display());
        let spawned = cmd.spawn();
        let shell = self.shell.display().to_string();
        let task_log = log.clone();
        let task = tokio::spawn(async move {
            match spawned {
                Ok(child) => drive(child, &task_log).await,
                Err(e) => crashed(&task_log, format!("Failed to start {}: {}", shell, e)),
            }
        });

        ExecutionHandle { log, task }
    }
}

async fn drive(mut child: Child, log: &OutputLog) -> ExecutionStatus {
    // stderr only carries what the shell prints before `exec 2>&1` runs
    let stderr_pump = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(pump(stderr, log.clone())));

    let streamed = match child.stdout.take() {
        Some(stdout) => pump(stdout, log.clone()).await,
        None => Ok(()),
    };

    if let Some(handle) = stderr_pump {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to read build stderr: {}", e),
            Err(e) => tracing::warn!("stderr reader stopped: {}", e),
        }
    }

    settle(child, streamed, log).await
}

/// Reap the child once its output is drained (or could not be read)
async fn settle(mut child: Child, streamed: io::Result<()>, log: &OutputLog) -> ExecutionStatus {
    if let Err(e) = streamed {
        if let Err(kill) = child.start_kill() {
            tracing::debug!("Could not kill build process: {}", kill);
        }
        if let Err(reap) = child.wait().await {
            tracing::debug!("Could not reap build process: {}", reap);
        }
        return crashed(log, format!("Failed to read build output: {}", e));
    }

    match child.wait().await {
        Ok(status) => classify(status, log),
        Err(e) => crashed(log, format!("Failed to wait for build process: {}", e)),
    }
}

/// Copy lines from `reader` into the log until EOF
async fn pump<R>(reader: R, log: OutputLog) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        log.append(&String::from_utf8_lossy(&line));
    }
}

fn classify(status: ExitStatus, log: &OutputLog) -> ExecutionStatus {
    match status.code() {
        Some(0) => ExecutionStatus::Success,
        Some(code) => {
            tracing::info!("Build process exited with code {}", code);
            ExecutionStatus::Failed(code)
        }
        None => {
            let message = match status.signal() {
                Some(signal) => format!("Process terminated by signal {}", signal),
                None => format!("Process ended abnormally: {}", status),
            };
            crashed(log, message)
        }
    }
}

/// Record a crash in the visible log and build the status
fn crashed(log: &OutputLog, message: String) -> ExecutionStatus {
    tracing::warn!("Build process crashed: {}", message);
    log.append(&format!("\nError: {}", message));
    ExecutionStatus::Crashed(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialBroker;
    use crate::testing;
    use serial_test::serial;

    async fn session(dir: &tempfile::TempDir) -> CredentialBroker {
        let mut broker = CredentialBroker::new(testing::escalation_config(dir.path()));
        broker.begin_session(testing::password()).await.unwrap();
        broker
    }

    async fn run(command: &str) -> (ExecutionStatus, String) {
        let dir = tempfile::tempdir().unwrap();
        let broker = session(&dir).await;
        let escalation = broker.escalation_capability().unwrap();

        let handle = CommandRunner::new("/bin/sh").execute(command, &escalation);
        let log = handle.log().clone();
        let status = handle.wait().await;
        (status, log.snapshot())
    }

    #[test]
    fn test_log_append_and_since() {
        let log = OutputLog::new();
        let rx = log.subscribe();
        assert!(log.is_empty());

        log.append("hello\n");
        log.append("");
        log.append("wörld\n");

        assert_eq!(log.snapshot(), "hello\nwörld\n");
        assert_eq!(log.since(6), "wörld\n");
        assert_eq!(log.since(log.len()), "");
        // not a char boundary
        assert_eq!(log.since(8), "");
        assert_eq!(*rx.borrow(), log.len());
    }

    #[test]
    fn test_status_detail() {
        assert_eq!(ExecutionStatus::Success.detail(), None);
        assert_eq!(
            ExecutionStatus::Failed(1).detail().as_deref(),
            Some("Process exited with code 1")
        );
        assert!(ExecutionStatus::Success.is_success());
    }

    #[tokio::test]
    #[serial]
    async fn test_nonzero_exit_is_failed_with_full_log() {
        let (status, log) = run("echo building; echo oops >&2; exit 1").await;
        assert_eq!(status, ExecutionStatus::Failed(1));
        assert_eq!(log, "building\noops\n");
    }

    #[tokio::test]
    #[serial]
    async fn test_success() {
        let (status, log) = run("printf 'a\\nb'").await;
        assert_eq!(status, ExecutionStatus::Success);
        assert_eq!(log, "a\nb");
    }

    #[tokio::test]
    #[serial]
    async fn test_secret_reaches_child_but_not_log() {
        let (status, log) = run(&format!(
            "test \"${}\" = {} && echo authenticated",
            testing::SECRET_ENV,
            testing::PASSWORD
        ))
        .await;
        assert_eq!(status, ExecutionStatus::Success);
        assert_eq!(log, "authenticated\n");
    }

    #[tokio::test]
    #[serial]
    async fn test_wrapper_escalates_inside_command() {
        let dir = tempfile::tempdir().unwrap();
        let broker = session(&dir).await;
        let escalation = broker.escalation_capability().unwrap();
        let wrapper = shell_escape::escape(escalation.wrapper_path().to_string_lossy());

        let handle = CommandRunner::new("/bin/sh")
            .execute(&format!("{} sh -c 'echo as-root; exit 3'", wrapper), &escalation);
        let log = handle.log().clone();

        assert_eq!(handle.wait().await, ExecutionStatus::Failed(3));
        assert_eq!(log.snapshot(), "as-root\n");
    }

    #[tokio::test]
    #[serial]
    async fn test_killed_process_is_crashed() {
        let (status, log) = run("echo before; kill -9 $$").await;
        match status {
            ExecutionStatus::Crashed(message) => assert!(message.contains("signal 9")),
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(log.starts_with("before\n"));
        assert!(log.contains("\nError: Process terminated by signal 9"));
    }

    #[tokio::test]
    #[serial]
    async fn test_spawn_failure_is_crashed() {
        let dir = tempfile::tempdir().unwrap();
        let broker = session(&dir).await;
        let escalation = broker.escalation_capability().unwrap();

        let handle = CommandRunner::new(dir.path().join("no-such-shell")).execute("true", &escalation);
        let log = handle.log().clone();

        assert!(matches!(handle.wait().await, ExecutionStatus::Crashed(_)));
        assert!(log.snapshot().starts_with("\nError: Failed to start"));
    }

    #[tokio::test]
    #[serial]
    async fn test_log_grows_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let broker = session(&dir).await;
        let escalation = broker.escalation_capability().unwrap();

        let handle = CommandRunner::new("/bin/sh").execute(
            "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done",
            &escalation,
        );
        let log = handle.log().clone();
        let mut rx = log.subscribe();

        let mut previous = String::new();
        loop {
            let current = log.snapshot();
            assert!(current.starts_with(&previous));
            previous = current;
            if previous.lines().count() == 200 {
                break;
            }
            rx.changed().await.unwrap();
        }

        assert_eq!(handle.wait().await, ExecutionStatus::Success);
        let full = log.snapshot();
        assert!(full.starts_with(&previous));
        assert_eq!(full.lines().count(), 200);
        assert_eq!(full.lines().last(), Some("line199"));
    }

    /// Yields an error on every read
    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    #[tokio::test]
    async fn test_pump_keeps_output_before_read_error() {
        use tokio::io::AsyncReadExt;

        let log = OutputLog::new();
        let reader = (&b"partial line\n"[..]).chain(FailingReader);

        let err = pump(reader, log.clone()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(log.snapshot(), "partial line\n");
    }

    #[tokio::test]
    async fn test_read_error_is_crashed_and_kills_child() {
        let log = OutputLog::new();
        log.append("partial line\n");
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let started = std::time::Instant::now();
        let status = settle(
            child,
            Err(io::Error::new(io::ErrorKind::InvalidData, "stream closed")),
            &log,
        )
        .await;

        assert_eq!(
            status,
            ExecutionStatus::Crashed("Failed to read build output: stream closed".to_string())
        );
        assert_eq!(
            log.snapshot(),
            "partial line\n\nError: Failed to read build output: stream closed"
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    #[serial]
    async fn test_secret_never_reaches_log_through_repeated_wrapper_calls() {
        let dir = tempfile::tempdir().unwrap();
        let broker = session(&dir).await;
        let escalation = broker.escalation_capability().unwrap();
        let wrapper = shell_escape::escape(escalation.wrapper_path().to_string_lossy());

        let handle = CommandRunner::new("/bin/sh")
            .execute(&format!("{0} true && {0} cat && echo done", wrapper), &escalation);
        let log = handle.log().clone();

        assert_eq!(handle.wait().await, ExecutionStatus::Success);
        assert_eq!(log.snapshot(), "done\n");
    }
}
