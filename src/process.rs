//! Supervised execution of external commands.
//!
//! Each run spawns one process with an explicit argument list (never a
//! shell string), in its own process group, with stdin closed. Output is
//! captured concurrently with a per-stream byte bound. The process exit is
//! raced against the deadline; if the deadline wins the whole process group
//! is killed and reaped before the outcome is returned.
//!
//! Expected failures (missing tool, launch error, timeout, non-zero exit)
//! come back as a classified [`SubprocessOutcome`], not as errors.

use crate::sandbox::ResolvedPath;

use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// How long to wait for the output readers once the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Secret-bearing variables never passed to the child by default.
pub const DEFAULT_SCRUBBED_ENV: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GROQ_API_KEY",
    "GEMINI_API_KEY",
    "XAI_API_KEY",
    "GITHUB_TOKEN",
];

/// Classification of one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    NonZeroExit,
    TimedOut,
    ToolNotFound,
    LaunchFailed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::NonZeroExit => "non_zero_exit",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::ToolNotFound => "tool_not_found",
            OutcomeKind::LaunchFailed => "launch_failed",
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one supervised run. Produced once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct SubprocessOutcome {
    pub command: Vec<String>,
    pub kind: OutcomeKind,
    /// `None` when no process ran or it was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    /// Whether a process was actually started for this outcome.
    pub spawned: bool,
}

impl SubprocessOutcome {
    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    /// A success outcome for a step that didn't need a process.
    pub fn skipped(command: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            command,
            kind: OutcomeKind::Success,
            exit_code: None,
            stdout: message.into(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed: Duration::ZERO,
            spawned: false,
        }
    }

    fn not_started(command: Vec<String>, kind: OutcomeKind, message: String, elapsed: Duration) -> Self {
        Self {
            command,
            kind,
            exit_code: None,
            stdout: String::new(),
            stderr: message,
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed,
            spawned: false,
        }
    }

    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

pub(crate) fn serialize_secs<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((duration.as_secs_f64() * 1000.0).round() / 1000.0)
}

/// Bytes captured from one stream.
#[derive(Debug, Default)]
struct CapturedOutput {
    text: String,
    truncated: bool,
}

/// Runs external commands under a deadline.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    max_output_bytes: usize,
    scrubbed_env: Vec<String>,
}

impl SubprocessRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            max_output_bytes,
            scrubbed_env: DEFAULT_SCRUBBED_ENV.iter().map(|var| var.to_string()).collect(),
        }
    }

    /// Replace the list of environment variables removed from the child.
    pub fn with_scrubbed_env(mut self, vars: Vec<String>) -> Self {
        self.scrubbed_env = vars;
        self
    }

    /// Run `command` in `working_dir`, killing it if `deadline` elapses.
    ///
    /// Only an empty command is an error; every other failure is reported in
    /// the returned outcome.
    pub async fn run(
        &self,
        command: &[String],
        working_dir: &ResolvedPath,
        deadline: Duration,
    ) -> crate::Result<SubprocessOutcome> {
        let Some((program, args)) = command.split_first() else {
            return Err(crate::Error::EmptyCommand);
        };
        let command_line = command.join(" ");
        let started = Instant::now();

        let executable = match resolve_executable(program, working_dir.as_path()) {
            Ok(path) => path,
            Err(error) => {
                tracing::error!(
                    program = %program,
                    cwd = %working_dir.as_path().display(),
                    %error,
                    "executable not found"
                );
                return Ok(SubprocessOutcome::not_started(
                    command.to_vec(),
                    OutcomeKind::ToolNotFound,
                    format!("'{program}' not found: {error}"),
                    started.elapsed(),
                ));
            }
        };

        let mut child_command = Command::new(&executable);
        child_command
            .args(args)
            .current_dir(working_dir.as_path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        child_command.process_group(0);

        for var in &self.scrubbed_env {
            child_command.env_remove(var);
        }

        let mut child = match child_command.spawn() {
            Ok(child) => child,
            Err(error) => {
                let kind = if error.kind() == std::io::ErrorKind::NotFound {
                    OutcomeKind::ToolNotFound
                } else {
                    OutcomeKind::LaunchFailed
                };
                tracing::error!(command = %command_line, %error, "failed to launch process");
                return Ok(SubprocessOutcome::not_started(
                    command.to_vec(),
                    kind,
                    format!("failed to launch '{program}': {error}"),
                    started.elapsed(),
                ));
            }
        };

        tracing::info!(
            command = %command_line,
            cwd = %working_dir.as_path().display(),
            pid = child.id(),
            timeout_secs = deadline.as_secs_f64(),
            "process started"
        );

        let limit = self.max_output_bytes;
        let stdout = child
            .stdout
            .take()
            .map(|stream| StreamCapture::spawn(stream, limit));
        let stderr = child
            .stderr
            .take()
            .map(|stream| StreamCapture::spawn(stream, limit));
        // Read before waiting: a reaped child no longer reports its pid.
        let group = child.id();

        let exit = tokio::select! {
            result = child.wait() => Some(result),
            _ = tokio::time::sleep(deadline) => None,
        };

        let (kind, exit_code) = match exit {
            Some(Ok(status)) if status.success() => (OutcomeKind::Success, status.code()),
            Some(Ok(status)) => (OutcomeKind::NonZeroExit, status.code()),
            Some(Err(error)) => {
                tracing::error!(command = %command_line, %error, "failed to wait for process");
                terminate_process_tree(&mut child, group).await;
                (OutcomeKind::LaunchFailed, None)
            }
            None => {
                terminate_process_tree(&mut child, group).await;
                (OutcomeKind::TimedOut, None)
            }
        };
        // Descendants left in the group would otherwise outlive the run and
        // hold the output pipes open.
        kill_process_group(group);

        let (stdout, mut stderr) = tokio::join!(finish_capture(stdout), finish_capture(stderr));
        let elapsed = started.elapsed();

        if kind == OutcomeKind::TimedOut && stderr.text.is_empty() {
            stderr.text = format!("timed out after {}s", deadline.as_secs_f64());
        }

        match kind {
            OutcomeKind::Success => tracing::info!(
                command = %command_line,
                elapsed_secs = elapsed.as_secs_f64(),
                "process completed"
            ),
            OutcomeKind::TimedOut => tracing::warn!(
                command = %command_line,
                timeout_secs = deadline.as_secs_f64(),
                "process timed out, process group killed"
            ),
            _ => tracing::warn!(
                command = %command_line,
                exit_code = ?exit_code,
                stderr = %stderr.text.trim(),
                "process failed"
            ),
        }

        Ok(SubprocessOutcome {
            command: command.to_vec(),
            kind,
            exit_code,
            stdout: stdout.text,
            stderr: stderr.text,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            elapsed,
            spawned: true,
        })
    }
}

/// Locate `program` on `PATH`, or relative to `cwd` when it contains a separator.
fn resolve_executable(program: &str, cwd: &Path) -> Result<std::path::PathBuf, which::Error> {
    which::which_in(program, std::env::var_os("PATH"), cwd)
}

/// Kill the child's process group, then the child itself, and reap it.
async fn terminate_process_tree(child: &mut Child, group: Option<u32>) {
    kill_process_group(group);
    if let Err(error) = child.kill().await {
        tracing::debug!(%error, "kill after killpg failed");
    }
}

/// SIGKILL every process left in the group led by `group`. A group that is
/// already empty is not an error.
fn kill_process_group(group: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = group {
        // SAFETY: killpg only sends a signal. The child was spawned with
        // process_group(0), so its pid is the group id and the group holds
        // only the child and its descendants.
        let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if result != 0 {
            let error = std::io::Error::last_os_error();
            if error.raw_os_error() != Some(libc::ESRCH) {
                tracing::debug!(pid, %error, "killpg failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = group;
}

#[derive(Debug, Default)]
struct CaptureBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

/// One output stream drained by a background task into a shared buffer.
/// The buffer outlives the task, so bytes read before an abort are kept.
struct StreamCapture {
    buffer: Arc<Mutex<CaptureBuffer>>,
    reader: tokio::task::JoinHandle<()>,
    limit: usize,
}

impl StreamCapture {
    fn spawn<R>(stream: R, limit: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let reader = tokio::spawn(capture_stream(stream, buffer.clone(), limit));
        Self {
            buffer,
            reader,
            limit,
        }
    }

    /// Wait up to [`DRAIN_GRACE`] for EOF, then take whatever was read.
    async fn finish(self) -> CapturedOutput {
        let abort = self.reader.abort_handle();
        match tokio::time::timeout(DRAIN_GRACE, self.reader).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(%error, "output reader task failed"),
            Err(_) => {
                // A descendant that left the process group may still hold the pipe.
                abort.abort();
                tracing::warn!("output reader did not finish after process exit");
            }
        }

        let buffer = self.buffer.lock();
        let mut text = String::from_utf8_lossy(&buffer.bytes).into_owned();
        if buffer.truncated {
            text.push_str(&format!("\n[output truncated at {} bytes]", self.limit));
        }
        CapturedOutput {
            text,
            truncated: buffer.truncated,
        }
    }
}

async fn finish_capture(capture: Option<StreamCapture>) -> CapturedOutput {
    match capture {
        Some(capture) => capture.finish().await,
        None => CapturedOutput::default(),
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes. Reading continues past
/// the limit so the child never blocks on a full pipe.
async fn capture_stream<R>(mut stream: R, buffer: Arc<Mutex<CaptureBuffer>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                let mut buffer = buffer.lock();
                let room = limit.saturating_sub(buffer.bytes.len());
                if read > room {
                    buffer.truncated = true;
                }
                buffer.bytes.extend_from_slice(&chunk[..read.min(room)]);
            }
            Err(error) => {
                tracing::debug!(%error, "error reading process output");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sandbox::WorkspaceRoot;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn workspace() -> (tempfile::TempDir, ResolvedPath) {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolved = WorkspaceRoot::new(temp.path()).expect("root").to_resolved();
        (temp, resolved)
    }

    #[tokio::test]
    async fn zero_exit_is_success_and_runs_in_working_dir() {
        let (temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);

        let outcome = runner
            .run(&sh("pwd; echo oops >&2"), &cwd, Duration::from_secs(10))
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.spawned);
        assert_eq!(
            outcome.stdout.trim(),
            temp.path().canonicalize().unwrap().to_str().unwrap()
        );
        assert_eq!(outcome.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_output() {
        let (_temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);

        let outcome = runner
            .run(&sh("echo partial; echo broken >&2; exit 3"), &cwd, Duration::from_secs(10))
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::NonZeroExit);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.trim(), "partial");
        assert_eq!(outcome.stderr.trim(), "broken");
    }

    #[tokio::test]
    async fn missing_tool_is_reported_without_spawning() {
        let (_temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);
        let command = vec!["definitely-not-a-real-indexing-tool".to_string(), "init".into()];

        let outcome = runner
            .run(&command, &cwd, Duration::from_secs(10))
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::ToolNotFound);
        assert!(!outcome.spawned);
        assert!(outcome.exit_code.is_none());
    }

    #[tokio::test]
    async fn non_executable_file_is_not_a_tool() {
        let (temp, cwd) = workspace();
        std::fs::write(temp.path().join("tool"), "#!/bin/sh\n").unwrap();
        let runner = SubprocessRunner::new(1024);

        let outcome = runner
            .run(&["./tool".to_string()], &cwd, Duration::from_secs(10))
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::ToolNotFound);
        assert!(!outcome.spawned);
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let (_temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);
        let result = runner.run(&[], &cwd, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(crate::Error::EmptyCommand)));
    }

    #[tokio::test]
    async fn output_is_bounded_with_marker() {
        let (_temp, cwd) = workspace();
        let runner = SubprocessRunner::new(16);

        let outcome = runner
            .run(
                &sh("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"),
                &cwd,
                Duration::from_secs(10),
            )
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert!(outcome.stdout_truncated);
        assert!(outcome.stdout.starts_with("0123456789\n01234"));
        assert!(outcome.stdout.ends_with("[output truncated at 16 bytes]"));
        assert!(!outcome.stderr_truncated);
    }

    #[tokio::test]
    async fn scrubbed_variables_are_not_inherited() {
        let (_temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024).with_scrubbed_env(vec!["HOME".into()]);

        let outcome = runner
            .run(&sh("echo \"home=${HOME:-unset}\""), &cwd, Duration::from_secs(10))
            .await
            .expect("run");

        assert_eq!(outcome.stdout.trim(), "home=unset");
    }

    #[tokio::test]
    async fn deadline_kills_process_and_keeps_partial_output() {
        let (_temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);

        let started = Instant::now();
        let outcome = runner
            .run(&sh("echo started; sleep 30"), &cwd, Duration::from_millis(500))
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::TimedOut);
        assert!(outcome.exit_code.is_none());
        assert_eq!(outcome.stdout.trim(), "started");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn deadline_terminates_descendants() {
        let (temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);

        let outcome = runner
            .run(
                &sh("sleep 30 & echo $! > child.pid; echo $$ > parent.pid; wait"),
                &cwd,
                Duration::from_millis(800),
            )
            .await
            .expect("run");
        assert_eq!(outcome.kind, OutcomeKind::TimedOut);

        for file in ["child.pid", "parent.pid"] {
            let pid: u32 = std::fs::read_to_string(temp.path().join(file))
                .expect("pid file")
                .trim()
                .parse()
                .expect("pid");
            assert!(wait_until_gone(pid).await, "process {pid} from {file} survived");
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn background_descendants_die_with_a_successful_run() {
        let (temp, cwd) = workspace();
        let runner = SubprocessRunner::new(1024);

        let started = Instant::now();
        let outcome = runner
            .run(
                &sh("echo important-output; sleep 20 & echo $! > bg.pid"),
                &cwd,
                Duration::from_secs(10),
            )
            .await
            .expect("run");

        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert_eq!(outcome.stdout.trim(), "important-output");
        assert!(started.elapsed() < DRAIN_GRACE);

        let pid: u32 = std::fs::read_to_string(temp.path().join("bg.pid"))
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert!(wait_until_gone(pid).await, "background process {pid} survived");
    }

    #[tokio::test]
    async fn stalled_reader_keeps_bytes_read_so_far() {
        use tokio::io::AsyncWriteExt;

        let (reader, mut writer) = tokio::io::duplex(64);
        writer.write_all(b"partial line").await.unwrap();
        let capture = StreamCapture::spawn(reader, 1024);

        // `writer` stays open, so the reader never sees EOF and is aborted.
        let output = capture.finish().await;
        assert_eq!(output.text, "partial line");
        assert!(!output.truncated);
        drop(writer);
    }

    /// Treats zombies as gone: they no longer run, only await reaping.
    #[cfg(target_os = "linux")]
    async fn wait_until_gone(pid: u32) -> bool {
        for _ in 0..50 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => return true,
                Ok(stat) => {
                    let state = stat
                        .rsplit_once(')')
                        .and_then(|(_, rest)| rest.split_whitespace().next());
                    if matches!(state, Some("Z") | Some("X")) {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
}
