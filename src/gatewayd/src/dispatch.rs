// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Execution of script files by the external SQL client.
//!
//! The client is an opaque program invoked as
//!
//! ```text
//! <sql-client> -l <plugin-dir> -f <script>
//! ```
//!
//! Every argument is passed to the operating system as a discrete value, never
//! through a shell, so paths containing spaces or shell metacharacters need no
//! quoting. The client runs in its own process group: the stock Flink client
//! is a shell script that forks a JVM, and killing only the script would
//! orphan the JVM.
//!
//! A client is waited on until it exits, the statement timeout elapses, or the
//! gateway shuts down. The latter two share one termination path that kills
//! the whole process group and reaps the client before returning, so no
//! client outlives the request that started it. If the request itself is
//! abandoned (the HTTP client disconnected), dropping the in-flight future
//! kills the process group as well.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlgw_ore::process::render_command;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SqlClientConfig;
use crate::error::StatementError;
use crate::script::ScriptFile;

/// How long to wait for the output pipes to close once the client is gone.
///
/// The pipes stay open if the client left a descendant running outside of
/// its process group. Output produced after this grace period is dropped.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// The number of trailing stdout lines included in a success summary.
const SUMMARY_LINES: usize = 5;

/// The maximum length in bytes of a success summary.
const MAX_SUMMARY_LEN: usize = 1024;

/// Output captured from one of the client's output streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// The captured bytes, decoded as UTF-8 with invalid sequences replaced.
    pub text: String,
    /// Whether the stream produced more output than the capture limit.
    pub truncated: bool,
}

/// The outcome of a successful client run.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub script_id: Uuid,
    pub exit_code: i32,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub elapsed: Duration,
    /// The Flink job the statement submitted, if the client reported one.
    pub job_id: Option<String>,
}

impl ExecutionSummary {
    /// A short human-readable summary of the run, derived from the tail of
    /// the client's stdout.
    pub fn message(&self) -> String {
        summarize(&self.stdout.text)
    }
}

/// Runs scripts with the external SQL client.
#[derive(Debug, Clone)]
pub struct SqlClient {
    program: PathBuf,
    plugin_dir: PathBuf,
    timeout: Duration,
    max_output_size: usize,
}

impl SqlClient {
    pub fn new(config: &SqlClientConfig) -> SqlClient {
        SqlClient {
            program: config.program.clone(),
            plugin_dir: config.plugin_dir.clone(),
            timeout: config.statement_timeout,
            max_output_size: config.max_output_size,
        }
    }

    /// The client executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The arguments that make the client run `script`.
    pub fn args(&self, script: &Path) -> Vec<OsString> {
        vec![
            "-l".into(),
            self.plugin_dir.clone().into_os_string(),
            "-f".into(),
            script.as_os_str().to_owned(),
        ]
    }

    /// Builds the command that runs `script`.
    ///
    /// The command reads nothing from stdin and pipes both output streams.
    pub fn command(&self, script: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(script))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// Runs `script` to completion.
    ///
    /// Resolves once the client has exited, or once it has been killed and
    /// reaped because the statement timeout elapsed or `cancel` fired.
    pub async fn execute(
        &self,
        script: &ScriptFile,
        cancel: &CancellationToken,
    ) -> Result<ExecutionSummary, StatementError> {
        let script_id = script.id();
        let args = self.args(script.path());
        info!(
            %script_id,
            command = %render_command(&self.program, &args),
            "launching sql client"
        );

        let mut command = self.command(script.path());
        let started = Instant::now();
        let child = command.spawn().map_err(|source| StatementError::Launch {
            program: self.program.clone(),
            source,
        })?;
        let mut process = ClientProcess::new(child);
        let stdout = OutputCapture::spawn(process.child.stdout.take(), self.max_output_size);
        let stderr = OutputCapture::spawn(process.child.stderr.take(), self.max_output_size);

        enum Exit {
            Status(ExitStatus),
            WaitError(std::io::Error),
            Timeout,
            Cancelled,
        }

        let exit = tokio::select! {
            status = process.child.wait() => match status {
                Ok(status) => Exit::Status(status),
                Err(e) => Exit::WaitError(e),
            },
            _ = tokio::time::sleep(self.timeout) => Exit::Timeout,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        let status = match exit {
            Exit::Status(status) => {
                process.reaped = true;
                status
            }
            Exit::WaitError(source) => {
                process.terminate().await;
                return Err(StatementError::Launch {
                    program: self.program.clone(),
                    source,
                });
            }
            Exit::Timeout => {
                warn!(
                    %script_id,
                    timeout = %humantime::format_duration(self.timeout),
                    "sql client timed out; killing it"
                );
                process.terminate().await;
                return Err(StatementError::Timeout {
                    script_id,
                    timeout: self.timeout,
                    stdout: stdout.finish().await,
                    stderr: stderr.finish().await,
                });
            }
            Exit::Cancelled => {
                info!(%script_id, "gateway shutting down; killing sql client");
                process.terminate().await;
                return Err(StatementError::Cancelled {
                    script_id: Some(script_id),
                });
            }
        };

        let elapsed = started.elapsed();
        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;

        match status.code() {
            Some(0) => {
                info!(%script_id, ?elapsed, "sql client succeeded");
                let job_id = extract_job_id(&stdout.text);
                Ok(ExecutionSummary {
                    script_id,
                    exit_code: 0,
                    stdout,
                    stderr,
                    elapsed,
                    job_id,
                })
            }
            exit_code => {
                let signal = exit_signal(&status);
                warn!(%script_id, ?exit_code, ?signal, ?elapsed, "sql client failed");
                Err(StatementError::Execution {
                    script_id,
                    exit_code,
                    signal,
                    stdout,
                    stderr,
                    elapsed,
                })
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_: &ExitStatus) -> Option<i32> {
    None
}

/// A running client that is killed if it is dropped before being reaped.
struct ClientProcess {
    child: Child,
    reaped: bool,
}

impl ClientProcess {
    fn new(child: Child) -> ClientProcess {
        ClientProcess {
            child,
            reaped: false,
        }
    }

    /// Kills the client's process group and waits for the client to exit.
    async fn terminate(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            warn!("unable to kill sql client: {e}");
        }
        self.reaped = true;
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: `killpg` has no memory safety preconditions. The client
        // leads its own process group and has not been reaped yet, so the
        // group id cannot have been recycled.
        let ret = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if ret != 0 {
            warn!(
                pgid,
                "unable to kill sql client process group: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

impl Drop for ClientProcess {
    fn drop(&mut self) {
        if !self.reaped {
            warn!("sql client abandoned before it exited; killing it");
            self.kill_group();
            // `kill_on_drop` reaps the direct child in the background.
        }
    }
}

/// Drains one of the client's output streams into a bounded buffer.
///
/// The stream is always read to the end so that the client never blocks on
/// a full pipe; bytes beyond the limit are discarded. The buffer is shared
/// with the draining task so that output read so far survives even if the
/// task has to be abandoned.
struct OutputCapture {
    buffer: Arc<Mutex<CaptureBuffer>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct CaptureBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl OutputCapture {
    fn spawn<R>(reader: Option<R>, limit: usize) -> OutputCapture
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let task = reader.map(|mut reader| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
                            let room = limit.saturating_sub(buffer.bytes.len());
                            if n > room {
                                buffer.truncated = true;
                            }
                            buffer.bytes.extend_from_slice(&chunk[..n.min(room)]);
                        }
                        Err(e) => {
                            debug!("reading sql client output: {e}");
                            break;
                        }
                    }
                }
            })
        });
        OutputCapture { buffer, task }
    }

    /// Waits briefly for the stream to close and returns what was captured.
    async fn finish(mut self) -> CapturedOutput {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut task)
                .await
                .is_err()
            {
                debug!("sql client output still open; abandoning it");
                task.abort();
            }
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        CapturedOutput {
            text: String::from_utf8_lossy(&buffer.bytes).into_owned(),
            truncated: std::mem::take(&mut buffer.truncated),
        }
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Extracts the id of the job a statement submitted from the client's
/// stdout.
///
/// The Flink SQL client reports submitted jobs with a `Job ID: <id>` line.
pub fn extract_job_id(stdout: &str) -> Option<String> {
    const MARKER: &str = "Job ID:";
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once(MARKER)?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

/// Summarizes client output: the last few non-empty lines, bounded in
/// length.
pub fn summarize(stdout: &str) -> String {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return "statement executed".into();
    }
    let tail = &lines[lines.len().saturating_sub(SUMMARY_LINES)..];
    let mut summary = tail.join("\n");
    if summary.len() > MAX_SUMMARY_LEN {
        let mut start = summary.len() - MAX_SUMMARY_LEN;
        while !summary.is_char_boundary(start) {
            start += 1;
        }
        summary = format!("...{}", &summary[start..]);
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{extract_job_id, summarize, SqlClient};
    use crate::config::SqlClientConfig;
    use crate::error::StatementError;
    use crate::script::ScriptFile;
    use crate::session::SessionId;

    fn client(program: PathBuf, timeout: Duration, max_output_size: usize) -> SqlClient {
        SqlClient::new(&SqlClientConfig {
            program,
            plugin_dir: PathBuf::from("/opt/flink plugins"),
            statement_timeout: timeout,
            max_output_size,
        })
    }

    #[cfg(unix)]
    fn stub(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("sql-client.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn script(scratch: &Path, statement: &str) -> ScriptFile {
        let session: SessionId = "dispatch".parse().unwrap();
        ScriptFile::create(scratch, &session, statement).await.unwrap()
    }

    #[test]
    fn args_are_discrete_values() {
        let client = client("sql-client.sh".into(), Duration::from_secs(1), 1024);
        let args = client.args(Path::new("/tmp/with space/script_x.sql"));
        assert_eq!(
            args,
            vec![
                "-l",
                "/opt/flink plugins",
                "-f",
                "/tmp/with space/script_x.sql"
            ]
        );
    }

    #[test]
    fn job_id_extraction() {
        let stdout = "[INFO] Submitting SQL update statement to the cluster...\n\
                      [INFO] SQL update statement has been successfully submitted to the cluster:\n\
                      Job ID: 6d2f0b1a5e1c4c3b9f1f3a0e8d7c6b5a\n\n\
                      Shutting down the session...\ndone.\n";
        assert_eq!(
            extract_job_id(stdout).as_deref(),
            Some("6d2f0b1a5e1c4c3b9f1f3a0e8d7c6b5a")
        );
        assert_eq!(extract_job_id("[INFO] Execute statement succeed.\n"), None);
        assert_eq!(extract_job_id("Job ID:   \n"), None);
    }

    #[test]
    fn summaries() {
        assert_eq!(summarize(""), "statement executed");
        assert_eq!(summarize("\n  \n"), "statement executed");
        assert_eq!(summarize("a\n\nb  \n"), "a\nb");
        let many = (1..=8).map(|i| format!("line {i}\n")).collect::<String>();
        assert_eq!(summarize(&many), "line 4\nline 5\nline 6\nline 7\nline 8");

        let long = "é".repeat(2000);
        let summary = summarize(&long);
        assert!(summary.starts_with("..."));
        assert!(summary.len() <= super::MAX_SUMMARY_LEN + 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn success_captures_output() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let program = stub(
            dir.path(),
            r#"printf '%s|' "$@"; echo; cat "$4"; echo "Job ID: abc123"; echo warning >&2"#,
        );
        let client = client(program, Duration::from_secs(30), 1 << 20);
        let script = script(dir.path(), "SELECT 1;\n").await;

        let summary = client
            .execute(&script, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.exit_code, 0);
        assert_eq!(summary.script_id, script.id());
        assert_eq!(
            summary.stdout.text,
            format!(
                "-l|/opt/flink plugins|-f|{}|\nSELECT 1;\nJob ID: abc123\n",
                script.path().display()
            )
        );
        assert!(!summary.stdout.truncated);
        assert_eq!(summary.stderr.text, "warning\n");
        assert_eq!(summary.job_id.as_deref(), Some("abc123"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_execution_error() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let program = stub(dir.path(), "echo 'syntax error' >&2; exit 3");
        let client = client(program, Duration::from_secs(30), 1 << 20);
        let script = script(dir.path(), "SELEC 1;").await;

        match client.execute(&script, &CancellationToken::new()).await {
            Err(StatementError::Execution {
                exit_code,
                signal,
                stderr,
                script_id,
                ..
            }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(signal, None);
                assert_eq!(stderr.text, "syntax error\n");
                assert_eq!(script_id, script.id());
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn death_by_signal_is_an_execution_error() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let program = stub(dir.path(), "kill -TERM $$");
        let client = client(program, Duration::from_secs(30), 1 << 20);
        let script = script(dir.path(), "SELECT 1;").await;

        match client.execute(&script, &CancellationToken::new()).await {
            Err(StatementError::Execution {
                exit_code, signal, ..
            }) => {
                assert_eq!(exit_code, None);
                assert_eq!(signal, Some(libc::SIGTERM));
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("bin").join("sql-client.sh");
        let client = client(program.clone(), Duration::from_secs(30), 1 << 20);
        let script = script(dir.path(), "SELECT 1;").await;

        match client.execute(&script, &CancellationToken::new()).await {
            Err(StatementError::Launch { program: p, .. }) => assert_eq!(p, program),
            other => panic!("expected launch error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_client_and_keeps_partial_output() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let program = stub(
            dir.path(),
            &format!(
                "echo $$ > '{}'; echo started; exec sleep 30",
                pid_file.display()
            ),
        );
        let client = client(program, Duration::from_millis(500), 1 << 20);
        let script = script(dir.path(), "SELECT 1;").await;

        match client.execute(&script, &CancellationToken::new()).await {
            Err(StatementError::Timeout {
                timeout, stdout, ..
            }) => {
                assert_eq!(timeout, Duration::from_millis(500));
                assert_eq!(stdout.text, "started\n");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!process_exists(pid), "client {pid} still running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_client() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let program = stub(
            dir.path(),
            &format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
        );
        let client = client(program, Duration::from_secs(30), 1 << 20);
        let script = script(dir.path(), "SELECT 1;").await;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            let pid_file = pid_file.clone();
            tokio::spawn(async move {
                while !pid_file.exists() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                cancel.cancel();
            })
        };
        match client.execute(&script, &cancel).await {
            Err(StatementError::Cancelled { script_id }) => {
                assert_eq!(script_id, Some(script.id()))
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        canceller.await.unwrap();
        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!process_exists(pid), "client {pid} still running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_beyond_limit_is_truncated() {
        sqlgw_ore::test::init_logging();
        let dir = tempfile::tempdir().unwrap();
        // Far more than a pipe buffer, so the client would block if the
        // output were not drained.
        let program = stub(
            dir.path(),
            "i=0; while [ $i -lt 20000 ]; do echo 0123456789abcdef; i=$((i+1)); done",
        );
        let client = client(program, Duration::from_secs(30), 100);
        let script = script(dir.path(), "SELECT 1;").await;

        let summary = client
            .execute(&script, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.stdout.text.len(), 100);
        assert!(summary.stdout.truncated);
        assert!(!summary.stderr.truncated);
    }

    #[cfg(unix)]
    fn process_exists(pid: libc::pid_t) -> bool {
        // SAFETY: signal 0 only checks for the existence of the process.
        unsafe { libc::kill(pid, 0) == 0 }
    }
}
