use drover_core::{DroverError, DroverResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Split};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on retained stderr; older output is discarded first.
pub const STDERR_LIMIT: usize = 64 * 1024;

/// Time a child gets to exit after SIGTERM before it is killed outright.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How to launch a JSON-lines emitting child.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments, passed without a shell.
    pub args: Vec<String>,
    /// Working directory; inherited when unset.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
    /// Overall wall-clock limit.
    pub timeout: Option<Duration>,
}

impl SpawnSpec {
    /// Spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `cwd`.
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Text written to the child's stdin, which is then closed.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Overall deadline for the run.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why the event sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Still producing output.
    Running,
    /// The child exited on its own.
    Exited { code: Option<i32> },
    /// The cancellation token fired.
    Cancelled,
    /// The wall-clock limit elapsed.
    TimedOut,
}

enum Step {
    Cancelled,
    TimedOut,
    Line(std::io::Result<Option<Vec<u8>>>),
}

/// A spawned child whose stdout is read as newline-delimited JSON.
///
/// Blank and non-JSON lines are skipped. Stderr is collected in the background
/// so a failure can carry it. Cancellation and timeout terminate the whole
/// process group. Dropping the value kills the child.
pub struct JsonlProcess {
    program: String,
    child: Option<Child>,
    pid: Option<u32>,
    /// Raw segments; CLIs are not guaranteed to emit valid UTF-8.
    lines: Split<BufReader<ChildStdout>>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    is_terminal: fn(&Value) -> bool,
    saw_terminal: bool,
    end: EndReason,
}

impl JsonlProcess {
    /// Launch the child. `is_terminal` recognizes the event that concludes a
    /// run; once seen, a non-zero exit is no longer treated as a failure.
    pub fn spawn(
        spec: SpawnSpec,
        cancel: CancellationToken,
        is_terminal: fn(&Value) -> bool,
    ) -> DroverResult<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %spec.program, args = ?spec.args, "spawning child process");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DroverError::NotInstalled {
                    provider: spec.program.clone(),
                }
            } else {
                DroverError::Process {
                    program: spec.program.clone(),
                    exit_code: None,
                    stderr: format!("failed to spawn: {e}"),
                }
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DroverError::Provider("child stdout was not captured".into()))?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "failed to write child stdin");
                }
            });
        }

        let stderr = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|pipe| {
            let sink = stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).split(b'\n');
                loop {
                    match lines.next_segment().await {
                        Ok(Some(line)) => {
                            let line = String::from_utf8_lossy(&line);
                            append_bounded(&mut sink.lock(), line.trim_end_matches('\r'));
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "stderr read failed");
                            break;
                        }
                    }
                }
            })
        });

        Ok(Self {
            program: spec.program,
            pid: child.id(),
            child: Some(child),
            lines: BufReader::new(stdout).split(b'\n'),
            stderr,
            stderr_task,
            cancel,
            deadline: spec.timeout.map(|t| Instant::now() + t),
            is_terminal,
            saw_terminal: false,
            end: EndReason::Running,
        })
    }

    /// Next parsed event; `Ok(None)` once the sequence has ended.
    ///
    /// A child that exits non-zero without ever emitting a terminal event
    /// yields `Err(DroverError::Process)` carrying its stderr.
    pub async fn next_json(&mut self) -> DroverResult<Option<Value>> {
        loop {
            if self.end != EndReason::Running {
                return Ok(None);
            }

            let cancel = self.cancel.clone();
            let deadline = self.deadline;
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = sleep_until(deadline) => Step::TimedOut,
                line = self.lines.next_segment() => Step::Line(line),
            };

            match step {
                Step::Cancelled => {
                    debug!(program = %self.program, "child cancelled");
                    self.terminate(EndReason::Cancelled).await;
                    return Ok(None);
                }
                Step::TimedOut => {
                    warn!(program = %self.program, "child exceeded its time limit");
                    self.terminate(EndReason::TimedOut).await;
                    return Ok(None);
                }
                Step::Line(Ok(Some(bytes))) => {
                    let line = String::from_utf8_lossy(&bytes);
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => {
                            if (self.is_terminal)(&value) {
                                self.saw_terminal = true;
                            }
                            return Ok(Some(value));
                        }
                        Err(_) => {
                            debug!(program = %self.program, line = %truncate(trimmed, 200), "skipping non-JSON line");
                            continue;
                        }
                    }
                }
                Step::Line(Ok(None)) => return self.finish().await,
                Step::Line(Err(e)) => {
                    self.terminate(EndReason::Exited { code: None }).await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Why the sequence ended, or `Running`.
    pub fn end_reason(&self) -> EndReason {
        self.end
    }

    /// Whether a terminal event has been read.
    pub fn saw_terminal(&self) -> bool {
        self.saw_terminal
    }

    /// Stderr captured so far.
    pub fn stderr(&self) -> String {
        self.stderr.lock().clone()
    }

    /// Program the child was started from.
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn finish(&mut self) -> DroverResult<Option<Value>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = sleep_until(deadline) => None,
            status = child.wait() => Some(status),
        };
        let status = match status {
            Some(status) => status?,
            None => {
                self.child = Some(child);
                let reason = if self.cancel.is_cancelled() {
                    EndReason::Cancelled
                } else {
                    EndReason::TimedOut
                };
                self.terminate(reason).await;
                return Ok(None);
            }
        };

        self.drain_stderr().await;
        let code = status.code();
        self.end = EndReason::Exited { code };
        debug!(program = %self.program, code = ?code, "child exited");

        if !status.success() && !self.saw_terminal {
            return Err(DroverError::Process {
                program: self.program.clone(),
                exit_code: code,
                stderr: self.stderr(),
            });
        }
        Ok(None)
    }

    async fn terminate(&mut self, reason: EndReason) {
        self.end = reason;
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = self.pid {
                signal_group(pid, GroupSignal::Terminate);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                if let Some(pid) = self.pid {
                    signal_group(pid, GroupSignal::Kill);
                }
                if let Err(e) = child.kill().await {
                    debug!(program = %self.program, error = %e, "kill failed");
                }
            }
        }
        self.drain_stderr().await;
    }

    async fn drain_stderr(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            if tokio::time::timeout(Duration::from_millis(500), task).await.is_err() {
                debug!(program = %self.program, "stderr reader did not finish");
            }
        }
    }
}

impl Drop for JsonlProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Some(pid) = self.pid {
                signal_group(pid, GroupSignal::Kill);
            }
            let _ = child.start_kill();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for JsonlProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("end", &self.end)
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn append_bounded(buf: &mut String, line: &str) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > STDERR_LIMIT {
        let mut cut = buf.len() - STDERR_LIMIT;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(raw), sig) {
        debug!(pid, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) {}

/// Locate an executable on `PATH`, honoring `PATHEXT` on Windows.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let exts = executable_extensions();
    std::env::split_paths(&path).find_map(|dir| {
        exts.iter().find_map(|ext| {
            let candidate = dir.join(format!("{name}{ext}"));
            is_executable(&candidate).then_some(candidate)
        })
    })
}

fn executable_extensions() -> Vec<String> {
    if cfg!(windows) {
        let mut exts = vec![String::new()];
        let pathext = std::env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.CMD;.BAT".into());
        exts.extend(pathext.split(';').filter(|e| !e.is_empty()).map(str::to_lowercase));
        exts
    } else {
        vec![String::new()]
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
