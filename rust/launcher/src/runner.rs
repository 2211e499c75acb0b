//! Subprocess execution for fitting runs.

use std::{
    collections::{BTreeMap, VecDeque},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};

use indicatif::ProgressBar;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
};

use crate::{
    checkpoint::find_checkpoint,
    state::{StateManager, now_timestamp},
};

/// Number of trailing stderr lines kept for the error report.
const STDERR_TAIL: usize = 20;

/// Result of a fitting run.
#[derive(Debug)]
pub struct RunResult {
    /// Ledger key.
    pub key: String,
    /// Whether the run succeeded.
    pub success: bool,
    /// Exit code if available.
    pub exit_code: Option<i32>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Latest checkpoint after the run.
    pub checkpoint: Option<PathBuf>,
}

/// Which stream a child line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Manages subprocess execution for fitting runs.
pub struct Runner {
    /// Interpreter the profile script is handed to.
    program: String,
    /// Extra environment for the child.
    env: BTreeMap<String, String>,
    /// State manager for persistence.
    state_manager: StateManager,
}

impl Runner {
    /// Create a new runner.
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        env: BTreeMap<String, String>,
        state_manager: StateManager,
    ) -> Self {
        Self {
            program: program.into(),
            env,
            state_manager,
        }
    }

    /// Spawn the fitting program as a subprocess.
    pub fn spawn(
        &self,
        key: &str,
        args: &[String],
        log_file: impl AsRef<Path>,
    ) -> Result<RunHandle, RunError> {
        tracing::debug!("Spawning: {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunError::Spawn(self.program.clone(), e))?;

        let pid = child
            .id()
            .ok_or_else(|| RunError::Spawn(self.program.clone(), std::io::Error::other("no PID")))?;

        let log_file = log_file.as_ref().to_path_buf();
        if let Err(e) = self
            .state_manager
            .mark_started(key, pid, &log_file.display().to_string())
        {
            tracing::warn!("Failed to record start of {key}: {e}");
        }

        Ok(RunHandle {
            key: key.to_string(),
            log_file,
            child,
            pid,
        })
    }

    /// Wait for a run to complete, teeing its output to the terminal and the
    /// log file, then record the outcome.
    ///
    /// Output lines are printed through `progress` so they never clobber the
    /// spinner; its message tracks the most recent line.
    pub async fn wait(
        &self,
        mut handle: RunHandle,
        progress: &ProgressBar,
        checkpoint_dir: impl AsRef<Path>,
    ) -> RunResult {
        let mut log = open_log(&handle.log_file).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(Stream, String)>();

        let stdout_task = handle
            .child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump(out, Stream::Stdout, tx.clone())));
        let stderr_task = handle
            .child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump(err, Stream::Stderr, tx.clone())));
        drop(tx);

        // Single writer for the log file and the terminal, so lines from the
        // two streams never interleave mid-line
        let mut tail = VecDeque::with_capacity(STDERR_TAIL);
        while let Some((stream, line)) = rx.recv().await {
            if let Some(ref mut f) = log {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
            }
            progress.suspend(|| match stream {
                Stream::Stdout => println!("{line}"),
                Stream::Stderr => eprintln!("{line}"),
            });
            progress.set_message(truncate(&line, 80));

            if stream == Stream::Stderr {
                if tail.len() >= STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        if let Some(ref mut f) = log {
            let _ = f.flush().await;
        }

        // Wait for process
        let status = handle.child.wait().await;

        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        let checkpoint = find_checkpoint(checkpoint_dir);
        let checkpoint_str = checkpoint.as_ref().map(|p| p.display().to_string());

        match status {
            Ok(status) if status.success() => {
                if let Err(e) =
                    self.state_manager
                        .mark_completed(&handle.key, exit_code(status), checkpoint_str)
                {
                    tracing::error!("Failed to mark {} as completed: {}", handle.key, e);
                }
                RunResult {
                    key: handle.key,
                    success: true,
                    exit_code: exit_code(status),
                    error: None,
                    checkpoint,
                }
            }
            Ok(status) => {
                let error_msg = if tail.is_empty() {
                    format!("Exit status: {status}")
                } else {
                    tail.into_iter().collect::<Vec<_>>().join("\n")
                };
                if let Err(e) = self.state_manager.mark_failed(
                    &handle.key,
                    exit_code(status),
                    &error_msg,
                    checkpoint_str,
                ) {
                    tracing::error!("Failed to mark {} as failed: {}", handle.key, e);
                }
                RunResult {
                    key: handle.key,
                    success: false,
                    exit_code: exit_code(status),
                    error: Some(error_msg),
                    checkpoint,
                }
            }
            Err(e) => {
                let error_msg = format!("Process error: {e}");
                if let Err(e) =
                    self.state_manager
                        .mark_failed(&handle.key, None, &error_msg, checkpoint_str)
                {
                    tracing::error!("Failed to mark {} as failed: {}", handle.key, e);
                }
                RunResult {
                    key: handle.key,
                    success: false,
                    exit_code: None,
                    error: Some(error_msg),
                    checkpoint,
                }
            }
        }
    }

    /// Get the state manager.
    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        &self.state_manager
    }
}

/// Open the log for appending, writing a separator if it already has content.
async fn open_log(path: &Path) -> Option<File> {
    let mut file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!("Cannot open log file {}: {e}", path.display());
            return None;
        }
    };

    if file.metadata().await.is_ok_and(|m| m.len() > 0) {
        let _ = file
            .write_all(format!("\n--- relaunch at {} ---\n\n", now_timestamp()).as_bytes())
            .await;
    }
    Some(file)
}

/// Forward lines of one child stream to the writer.
///
/// Lines are split on raw bytes and decoded lossily; the pipe is read until
/// EOF so the child never sees it closed early.
async fn pump<R>(reader: R, stream: Stream, tx: tokio::sync::mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forward = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if forward && tx.send((stream, decode_line(&buf))).is_err() {
                    forward = false;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!("Reading child {stream:?} failed: {e}");
                break;
            }
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Exit code as a shell reports it: the child's own code, or `128 + signal`
/// when it was killed.
fn exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

fn truncate(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

/// Handle to a running subprocess.
pub struct RunHandle {
    /// Ledger key.
    pub key: String,
    /// File receiving the child's output.
    pub log_file: PathBuf,
    /// Child process.
    child: Child,
    /// Process ID.
    pub pid: u32,
}

/// Errors that can occur when running a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
}
