//! Launch ledger tracking and persistence.
//!
//! Records every launch keyed by `<mode>/<exper_name>` and persists to JSON,
//! so an interrupted launcher leaves a trace that `status` can report.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

/// Status of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Child process is executing.
    Running,
    /// Child exited successfully.
    Completed,
    /// Child failed, could not be spawned, or the launcher died under it.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Ledger entry of one experiment in one mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    /// Log file the child's output went to.
    pub log_file: String,
    /// Process ID while running (for crash detection).
    pub pid: Option<u32>,
    /// How many times this key has been launched.
    pub launches: u32,
    /// Exit code of the last finished launch.
    pub exit_code: Option<i32>,
    /// Latest checkpoint seen after the last launch.
    pub checkpoint: Option<String>,
    /// Error messages from failures.
    #[serde(default)]
    pub errors: Vec<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl RunState {
    fn started(log_file: String, pid: u32) -> Self {
        Self {
            status: RunStatus::Running,
            log_file,
            pid: Some(pid),
            launches: 0,
            exit_code: None,
            checkpoint: None,
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Persistent state for all launches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerState {
    /// Launch records, keyed by `<mode>/<exper_name>`.
    pub runs: BTreeMap<String, RunState>,
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Manages ledger persistence with file locking.
pub struct StateManager {
    /// Path to the state file.
    pub path: PathBuf,
}

impl StateManager {
    /// Create a new state manager for the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from file, or create empty state if file doesn't exist.
    pub fn load(&self) -> Result<LedgerState, StateError> {
        if !self.path.exists() {
            return Ok(LedgerState::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let state = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            LedgerState::default()
        };

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Save state to file with exclusive lock.
    pub fn save(&self, state: &LedgerState) -> Result<(), StateError> {
        self.create_parent()?;

        let file = File::create(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        serde_json::to_writer_pretty(BufWriter::new(&file), state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(())
    }

    fn create_parent(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }
        Ok(())
    }

    /// Update state atomically with a closure (holds lock for entire operation).
    pub fn update<F>(&self, f: F) -> Result<LedgerState, StateError>
    where
        F: FnOnce(&mut LedgerState),
    {
        self.create_parent()?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        // Read current state (or default if empty/new file)
        let mut state: LedgerState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            serde_json::from_reader(BufReader::new(&file))
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            LedgerState::default()
        };

        f(&mut state);

        // Truncate and write back
        file.set_len(0)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        serde_json::to_writer_pretty(BufWriter::new(&file), &state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Mark a launch as started, creating its entry if needed.
    pub fn mark_started(&self, key: &str, pid: u32, log_file: &str) -> Result<(), StateError> {
        self.update(|state| {
            let run = state
                .runs
                .entry(key.to_string())
                .or_insert_with(|| RunState::started(log_file.to_string(), pid));
            run.status = RunStatus::Running;
            run.pid = Some(pid);
            run.log_file = log_file.to_string();
            run.launches += 1;
            run.exit_code = None;
            run.started_at = Some(now_timestamp());
            run.finished_at = None;
        })?;
        Ok(())
    }

    /// Mark a launch as completed.
    pub fn mark_completed(
        &self,
        key: &str,
        exit_code: Option<i32>,
        checkpoint: Option<String>,
    ) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(run) = state.runs.get_mut(key) {
                run.status = RunStatus::Completed;
                run.pid = None;
                run.exit_code = exit_code;
                run.finished_at = Some(now_timestamp());
                if checkpoint.is_some() {
                    run.checkpoint = checkpoint;
                }
            }
        })?;
        Ok(())
    }

    /// Mark a launch as failed.
    pub fn mark_failed(
        &self,
        key: &str,
        exit_code: Option<i32>,
        error: &str,
        checkpoint: Option<String>,
    ) -> Result<(), StateError> {
        self.update(|state| {
            if let Some(run) = state.runs.get_mut(key) {
                run.status = RunStatus::Failed;
                run.pid = None;
                run.exit_code = exit_code;
                run.errors.push(error.to_string());
                run.finished_at = Some(now_timestamp());
                if checkpoint.is_some() {
                    run.checkpoint = checkpoint;
                }
            }
        })?;
        Ok(())
    }

    /// Drop a ledger entry. Returns whether it existed.
    pub fn reset_run(&self, key: &str) -> Result<bool, StateError> {
        let mut found = false;
        self.update(|state| {
            found = state.runs.remove(key).is_some();
        })?;
        Ok(found)
    }

    /// Detect crashed launches (status=Running but PID dead) and mark them failed.
    pub fn recover_crashed_runs(&self) -> Result<Vec<String>, StateError> {
        let mut crashed = Vec::new();

        self.update(|state| {
            for (key, run) in &mut state.runs {
                if run.status == RunStatus::Running {
                    let is_alive = run.pid.is_some_and(is_process_alive);
                    if !is_alive {
                        run.status = RunStatus::Failed;
                        run.pid = None;
                        run.errors
                            .push("Process crashed or launcher was killed".to_string());
                        crashed.push(key.clone());
                    }
                }
            }
        })?;

        Ok(crashed)
    }
}

/// Check if a process is alive by PID.
fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 performs only the existence/permission check
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Get current local time as a display timestamp.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with state management.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write state file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock state file {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write state file {0}: {1}")]
    Write(PathBuf, String),
}
