//! One launch: directory setup, the blocking fitting run, optional shutdown.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use smplfit_config::LaunchMode;

use crate::{
    checkpoint::find_checkpoint,
    config::{ConfigError, LauncherConfig, run_key},
    poweroff::{Poweroff, PoweroffError},
    runner::{RunError, Runner},
    state::StateManager,
};

/// Everything a launch will do, resolved up front.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub mode: LaunchMode,
    /// Ledger key, `<mode>/<exper_name>`.
    pub key: String,
    /// Interpreter to execute.
    pub program: String,
    /// Script followed by its flags.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    pub log_dir: PathBuf,
    pub log_file: PathBuf,
    /// Removed before the child starts.
    pub tensorboard_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub poweroff: Poweroff,
}

impl LaunchPlan {
    /// The child's command line, space-joined for display.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a successful launch did.
#[derive(Debug)]
pub struct LaunchOutcome {
    pub key: String,
    pub exit_code: Option<i32>,
    pub checkpoint: Option<PathBuf>,
    /// Number of shutdown requests issued.
    pub poweroff_requests: usize,
}

/// Runs launch profiles from a loaded configuration.
pub struct Launcher {
    config: LauncherConfig,
    show_progress: bool,
}

impl Launcher {
    #[must_use]
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            show_progress: true,
        }
    }

    /// Draw a spinner while the child runs.
    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Resolve a launch without touching the filesystem (beyond checkpoint
    /// lookup).
    pub fn plan(&self, mode: LaunchMode, after: &str) -> Result<LaunchPlan, LaunchError> {
        self.config.validate(mode)?;

        let settings = &self.config.launcher;
        let mut profile = self.config.profile(mode).clone();
        let exper_name = profile.params.exper_name.clone();
        let checkpoint_dir = settings.checkpoint_path(&exper_name);

        if profile.auto_checkpoint && profile.params.load_checkpoints_path.is_none() {
            match find_checkpoint(&checkpoint_dir) {
                Some(path) => {
                    tracing::info!("Using checkpoint {}", path.display());
                    profile.params.load_checkpoints_path = Some(path.display().to_string());
                }
                None => tracing::warn!(
                    "auto_checkpoint set but no checkpoint in {}",
                    checkpoint_dir.display()
                ),
            }
        }

        Ok(LaunchPlan {
            mode,
            key: run_key(mode, &exper_name),
            program: profile.interpreter(settings).to_string(),
            args: profile.to_args(),
            env: settings.env.clone(),
            log_dir: PathBuf::from(&settings.log_dir),
            log_file: settings.log_path(mode, &exper_name),
            tensorboard_dir: settings.tensorboard_path(&exper_name),
            checkpoint_dir,
            poweroff: Poweroff::from_arg(after, settings.poweroff.commands.clone()),
        })
    }

    /// Create the log directory and wipe the experiment's tensorboard directory.
    pub fn prepare_dirs(plan: &LaunchPlan) -> Result<(), LaunchError> {
        std::fs::create_dir_all(&plan.log_dir)
            .map_err(|e| LaunchError::Prepare(plan.log_dir.clone(), e))?;
        remove_tree(&plan.tensorboard_dir)
            .map_err(|e| LaunchError::Prepare(plan.tensorboard_dir.clone(), e))?;
        tracing::debug!("Cleared {}", plan.tensorboard_dir.display());
        Ok(())
    }

    /// Run one profile to completion, then shut down if `after` asks for it
    /// and the run succeeded.
    pub async fn launch(&self, mode: LaunchMode, after: &str) -> Result<LaunchOutcome, LaunchError> {
        let plan = self.plan(mode, after)?;

        if let Some(warning) = plan.poweroff.check_config() {
            tracing::warn!("{warning}");
        }

        let state_manager = StateManager::new(&self.config.launcher.state_file);
        match state_manager.recover_crashed_runs() {
            Ok(crashed) if !crashed.is_empty() => {
                tracing::info!("Marked {} interrupted launches as failed: {:?}", crashed.len(), crashed);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Cannot read launch ledger: {e}"),
        }

        Self::prepare_dirs(&plan)?;

        let runner = Runner::new(plan.program.clone(), plan.env.clone(), state_manager);
        let pb = self.spinner();
        pb.set_message(format!("{}: starting...", plan.key));

        tracing::info!("Launching {}: {}", plan.key, plan.command_line());
        let handle = runner.spawn(&plan.key, &plan.args, &plan.log_file)?;
        pb.set_message(format!("{}: running (PID {})", plan.key, handle.pid));

        let result = runner.wait(handle, &pb, &plan.checkpoint_dir).await;
        pb.finish_with_message(format!(
            "{}: {}",
            plan.key,
            if result.success { "completed" } else { "failed" }
        ));

        if !result.success {
            return Err(LaunchError::Failed {
                key: result.key,
                exit_code: result.exit_code,
                error: result.error.unwrap_or_default(),
            });
        }

        tracing::info!("{} completed", result.key);

        let poweroff_requests = if plan.poweroff.is_armed() {
            plan.poweroff.run()?
        } else {
            0
        };

        Ok(LaunchOutcome {
            key: result.key,
            exit_code: result.exit_code,
            checkpoint: result.checkpoint,
            poweroff_requests,
        })
    }

    fn spinner(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }
}

/// `rm -rf`: remove a directory tree, file or symlink; absent is fine.
fn remove_tree(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Errors that abort a launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare {0}: {1}")]
    Prepare(PathBuf, std::io::Error),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("{key} failed (exit code {exit_code:?}):\n{error}")]
    Failed {
        key: String,
        exit_code: Option<i32>,
        error: String,
    },
    #[error("shutdown failed: {0}")]
    Poweroff(#[from] PoweroffError),
}

impl LaunchError {
    /// Process exit code for this error: the child's own code when it failed,
    /// 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Failed {
                exit_code: Some(code),
                ..
            } => u8::try_from(*code).ok().filter(|c| *c != 0).unwrap_or(1),
            _ => 1,
        }
    }
}
