//! Post-run machine shutdown.
//!
//! Armed only when the launch argument is exactly `poweroff`. Each configured
//! shutdown request is issued once, in order, and only after the fitting
//! program exited successfully.

use std::process::Command;

use crate::config::POWEROFF_TRIGGER;

/// Shutdown requests for one launch.
#[derive(Debug, Clone)]
pub struct Poweroff {
    /// Argv of each shutdown request.
    commands: Vec<Vec<String>>,
    /// Whether the launch argument asked for shutdown.
    armed: bool,
}

impl Poweroff {
    /// Arm shutdown if `after` is exactly the trigger value.
    #[must_use]
    pub fn from_arg(after: &str, commands: Vec<Vec<String>>) -> Self {
        Self {
            commands,
            armed: after == POWEROFF_TRIGGER,
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    #[must_use]
    pub fn commands(&self) -> &[Vec<String>] {
        &self.commands
    }

    /// Check configuration and return any problems.
    /// Returns None if everything is OK, Some(warning) if there's an issue.
    #[must_use]
    pub fn check_config(&self) -> Option<String> {
        if !self.armed {
            return None;
        }

        let missing: Vec<&str> = self
            .commands
            .iter()
            .filter_map(|argv| argv.first())
            .filter(|program| !Self::is_installed(program))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            None
        } else {
            Some(format!(
                "poweroff requested but not found in PATH: {}",
                missing.join(", ")
            ))
        }
    }

    fn is_installed(program: &str) -> bool {
        if program.contains('/') {
            return std::path::Path::new(program).exists();
        }
        Command::new("which")
            .arg(program)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    /// Issue every shutdown request, stopping at the first one that fails.
    ///
    /// Returns the number of requests issued.
    pub fn run(&self) -> Result<usize, PoweroffError> {
        if !self.armed {
            return Err(PoweroffError::Disarmed);
        }

        for (idx, argv) in self.commands.iter().enumerate() {
            let (program, args) = argv.split_first().ok_or(PoweroffError::Empty(idx))?;

            tracing::info!("Requesting shutdown: {}", argv.join(" "));

            let output = Command::new(program)
                .args(args)
                .output()
                .map_err(|e| PoweroffError::Spawn(argv.join(" "), e))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(PoweroffError::Command(
                    argv.join(" "),
                    stderr.trim().to_string(),
                ));
            }
        }

        Ok(self.commands.len())
    }
}

/// Errors that can occur while shutting down.
#[derive(Debug, thiserror::Error)]
pub enum PoweroffError {
    #[error("poweroff was not requested")]
    Disarmed,
    #[error("poweroff command #{0} is empty")]
    Empty(usize),
    #[error("failed to run `{0}`: {1}")]
    Spawn(String, std::io::Error),
    #[error("`{0}` failed: {1}")]
    Command(String, String),
}
