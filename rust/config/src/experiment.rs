//! Experiment parameters and their command-line rendering.

use serde::{Deserialize, Serialize};

use crate::{Device, Shader};

/// Experiment name that switches the display cadence to every step.
pub const DEBUG_EXPER_NAME: &str = "debug";

/// Display cadence used by `debug` experiments.
pub const DEBUG_DISPLAY_STEP: usize = 1;

/// Display cadence used by every other experiment.
pub const DEFAULT_DISPLAY_STEP: usize = 50;

/// SMPL female body model shipped with the fitting datasets.
pub const DEFAULT_REGISTRATION_PATH: &str =
    "datasets/smpl/registrations/basicModel_f_lbs_10_207_0_v1.0.0.pkl";

/// Parameters forwarded verbatim to `train.py` / `test.py`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentParams {
    #[serde(default = "default_exper_name")]
    pub exper_name: String,
    #[serde(default = "default_n_epoches")]
    pub n_epoches: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Explicit display cadence. Derived from `exper_name` when unset.
    #[serde(default)]
    pub n_display_step: Option<usize>,
    #[serde(default = "default_registration_path")]
    pub smpl_registration_path: String,
    #[serde(default)]
    pub shader: Shader,
    #[serde(default = "default_true")]
    pub debug: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub n_workers: Option<usize>,
    #[serde(default)]
    pub load_checkpoints_path: Option<String>,
    /// Appended after the derived flags, unmodified.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_exper_name() -> String {
    DEBUG_EXPER_NAME.into()
}
fn default_n_epoches() -> usize {
    100
}
fn default_batch_size() -> usize {
    4
}
fn default_registration_path() -> String {
    DEFAULT_REGISTRATION_PATH.into()
}
fn default_true() -> bool {
    true
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            exper_name: default_exper_name(),
            n_epoches: default_n_epoches(),
            batch_size: default_batch_size(),
            n_display_step: None,
            smpl_registration_path: default_registration_path(),
            shader: Shader::default(),
            debug: true,
            seed: None,
            device: None,
            n_workers: None,
            load_checkpoints_path: None,
            extra_args: Vec::new(),
        }
    }
}

impl ExperimentParams {
    /// Display cadence, falling back to the experiment-name rule.
    #[must_use]
    pub fn display_step(&self) -> usize {
        self.n_display_step.unwrap_or(if self.exper_name == DEBUG_EXPER_NAME {
            DEBUG_DISPLAY_STEP
        } else {
            DEFAULT_DISPLAY_STEP
        })
    }

    /// Check the values that would otherwise only fail inside the child, or
    /// worse, point directory cleanup outside its parent.
    pub fn validate(&self) -> Result<(), ParamsError> {
        validate_exper_name(&self.exper_name)?;
        if self.n_epoches == 0 {
            return Err(ParamsError::Zero("n_epoches"));
        }
        if self.batch_size == 0 {
            return Err(ParamsError::Zero("batch_size"));
        }
        if self.n_display_step == Some(0) {
            return Err(ParamsError::Zero("n_display_step"));
        }
        if self.smpl_registration_path.trim().is_empty() {
            return Err(ParamsError::EmptyRegistrationPath);
        }
        Ok(())
    }

    /// Convert to CLI arguments for subprocess invocation.
    #[must_use]
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "--exper_name".into(),
            self.exper_name.clone(),
            "--n_epoches".into(),
            self.n_epoches.to_string(),
            "--batch_size".into(),
            self.batch_size.to_string(),
            "--n_display_step".into(),
            self.display_step().to_string(),
            "--smpl_registration_path".into(),
            self.smpl_registration_path.clone(),
            "--shader".into(),
            self.shader.to_string(),
        ];
        if self.debug {
            args.push("--debug".into());
        }
        if let Some(seed) = self.seed {
            args.extend(["--seed".into(), seed.to_string()]);
        }
        if let Some(device) = self.device {
            args.extend(["--device".into(), device.to_string()]);
        }
        if let Some(n_workers) = self.n_workers {
            args.extend(["--n_workers".into(), n_workers.to_string()]);
        }
        if let Some(ref path) = self.load_checkpoints_path {
            args.extend(["--load_checkpoints_path".into(), path.clone()]);
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// An experiment name namespaces directories that get deleted, so it must be a
/// single plain path component.
fn validate_exper_name(name: &str) -> Result<(), ParamsError> {
    if name.trim().is_empty() {
        return Err(ParamsError::EmptyExperName);
    }
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ParamsError::UnsafeExperName(name.to_string()));
    }
    Ok(())
}

/// Command-line overrides layered over a loaded profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ParamOverrides {
    /// Experiment name (namespaces tensorboard and log output)
    #[cfg_attr(feature = "clap", arg(long))]
    pub exper_name: Option<String>,
    /// Number of epochs
    #[cfg_attr(feature = "clap", arg(long))]
    pub epochs: Option<usize>,
    /// Batch size
    #[cfg_attr(feature = "clap", arg(long))]
    pub batch_size: Option<usize>,
    /// Display cadence in steps (derived from the experiment name if unset)
    #[cfg_attr(feature = "clap", arg(long))]
    pub display_step: Option<usize>,
    /// Renderer shader
    #[cfg_attr(feature = "clap", arg(long))]
    pub shader: Option<Shader>,
    /// Disable the `--debug` flag
    #[cfg_attr(feature = "clap", arg(long))]
    pub no_debug: bool,
}

impl ParamOverrides {
    pub fn apply(&self, params: &mut ExperimentParams) {
        if let Some(ref name) = self.exper_name {
            params.exper_name.clone_from(name);
        }
        if let Some(epochs) = self.epochs {
            params.n_epoches = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            params.batch_size = batch_size;
        }
        if let Some(step) = self.display_step {
            params.n_display_step = Some(step);
        }
        if let Some(shader) = self.shader {
            params.shader = shader;
        }
        if self.no_debug {
            params.debug = false;
        }
    }
}

/// Invalid experiment parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    #[error("experiment name must not be empty")]
    EmptyExperName,
    #[error("experiment name '{0}' must be a single path component")]
    UnsafeExperName(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("smpl_registration_path must not be empty")]
    EmptyRegistrationPath,
}
