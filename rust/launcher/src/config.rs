//! Configuration parsing for the launcher.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use smplfit_config::{ExperimentParams, LaunchMode, ParamsError};

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "launcher.toml";

/// Argument value that arms the post-run shutdown.
pub const POWEROFF_TRIGGER: &str = "poweroff";

/// Top-level configuration loaded from TOML (raw, before merging).
#[derive(Debug, Clone, Deserialize)]
struct RawLauncherConfig {
    #[serde(default)]
    pub launcher: LauncherSettings,
    #[serde(default = "empty_table")]
    pub defaults: toml::Value,
    #[serde(default = "empty_table")]
    pub train: toml::Value,
    #[serde(default = "empty_table")]
    pub test: toml::Value,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

/// Top-level configuration after merging defaults into both profiles.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub launcher: LauncherSettings,
    pub train: Profile,
    pub test: Profile,
}

/// Launcher-level settings shared by both profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// Interpreter used to run the profile scripts.
    #[serde(default = "default_python")]
    pub python: String,
    /// Directory created before every launch; child output is teed here.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Parent of the per-experiment tensorboard directory wiped before launch.
    #[serde(default = "default_tensorboard_dir")]
    pub tensorboard_dir: String,
    /// Parent of the per-experiment checkpoint directory.
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: String,
    /// Path to the launch ledger.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Extra environment for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub poweroff: PoweroffSettings,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            python: default_python(),
            log_dir: default_log_dir(),
            tensorboard_dir: default_tensorboard_dir(),
            checkpoints_dir: default_checkpoints_dir(),
            state_file: default_state_file(),
            env: BTreeMap::new(),
            poweroff: PoweroffSettings::default(),
        }
    }
}

impl LauncherSettings {
    /// Tensorboard directory of one experiment.
    #[must_use]
    pub fn tensorboard_path(&self, exper_name: &str) -> PathBuf {
        Path::new(&self.tensorboard_dir).join(exper_name)
    }

    /// Checkpoint directory of one experiment.
    #[must_use]
    pub fn checkpoint_path(&self, exper_name: &str) -> PathBuf {
        Path::new(&self.checkpoints_dir).join(exper_name)
    }

    /// Log file receiving the child's output.
    #[must_use]
    pub fn log_path(&self, mode: LaunchMode, exper_name: &str) -> PathBuf {
        Path::new(&self.log_dir).join(format!("{mode}_{exper_name}.log"))
    }
}

/// Shutdown requests issued after a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoweroffSettings {
    /// Each entry is one argv, run in order.
    #[serde(default = "default_poweroff_commands")]
    pub commands: Vec<Vec<String>>,
}

impl Default for PoweroffSettings {
    fn default() -> Self {
        Self {
            commands: default_poweroff_commands(),
        }
    }
}

/// One launch profile (`[train]` or `[test]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Python program to run.
    pub script: String,
    /// Interpreter override for this profile.
    #[serde(default)]
    pub python: Option<String>,
    /// Fill `load_checkpoints_path` from the experiment's checkpoint directory.
    #[serde(default)]
    pub auto_checkpoint: bool,
    #[serde(flatten)]
    pub params: ExperimentParams,
}

impl Profile {
    /// Build the child's arguments: the script followed by its flags.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.script.clone()];
        args.extend(self.params.to_cli_args());
        args
    }

    /// Interpreter for this profile.
    #[must_use]
    pub fn interpreter<'a>(&'a self, settings: &'a LauncherSettings) -> &'a str {
        self.python.as_deref().unwrap_or(&settings.python)
    }
}

/// Ledger key of a launch.
#[must_use]
pub fn run_key(mode: LaunchMode, exper_name: &str) -> String {
    format!("{mode}/{exper_name}")
}

fn default_python() -> String {
    "python".to_string()
}

fn default_log_dir() -> String {
    "_logs".to_string()
}

fn default_tensorboard_dir() -> String {
    "tensorboard".to_string()
}

fn default_checkpoints_dir() -> String {
    "checkpoints".to_string()
}

fn default_state_file() -> String {
    "_logs/launcher_state.json".to_string()
}

fn default_poweroff_commands() -> Vec<Vec<String>> {
    vec![
        vec!["sudo".into(), "poweroff".into()],
        vec!["sudo".into(), "shutdown".into(), "-h".into(), "now".into()],
    ]
}

/// Merge two TOML tables, with `overlay` values taking precedence.
fn merge_toml(base: &toml::Value, overlay: &toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(base_map), toml::Value::Table(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(
                    k.clone(),
                    if let Some(base_v) = base_map.get(k) {
                        merge_toml(base_v, v)
                    } else {
                        v.clone()
                    },
                );
            }
            toml::Value::Table(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

fn build_profile(
    mode: LaunchMode,
    defaults: &toml::Value,
    table: &toml::Value,
) -> Result<Profile, ConfigError> {
    let mut merged = merge_toml(defaults, table);
    if let toml::Value::Table(ref mut t) = merged
        && !t.contains_key("script")
    {
        t.insert(
            "script".into(),
            toml::Value::String(mode.default_script().to_string()),
        );
    }
    merged
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse(format!("[{mode}]: {e}")))
}

impl LauncherConfig {
    /// Load configuration from a TOML file, merging defaults into each profile.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawLauncherConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(Self {
            train: build_profile(LaunchMode::Train, &raw.defaults, &raw.train)?,
            test: build_profile(LaunchMode::Test, &raw.defaults, &raw.test)?,
            launcher: raw.launcher,
        })
    }

    /// The configuration used when no file is present.
    #[must_use]
    pub fn builtin() -> Self {
        let profile = |mode: LaunchMode| Profile {
            script: mode.default_script().to_string(),
            python: None,
            auto_checkpoint: false,
            params: ExperimentParams::default(),
        };
        Self {
            launcher: LauncherSettings::default(),
            train: profile(LaunchMode::Train),
            test: profile(LaunchMode::Test),
        }
    }

    /// Load `explicit` if given, else `launcher.toml` if present, else the
    /// built-in configuration.
    pub fn discover(explicit: Option<&str>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => {
                tracing::debug!("No {DEFAULT_CONFIG_FILE} found, using built-in profiles");
                Ok(Self::builtin())
            }
        }
    }

    #[must_use]
    pub fn profile(&self, mode: LaunchMode) -> &Profile {
        match mode {
            LaunchMode::Train => &self.train,
            LaunchMode::Test => &self.test,
        }
    }

    pub fn profile_mut(&mut self, mode: LaunchMode) -> &mut Profile {
        match mode {
            LaunchMode::Train => &mut self.train,
            LaunchMode::Test => &mut self.test,
        }
    }

    /// Reject configurations that would fail only after side effects.
    pub fn validate(&self, mode: LaunchMode) -> Result<(), ConfigError> {
        let profile = self.profile(mode);
        profile
            .params
            .validate()
            .map_err(|source| ConfigError::Invalid { mode, source })?;

        if profile.script.trim().is_empty() {
            return Err(ConfigError::EmptyField(format!("[{mode}] script")));
        }
        if profile.interpreter(&self.launcher).trim().is_empty() {
            return Err(ConfigError::EmptyField("python".into()));
        }
        if let Some(idx) = self
            .launcher
            .poweroff
            .commands
            .iter()
            .position(|argv| argv.first().is_none_or(|p| p.trim().is_empty()))
        {
            return Err(ConfigError::EmptyField(format!(
                "launcher.poweroff.commands[{idx}]"
            )));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid [{mode}] profile: {source}")]
    Invalid {
        mode: LaunchMode,
        source: ParamsError,
    },
    #[error("{0} must not be empty")]
    EmptyField(String),
}

#[cfg(test)]
mod tests {
    use smplfit_config::Shader;
    use tempfile::tempdir;

    use super::*;

    fn parse_config(toml_str: &str) -> LauncherConfig {
        // Write to unique temp file since load() reads from file
        let dir = tempdir().unwrap();
        let path = dir.path().join("launcher.toml");
        std::fs::write(&path, toml_str).unwrap();
        LauncherConfig::load(&path).unwrap()
    }

    #[test]
    fn test_empty_config_matches_builtin() {
        let config = parse_config("");
        let builtin = LauncherConfig::builtin();
        assert_eq!(config.train.to_args(), builtin.train.to_args());
        assert_eq!(config.test.to_args(), builtin.test.to_args());
        assert_eq!(config.train.script, "train.py");
        assert_eq!(config.test.script, "test.py");
        assert_eq!(config.launcher.log_dir, "_logs");
        assert_eq!(config.launcher.poweroff.commands.len(), 2);
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse_config(
            r#"
[defaults]
exper_name = "fit_f"
n_epoches = 20
batch_size = 8

[train]
shader = "soft_phong_shader"

[test]
batch_size = 1
load_checkpoints_path = "checkpoints/fit_f/model_final.pth"
"#,
        );
        assert_eq!(config.train.params.exper_name, "fit_f");
        assert_eq!(config.train.params.n_epoches, 20);
        assert_eq!(config.train.params.batch_size, 8);
        assert_eq!(config.train.params.shader, Shader::SoftPhongShader);

        assert_eq!(config.test.params.exper_name, "fit_f");
        assert_eq!(config.test.params.batch_size, 1); // Overridden
        assert_eq!(config.test.params.shader, Shader::SoftSilhouetteShader);
        assert_eq!(
            config.test.params.load_checkpoints_path.as_deref(),
            Some("checkpoints/fit_f/model_final.pth")
        );
    }

    #[test]
    fn test_launcher_settings() {
        let config = parse_config(
            r#"
[launcher]
python = "python3"
tensorboard_dir = "runs"

[launcher.env]
CUDA_VISIBLE_DEVICES = "0"

[launcher.poweroff]
commands = [["systemctl", "poweroff"]]

[train]
script = "scripts/train.py"
python = "/opt/conda/bin/python"
"#,
        );
        assert_eq!(config.launcher.python, "python3");
        assert_eq!(
            config.launcher.tensorboard_path("debug"),
            PathBuf::from("runs/debug")
        );
        assert_eq!(config.launcher.env["CUDA_VISIBLE_DEVICES"], "0");
        assert_eq!(config.launcher.poweroff.commands.len(), 1);
        assert_eq!(config.train.script, "scripts/train.py");
        assert_eq!(
            config.train.interpreter(&config.launcher),
            "/opt/conda/bin/python"
        );
        assert_eq!(config.test.interpreter(&config.launcher), "python3");
    }

    #[test]
    fn test_to_args() {
        let config = LauncherConfig::builtin();
        let args = config.test.to_args();
        assert_eq!(args[0], "test.py");
        assert_eq!(&args[1..3], &["--exper_name", "debug"]);
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
    }

    #[test]
    fn test_validate_rejects_bad_profile() {
        let mut config = LauncherConfig::builtin();
        config.train.params.exper_name = "../home".into();
        assert!(matches!(
            config.validate(LaunchMode::Train),
            Err(ConfigError::Invalid {
                mode: LaunchMode::Train,
                ..
            })
        ));
        // The other profile is unaffected
        assert!(config.validate(LaunchMode::Test).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_poweroff_command() {
        let mut config = LauncherConfig::builtin();
        config.launcher.poweroff.commands.push(Vec::new());
        assert!(matches!(
            config.validate(LaunchMode::Train),
            Err(ConfigError::EmptyField(_))
        ));
    }

    #[test]
    fn test_unknown_shader_is_parse_error() {
        let err = LauncherConfig::from_toml_str(
            r#"
[train]
shader = "wireframe"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(matches!(
            LauncherConfig::discover(path.to_str()),
            Err(ConfigError::Io(..))
        ));
    }

    #[test]
    fn test_log_path() {
        let settings = LauncherSettings::default();
        assert_eq!(
            settings.log_path(LaunchMode::Train, "debug"),
            PathBuf::from("_logs/train_debug.log")
        );
        assert_eq!(run_key(LaunchMode::Test, "fit"), "test/fit");
    }
}
