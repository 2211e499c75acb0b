//! Selector enums forwarded to the fitting programs.

use serde::{Deserialize, Serialize};

/// Renderer shader used by the silhouette fitting programs.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Shader {
    #[default]
    #[cfg_attr(feature = "clap", value(name = "soft_silhouette_shader"))]
    SoftSilhouetteShader,
    #[cfg_attr(feature = "clap", value(name = "soft_phong_shader"))]
    SoftPhongShader,
    #[cfg_attr(feature = "clap", value(name = "textured_soft_phong_shader"))]
    TexturedSoftPhongShader,
}

impl std::fmt::Display for Shader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SoftSilhouetteShader => write!(f, "soft_silhouette_shader"),
            Self::SoftPhongShader => write!(f, "soft_phong_shader"),
            Self::TexturedSoftPhongShader => write!(f, "textured_soft_phong_shader"),
        }
    }
}

/// Device the fitting program should run on.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    #[default]
    Gpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Which of the two launch profiles to run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    Train,
    Test,
}

impl LaunchMode {
    /// Python program run when the profile does not name one.
    #[must_use]
    pub fn default_script(self) -> &'static str {
        match self {
            Self::Train => "train.py",
            Self::Test => "test.py",
        }
    }

    /// Table name of this profile in `launcher.toml`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
