#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! smplfit launcher
//!
//! Prepares experiment directories, runs the SMPL silhouette-fitting
//! `train.py` / `test.py` programs, records each launch, and optionally
//! powers the machine off afterwards.

pub mod checkpoint;
pub mod config;
pub mod launch;
pub mod poweroff;
pub mod runner;
pub mod state;

pub use config::{LauncherConfig, Profile};
pub use launch::{LaunchError, LaunchOutcome, LaunchPlan, Launcher};
pub use poweroff::Poweroff;
pub use runner::Runner;
pub use state::{RunState, RunStatus, StateManager};
