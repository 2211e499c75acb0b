//! Checkpoint discovery in an experiment's checkpoint directory.

use std::path::{Path, PathBuf};

/// Extension of checkpoints written by the fitting programs.
const CHECKPOINT_EXT: &str = "pth";

/// Stem prefix of generator weights; preferred over the discriminator's
/// (`model_D...`) when both were saved for the same epoch.
const GENERATOR_PREFIX: &str = "model_G";

/// Find the checkpoint a test run should load.
///
/// A `*.pth` file whose stem contains `final` wins; otherwise the file with
/// the largest trailing number in its stem (`model_ep12.pth` -> 12). Ties go
/// to generator weights, then the shorter stem, then the lexically smaller
/// one, so the pick never depends on directory order.
#[must_use]
pub fn find_checkpoint(dir: impl AsRef<Path>) -> Option<PathBuf> {
    let mut best: Option<(Rank, PathBuf)> = None;

    for entry in std::fs::read_dir(dir.as_ref()).ok()?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(rank) = Rank::of(stem) else {
            continue;
        };

        if best.as_ref().is_none_or(|(current, _)| rank > *current) {
            best = Some((rank, path));
        }
    }

    best.map(|(_, path)| path)
}

/// Ordering of checkpoint candidates; the greatest wins.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    is_final: bool,
    epoch: u64,
    is_generator: bool,
    shorter: std::cmp::Reverse<usize>,
    name: std::cmp::Reverse<String>,
}

impl Rank {
    fn of(stem: &str) -> Option<Self> {
        let is_final = stem.contains("final");
        let epoch = match trailing_number(stem) {
            Some(epoch) => epoch,
            None if is_final => 0,
            None => return None,
        };
        Some(Self {
            is_final,
            epoch,
            is_generator: stem.starts_with(GENERATOR_PREFIX),
            shorter: std::cmp::Reverse(stem.len()),
            name: std::cmp::Reverse(stem.to_string()),
        })
    }
}

fn trailing_number(stem: &str) -> Option<u64> {
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    stem[stem.len() - digits..].parse().ok()
}
