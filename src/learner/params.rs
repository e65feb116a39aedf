use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::optimizer::OptimizerSettings;

/// Numeric knobs and flags of an on-the-fly run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerParams {
    /// A step queries the oracle when any score exceeds this.
    pub call_threshold: f64,
    /// Atoms whose score exceeds this are added to the sparse set after a query.
    pub add_threshold: f64,
    /// Random environments drawn from the first configuration.
    pub initial_environments: usize,
    /// Per-species offsets subtracted from oracle energies. `None` means all zero.
    pub energy_correction: Option<Vec<f64>>,

    pub train_energy: bool,
    pub train_forces: bool,
    pub train_stress: bool,

    /// Re-optimize hyperparameters on every n-th oracle call.
    pub optimize_every: Option<u64>,
    /// Stop re-optimizing after this many oracle calls.
    pub optimize_until: Option<u64>,
    pub optimizer: OptimizerSettings,

    pub model_path: PathBuf,
    pub resume_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,

    /// Seed for environment sampling.
    pub seed: u64,
    /// Bins of the per-step score histogram.
    pub histogram_bins: usize,
}

impl Default for LearnerParams {
    fn default() -> Self {
        Self {
            call_threshold: 0.005,
            add_threshold: 0.0025,
            initial_environments: 16,
            energy_correction: None,
            train_energy: true,
            train_forces: true,
            train_stress: true,
            optimize_every: None,
            optimize_until: None,
            optimizer: OptimizerSettings::default(),
            model_path: PathBuf::from("otf_model.json"),
            resume_path: None,
            log_path: Some(PathBuf::from("otf.log")),
            seed: 42,
            histogram_bins: 20,
        }
    }
}

impl LearnerParams {
    /// Reads parameters from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading parameters from {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}
