//! Surrogate model interface and the built-in sparse Gaussian process.

use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::domain::{Configuration, Efs, TrainingRecord};
use crate::errors::ModelError;

pub mod descriptor;
pub mod kernel;
pub mod mapping;
pub mod optimizer;
pub mod sparse_gp;

use descriptor::DescriptorSet;

/// Log marginal likelihood and its gradient with respect to the hyperparameters,
/// in the order of [`SurrogateModel::hyperparameters`].
#[derive(Debug, Clone, PartialEq)]
pub struct Likelihood {
    pub value: f64,
    pub gradient: Vec<f64>,
}

/// Mean prediction with per-component predictive variance, same layout.
#[derive(Debug, Clone)]
pub struct EfsPrediction {
    pub mean: Efs,
    pub variance: Efs,
}

impl EfsPrediction {
    pub fn max_force_std(&self) -> f64 {
        self.variance
            .forces
            .iter()
            .flat_map(|f| f.iter().copied())
            .map(|v| v.abs().sqrt())
            .fold(0.0, f64::max)
    }

    pub fn energy_std(&self) -> f64 {
        self.variance.energy.abs().sqrt()
    }
}

/// The capabilities the controller needs from a regression model.
///
/// Training records are append-only: implementations never remove or alter a record
/// once accepted. Any mutation invalidates the fitted state until [`refit`] succeeds.
///
/// [`refit`]: SurrogateModel::refit
pub trait SurrogateModel {
    /// Self-contained predictive artifact written as the model checkpoint.
    type Artifact: Serialize + DeserializeOwned;

    fn descriptors(&self) -> &DescriptorSet;

    fn hyperparameters(&self) -> Vec<f64>;

    fn hyperparameter_names(&self) -> &'static [&'static str];

    /// Signal standard deviation used to normalize uncertainties.
    fn signal_std(&self) -> f64;

    /// Replaces the hyperparameters and refits.
    fn set_hyperparameters(&mut self, values: &[f64]) -> Result<(), ModelError>;

    fn training_records(&self) -> &[TrainingRecord];

    fn sparse_count(&self) -> usize;

    /// Appends a labelled configuration; returns its record index.
    fn add_training_record(&mut self, record: TrainingRecord) -> Result<usize, ModelError>;

    /// Adds up to `count` randomly chosen environments of a record to the sparse set.
    /// Returns the chosen atom indices.
    fn add_random_environments(
        &mut self,
        record: usize,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, ModelError>;

    /// Adds the environments of the given atoms of a record to the sparse set.
    /// Returns how many were new.
    fn add_specific_environments(&mut self, record: usize, atoms: &[usize]) -> Result<usize, ModelError>;

    /// Rebuilds the internal factorizations from the current training set.
    fn refit(&mut self) -> Result<(), ModelError>;

    fn is_fitted(&self) -> bool;

    /// Per-atom predicted variance of the local energy.
    fn predict_local_variances(&self, config: &Configuration) -> Result<Vec<f64>, ModelError>;

    /// Mean energy, forces and stress with their predictive variances.
    fn predict_efs(&self, config: &Configuration) -> Result<EfsPrediction, ModelError>;

    fn likelihood(&self) -> Result<Likelihood, ModelError>;

    fn export(&self) -> Result<Self::Artifact, ModelError>;
}
