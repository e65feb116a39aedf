//! The on-the-fly learning loop: policy, controller and their side channels.

use crate::core::domain::Configuration;
use crate::md::Thermo;

pub mod checkpoint;
pub mod controller;
pub mod hooks;
pub mod params;
pub mod policy;
pub mod runlog;
pub mod telemetry;

/// Metrics of a single controller step.
/// Used for telemetry and UI visualization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    pub step: u64,
    pub dft_calls: u64,
    /// `None` on the bootstrap step, which never evaluates the policy.
    pub max_uncertainty: Option<f64>,
    pub called: bool,
    pub max_force_uncertainty: Option<f64>,
    /// Mean absolute force error of the model against the oracle.
    pub force_mae: Option<f64>,
    /// Absolute energy error per atom.
    pub energy_mae: Option<f64>,
    pub n_added: Option<usize>,
    pub thermo: Option<Thermo>,
    /// Score counts over `[0, 4 * call_threshold]`; the last bin is open.
    pub histogram: Vec<usize>,
    pub hyperparameters: Vec<f64>,
}

/// Events emitted by the learning worker to the main thread.
#[derive(Debug, Clone)]
pub enum LearnerEvent {
    /// Diagnostic log message.
    Log(String),

    /// A completed controller step.
    Step(StepMetrics),

    /// The configuration of the latest step with its per-atom scores.
    Structure {
        configuration: Configuration,
        scores: Vec<f64>,
    },

    /// The run has finished.
    Finished,

    /// The run stopped on an error.
    Failed(String),
}
