//! Engine-facing interface and a minimal molecular-dynamics integrator.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::domain::Configuration;

pub mod verlet;

/// Engine observables, in metal units (K, eV/A^3, eV, A^3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thermo {
    pub temperature: f64,
    pub pressure: f64,
    pub potential_energy: f64,
    pub volume: f64,
}

/// What the controller needs from a stepping simulation.
pub trait SimulationEngine {
    /// Current configuration.
    fn snapshot(&self) -> anyhow::Result<Configuration>;

    fn step_index(&self) -> u64;

    /// Observables of the current step, if the engine has a potential loaded.
    fn thermo(&self) -> Option<Thermo>;

    /// Replaces the potential with the checkpoint at `path`.
    fn reload_potential(&mut self, path: &Path) -> anyhow::Result<()>;
}
