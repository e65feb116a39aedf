#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use nalgebra::{Point3, Vector3};
use parking_lot::Mutex;
use rand::seq::index::sample;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use otf_learner::core::chemistry::PairParams;
use otf_learner::core::domain::{Configuration, Efs, Labels, Lattice, Species, TrainingRecord};
use otf_learner::engine::pair::LennardJones;
use otf_learner::engine::oracle::{GroundTruth, Oracle};
use otf_learner::errors::ModelError;
use otf_learner::model::descriptor::{DescriptorSet, RadialBasis};
use otf_learner::model::{EfsPrediction, Likelihood, SurrogateModel};

/// Signal of [`ScriptedModel`]; scores are `sqrt(variance) / SCRIPTED_SIGNAL`.
pub const SCRIPTED_SIGNAL: f64 = 2.0;

/// Oracle returning a fixed energy per atom and zero forces and stress.
/// Records the atom count of every call; can be switched to fail.
pub struct MockOracle {
    pub energy_per_atom: f64,
    pub calls: Mutex<Vec<usize>>,
    pub fail: AtomicBool,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            energy_per_atom: -1.5,
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn failing() -> Self {
        let oracle = Self::new();
        oracle.fail.store(true, Ordering::SeqCst);
        oracle
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Oracle for MockOracle {
    fn compute(&self, config: &Configuration) -> Result<GroundTruth> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("SCF did not converge");
        }
        self.calls.lock().push(config.len());
        let mut truth = Efs::zeros(config.len());
        truth.energy = self.energy_per_atom * config.len() as f64;
        Ok(truth)
    }

    fn name(&self) -> &str {
        "Mock Oracle"
    }
}

/// Artifact written by [`ScriptedModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedArtifact {
    pub records: usize,
    pub sparse: usize,
}

/// Surrogate whose per-atom scores are scripted by the test.
///
/// Each `predict_local_variances` call pops the next score vector from the script and
/// converts it to variances; an empty script yields all-zero scores.
#[derive(Serialize, Deserialize)]
pub struct ScriptedModel {
    descriptors: DescriptorSet,
    records: Vec<TrainingRecord>,
    sparse: Vec<(usize, usize)>,
    fitted: bool,
    #[serde(skip)]
    pub script: Arc<Mutex<VecDeque<Vec<f64>>>>,
    #[serde(skip)]
    pub fail_refit: Arc<AtomicBool>,
    #[serde(skip)]
    pub fail_likelihood: Arc<AtomicBool>,
}

impl ScriptedModel {
    pub fn new(n_species: usize) -> Self {
        let descriptors = DescriptorSet::new(n_species, vec![RadialBasis::new(4, 3.0)])
            .expect("valid descriptor set");
        Self {
            descriptors,
            records: Vec::new(),
            sparse: Vec::new(),
            fitted: false,
            script: Arc::default(),
            fail_refit: Arc::default(),
            fail_likelihood: Arc::default(),
        }
    }

    /// Queues scores for the next steady steps.
    pub fn push_scores(&self, scores: Vec<f64>) {
        self.script.lock().push_back(scores);
    }

    pub fn sparse_points(&self) -> &[(usize, usize)] {
        &self.sparse
    }

    fn check_record(&self, record: usize) -> Result<&TrainingRecord, ModelError> {
        self.records
            .get(record)
            .ok_or_else(|| ModelError::InvalidReference(format!("record {}", record)))
    }
}

impl SurrogateModel for ScriptedModel {
    type Artifact = ScriptedArtifact;

    fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    fn hyperparameters(&self) -> Vec<f64> {
        vec![SCRIPTED_SIGNAL]
    }

    fn hyperparameter_names(&self) -> &'static [&'static str] {
        &["signal"]
    }

    fn signal_std(&self) -> f64 {
        SCRIPTED_SIGNAL
    }

    fn set_hyperparameters(&mut self, _values: &[f64]) -> Result<(), ModelError> {
        Ok(())
    }

    fn training_records(&self) -> &[TrainingRecord] {
        &self.records
    }

    fn sparse_count(&self) -> usize {
        self.sparse.len()
    }

    fn add_training_record(&mut self, record: TrainingRecord) -> Result<usize, ModelError> {
        self.fitted = false;
        self.records.push(record);
        Ok(self.records.len() - 1)
    }

    fn add_random_environments(
        &mut self,
        record: usize,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, ModelError> {
        let n = self.check_record(record)?.configuration.len();
        let mut atoms = sample(rng, n, count.min(n)).into_vec();
        atoms.sort_unstable();
        self.sparse.extend(atoms.iter().map(|&a| (record, a)));
        self.fitted = false;
        Ok(atoms)
    }

    fn add_specific_environments(&mut self, record: usize, atoms: &[usize]) -> Result<usize, ModelError> {
        let n = self.check_record(record)?.configuration.len();
        if let Some(&bad) = atoms.iter().find(|&&a| a >= n) {
            return Err(ModelError::InvalidReference(format!("atom {}", bad)));
        }
        self.sparse.extend(atoms.iter().map(|&a| (record, a)));
        self.fitted = false;
        Ok(atoms.len())
    }

    fn refit(&mut self) -> Result<(), ModelError> {
        if self.fail_refit.load(Ordering::SeqCst) {
            return Err(ModelError::Factorization("scripted failure"));
        }
        self.fitted = true;
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn predict_local_variances(&self, config: &Configuration) -> Result<Vec<f64>, ModelError> {
        let scores = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![0.0; config.len()]);
        Ok(scores.iter().map(|s| (s * SCRIPTED_SIGNAL).powi(2)).collect())
    }

    fn predict_efs(&self, config: &Configuration) -> Result<EfsPrediction, ModelError> {
        Ok(EfsPrediction {
            mean: Efs::zeros(config.len()),
            variance: Efs::zeros(config.len()),
        })
    }

    fn likelihood(&self) -> Result<Likelihood, ModelError> {
        if self.fail_likelihood.load(Ordering::SeqCst) {
            return Err(ModelError::Numerical("scripted likelihood failure".into()));
        }
        Ok(Likelihood {
            value: 0.0,
            gradient: vec![0.0],
        })
    }

    fn export(&self) -> Result<Self::Artifact, ModelError> {
        Ok(ScriptedArtifact {
            records: self.records.len(),
            sparse: self.sparse.len(),
        })
    }
}

pub fn argon() -> Vec<Species> {
    vec![Species::new("Ar", 18, 39.948)]
}

pub fn argon_krypton() -> Vec<Species> {
    vec![Species::new("Ar", 18, 39.948), Species::new("Kr", 36, 83.798)]
}

/// Four atoms in a 6 A cubic cell with a 3 A cutoff.
pub fn small_config() -> Configuration {
    let positions = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.5, 0.2, 0.1),
        Point3::new(0.3, 1.6, 0.0),
        Point3::new(3.0, 3.0, 3.0),
    ];
    Configuration::new(
        positions,
        vec![0; 4],
        Lattice::cubic(6.0).expect("cubic cell"),
        3.0,
    )
    .expect("valid configuration")
}

/// Slightly rattled two-species fcc crystal, deterministic.
pub fn rattled_fcc(cells: usize, amplitude: f64, cutoff: f64) -> Configuration {
    let base = Configuration::fcc(5.4, cells, [0, 0, 1, 1], cutoff).expect("fcc crystal");
    let positions = base
        .positions()
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let k = i as f64;
            p + Vector3::new((1.3 * k).sin(), (2.1 * k).cos(), (0.7 * k + 0.4).sin()) * amplitude
        })
        .collect();
    Configuration::new(positions, base.species().to_vec(), base.lattice().clone(), cutoff)
        .expect("rattled crystal")
}

/// Lennard-Jones oracle for the species of [`argon_krypton`].
pub fn lj_argon_krypton() -> LennardJones {
    LennardJones::new(
        &[
            PairParams { epsilon: 0.0103, sigma: 3.405 },
            PairParams { epsilon: 0.0141, sigma: 3.65 },
        ],
        6.0,
    )
}

/// Full energy, force and stress labels computed by `oracle`.
pub fn labels_from(oracle: &dyn Oracle, config: &Configuration) -> Labels {
    let truth = oracle.compute(config).expect("oracle labels");
    Labels {
        energy: Some(truth.energy),
        forces: Some(truth.forces),
        stress: Some(truth.stress),
    }
}
