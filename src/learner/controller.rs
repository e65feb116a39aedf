//! The on-the-fly controller: one decision per simulation step.
//!
//! The first call (no oracle calls yet) always queries the oracle and seeds the model
//! with the full configuration plus a random sample of its environments. Every later
//! call scores the per-atom uncertainty and only queries when the worst atom exceeds the
//! call threshold. Every successful model update is followed by a checkpoint, so the
//! engine can reload the potential and the run can be resumed.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::chemistry::EnergyCorrection;
use crate::core::domain::{Configuration, Efs, Labels, Species, TrainingRecord};
use crate::engine::oracle::{FileNamer, GroundTruth, Oracle, OracleAdapter};
use crate::errors::{error_chain, OtfError};
use crate::io::extxyz;
use crate::learner::checkpoint::{CheckpointHeader, CheckpointManager};
use crate::learner::hooks::{EveryNCalls, NeverOptimize, NoopHook, OptimizationSchedule, PostUpdateHook};
use crate::learner::params::LearnerParams;
use crate::learner::policy::{self, Decision};
use crate::learner::runlog::RunLog;
use crate::learner::telemetry::TelemetrySink;
use crate::learner::StepMetrics;
use crate::md::{SimulationEngine, Thermo};
use crate::model::optimizer::{optimize_hyperparameters, OptimizationReport};
use crate::model::{EfsPrediction, SurrogateModel};

/// Source tag written into every checkpoint header.
pub const CHECKPOINT_SOURCE: &str = "otf_learner";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Bootstrap,
    Steady,
}

/// Counters persisted with every resume artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Number of successful oracle calls. Never decreases.
    pub dft_calls: u64,
    /// Step of the most recent oracle call.
    pub last_dft_call: Option<u64>,
    /// Number of checkpoints written.
    pub revision: u64,
    pub run_id: Uuid,
}

impl ControllerState {
    pub fn new() -> Self {
        Self {
            dft_calls: 0,
            last_dft_call: None,
            revision: 0,
            run_id: Uuid::new_v4(),
        }
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Bootstrap,
    Idle,
    Query,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: u64,
    pub action: StepAction,
    /// Policy result; `None` on the bootstrap step.
    pub decision: Option<Decision>,
    /// Atoms whose environments entered the sparse set.
    pub atoms_added: Vec<usize>,
    pub optimization: Option<OptimizationReport>,
    /// Fresh checkpoint for the engine to reload: the model changed, or a write left
    /// pending by an earlier step went through.
    pub checkpoint: Option<PathBuf>,
}

impl StepOutcome {
    pub fn updated(&self) -> bool {
        self.checkpoint.is_some()
    }
}

pub struct OtfControllerBuilder<M> {
    model: M,
    oracle: Arc<dyn Oracle>,
    species: Vec<Species>,
    params: LearnerParams,
    schedule: Option<Box<dyn OptimizationSchedule>>,
    hook: Box<dyn PostUpdateHook>,
    telemetry: Vec<Box<dyn TelemetrySink>>,
    oracle_dump: Option<FileNamer>,
    uncertainty_dump: Option<FileNamer>,
    run_log: Option<RunLog>,
    resume_from: Option<PathBuf>,
}

impl<M> OtfControllerBuilder<M>
where
    M: SurrogateModel + Serialize + DeserializeOwned,
{
    pub fn new(model: M, oracle: Arc<dyn Oracle>, species: Vec<Species>) -> Self {
        Self {
            model,
            oracle,
            species,
            params: LearnerParams::default(),
            schedule: None,
            hook: Box::new(NoopHook),
            telemetry: Vec::new(),
            oracle_dump: None,
            uncertainty_dump: None,
            run_log: None,
            resume_from: None,
        }
    }

    pub fn params(mut self, params: LearnerParams) -> Self {
        self.params = params;
        self
    }

    /// Overrides the schedule derived from `optimize_every`.
    pub fn schedule(mut self, schedule: impl OptimizationSchedule + 'static) -> Self {
        self.schedule = Some(Box::new(schedule));
        self
    }

    pub fn post_update(mut self, hook: impl PostUpdateHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    pub fn telemetry(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.telemetry.push(Box::new(sink));
        self
    }

    /// Names the extended XYZ file written for every oracle query.
    pub fn oracle_dump(mut self, namer: FileNamer) -> Self {
        self.oracle_dump = Some(namer);
        self
    }

    /// Names the extended XYZ file with per-atom scores written every steady step.
    pub fn uncertainty_dump(mut self, namer: FileNamer) -> Self {
        self.uncertainty_dump = Some(namer);
        self
    }

    /// Uses an already opened run log instead of `params.log_path`.
    pub fn run_log(mut self, log: RunLog) -> Self {
        self.run_log = Some(log);
        self
    }

    /// Restores model and counters from a resume artifact instead of starting fresh.
    pub fn resume_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.resume_from = Some(path.into());
        self
    }

    pub fn build(self) -> Result<OtfController<M>, OtfError> {
        let mut log = match self.run_log {
            Some(log) => log,
            None => match &self.params.log_path {
                Some(path) => RunLog::open(path)?,
                None => RunLog::facade_only(),
            },
        };

        let (mut model, state) = match &self.resume_from {
            Some(path) => {
                let resumed = CheckpointManager::load_resume::<M>(path)?;
                log.info(format!(
                    "Resumed run {} from {} at {} oracle calls (revision {})",
                    resumed.state.run_id,
                    path.display(),
                    resumed.state.dft_calls,
                    resumed.state.revision
                ));
                (resumed.model, resumed.state)
            }
            None => (self.model, ControllerState::new()),
        };

        let n_species = model.descriptors().n_species();
        let correction = validate(&self.params, &self.species, &model, n_species)?;

        if state.dft_calls > 0 && !model.is_fitted() {
            model.refit()?;
        }

        let schedule: Box<dyn OptimizationSchedule> = match (self.schedule, self.params.optimize_every) {
            (Some(s), _) => s,
            (None, Some(every)) => {
                let mut s = EveryNCalls::new(every);
                s.until = self.params.optimize_until;
                Box::new(s)
            }
            (None, None) => Box::new(NeverOptimize),
        };

        let mut oracle = OracleAdapter::new(self.oracle, self.species.clone());
        if let Some(namer) = self.oracle_dump {
            oracle = oracle.with_dump(namer);
        }

        let mut checkpoints = CheckpointManager::new(&self.params.model_path);
        if let Some(path) = &self.params.resume_path {
            checkpoints = checkpoints.with_resume_path(path);
        }

        let resumed = self.resume_from.is_some();
        let phase = if state.dft_calls > 0 {
            Phase::Steady
        } else {
            Phase::Uninitialized
        };

        log.info(format!(
            "Controller ready: run {}, oracle {}, call threshold {}, add threshold {}",
            state.run_id,
            oracle.name(),
            self.params.call_threshold,
            self.params.add_threshold
        ));

        Ok(OtfController {
            model,
            oracle,
            species: self.species,
            params: self.params,
            correction,
            state,
            phase,
            needs_refit: false,
            needs_persist: false,
            reload_pending: resumed,
            checkpoints,
            schedule,
            hook: self.hook,
            telemetry: self.telemetry,
            uncertainty_dump: self.uncertainty_dump,
            log,
        })
    }
}

/// Eager consistency checks; returns the energy correction table.
fn validate<M: SurrogateModel>(
    params: &LearnerParams,
    species: &[Species],
    model: &M,
    n_species: usize,
) -> Result<EnergyCorrection, OtfError> {
    let (call, add) = (params.call_threshold, params.add_threshold);
    if !(call.is_finite() && add.is_finite() && call >= 0.0 && add >= 0.0) {
        return Err(OtfError::config(format!(
            "thresholds must be finite and non-negative (call {}, add {})",
            call, add
        )));
    }
    if call < add {
        return Err(OtfError::config(format!(
            "call threshold {} is below add threshold {}",
            call, add
        )));
    }
    if !(params.train_energy || params.train_forces || params.train_stress) {
        return Err(OtfError::config("at least one of energy, force or stress training must be enabled"));
    }
    if params.initial_environments == 0 {
        return Err(OtfError::config("initial_environments must be positive"));
    }
    if species.len() != n_species {
        return Err(OtfError::config(format!(
            "species table has {} entries but the model describes {} species",
            species.len(),
            n_species
        )));
    }
    params
        .optimizer
        .validate(model.hyperparameters().len())
        .map_err(|e| OtfError::config(format!("optimizer: {}", e)))?;
    if params.optimize_every == Some(0) {
        return Err(OtfError::config("optimize_every must be positive"));
    }

    match &params.energy_correction {
        None => Ok(EnergyCorrection::zeros(n_species)),
        Some(offsets) if offsets.len() != n_species => Err(OtfError::config(format!(
            "energy correction has {} entries for {} species",
            offsets.len(),
            n_species
        ))),
        Some(offsets) if offsets.iter().any(|o| !o.is_finite()) => {
            Err(OtfError::config("energy correction contains non-finite values"))
        }
        Some(offsets) => Ok(EnergyCorrection::new(offsets.clone())),
    }
}

pub struct OtfController<M: SurrogateModel> {
    model: M,
    oracle: OracleAdapter,
    species: Vec<Species>,
    params: LearnerParams,
    correction: EnergyCorrection,
    state: ControllerState,
    phase: Phase,
    /// Set while a training-set mutation is in flight; a failed update leaves it set so
    /// the next step refits before trusting the model.
    needs_refit: bool,
    /// Set from the moment an oracle call is committed until its checkpoint is written.
    needs_persist: bool,
    /// A resumed controller has not handed its potential to the engine yet.
    reload_pending: bool,
    checkpoints: CheckpointManager,
    schedule: Box<dyn OptimizationSchedule>,
    hook: Box<dyn PostUpdateHook>,
    telemetry: Vec<Box<dyn TelemetrySink>>,
    uncertainty_dump: Option<FileNamer>,
    log: RunLog,
}

impl<M> OtfController<M>
where
    M: SurrogateModel + Serialize + DeserializeOwned,
{
    pub fn builder(model: M, oracle: Arc<dyn Oracle>, species: Vec<Species>) -> OtfControllerBuilder<M> {
        OtfControllerBuilder::new(model, oracle, species)
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn params(&self) -> &LearnerParams {
        &self.params
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn model_path(&self) -> &Path {
        self.checkpoints.model_path()
    }

    /// Processes one simulation step. Errors are logged with their cause chain and
    /// returned unchanged.
    pub fn step(
        &mut self,
        config: &Configuration,
        step: u64,
        thermo: Option<&Thermo>,
    ) -> Result<StepOutcome, OtfError> {
        let result = if self.state.dft_calls == 0 {
            self.bootstrap(config, step, thermo)
        } else {
            self.steady(config, step, thermo)
        };
        if let Err(e) = &result {
            self.log.error(&format!("step {} failed", step), e);
        }
        result
    }

    /// Snapshots the engine, runs [`step`](Self::step) and hands a refreshed potential
    /// back to the engine. After a resume the first call hands over the restored
    /// potential even when the step itself changes nothing.
    pub fn on_engine_step<E: SimulationEngine + ?Sized>(&mut self, engine: &mut E) -> Result<StepOutcome, OtfError> {
        let config = engine.snapshot().map_err(|e| self.engine_error("snapshot", e))?;
        let thermo = engine.thermo();
        let outcome = self.step(&config, engine.step_index(), thermo.as_ref())?;

        let reload = match &outcome.checkpoint {
            Some(path) => Some(path.clone()),
            None if self.reload_pending => Some(self.restored_checkpoint()?),
            None => None,
        };
        if let Some(path) = reload {
            engine
                .reload_potential(&path)
                .map_err(|e| self.engine_error("potential reload", e))?;
            self.reload_pending = false;
        }
        Ok(outcome)
    }

    /// Re-exports the resumed model to the checkpoint path.
    fn restored_checkpoint(&mut self) -> Result<PathBuf, OtfError> {
        let path = self.checkpoints.model_path().to_path_buf();
        self.save_model(&path)?;
        self.log.info(format!(
            "Restored potential (revision {}) written to {}",
            self.state.revision,
            path.display()
        ));
        Ok(path)
    }

    fn engine_error(&mut self, what: &str, e: anyhow::Error) -> OtfError {
        let err = OtfError::engine(e);
        self.log.error(&format!("engine {} failed", what), &err);
        err
    }

    /// Writes the current mapped potential to an arbitrary path.
    pub fn save_model(&self, path: &Path) -> Result<(), OtfError> {
        let artifact = self.model.export()?;
        CheckpointManager::new(path).save_model(CheckpointHeader::new(CHECKPOINT_SOURCE, &self.state), &artifact)?;
        Ok(())
    }

    fn bootstrap(&mut self, config: &Configuration, step: u64, thermo: Option<&Thermo>) -> Result<StepOutcome, OtfError> {
        self.phase = Phase::Bootstrap;
        self.log.info(format!("Step {}: initial step, calling oracle", step));

        let truth = self.query_oracle(config, step)?;
        let record = self.training_record(config, &truth, step);

        self.needs_refit = true;
        let index = self.model.add_training_record(record)?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed ^ self.state.dft_calls);
        let added = self
            .model
            .add_random_environments(index, self.params.initial_environments, &mut rng)?;
        self.model.refit()?;
        self.needs_refit = false;

        self.commit_call(step);
        self.log.info(format!("n_added: {}", added.len()));

        let checkpoint = self.persist()?;
        self.hook.after_update(&self.state, step);
        self.phase = Phase::Steady;

        let metrics = StepMetrics {
            step,
            dft_calls: self.state.dft_calls,
            called: true,
            n_added: Some(added.len()),
            thermo: thermo.copied(),
            hyperparameters: self.model.hyperparameters(),
            ..Default::default()
        };
        self.emit(&metrics);

        Ok(StepOutcome {
            step,
            action: StepAction::Bootstrap,
            decision: None,
            atoms_added: added,
            optimization: None,
            checkpoint: Some(checkpoint),
        })
    }

    fn steady(&mut self, config: &Configuration, step: u64, thermo: Option<&Thermo>) -> Result<StepOutcome, OtfError> {
        self.phase = Phase::Steady;
        self.log.info(format!("Step {}", step));

        if self.needs_refit {
            self.log.warn("model was left inconsistent by a failed update, refitting");
            self.model.refit()?;
            self.needs_refit = false;
        }

        let mut pending = None;
        if self.needs_persist {
            self.log.warn("checkpoint of the last update was not written, retrying");
            pending = Some(self.persist()?);
            self.hook.after_update(&self.state, step);
        }

        let variances = self.model.predict_local_variances(config)?;
        let decision = policy::evaluate(
            &variances,
            self.model.signal_std(),
            self.params.call_threshold,
            self.params.add_threshold,
        );
        self.dump_uncertainty(config, &decision.scores, step);
        self.log.info(format!("Max uncertainty: {}", decision.max_score));

        let mut metrics = StepMetrics {
            step,
            max_uncertainty: Some(decision.max_score),
            thermo: thermo.copied(),
            histogram: policy::histogram(
                &decision.scores,
                self.params.histogram_bins,
                4.0 * self.params.call_threshold,
            ),
            ..Default::default()
        };

        if !decision.should_query {
            metrics.dft_calls = self.state.dft_calls;
            metrics.hyperparameters = self.model.hyperparameters();
            self.emit(&metrics);
            return Ok(StepOutcome {
                step,
                action: StepAction::Idle,
                decision: Some(decision),
                atoms_added: Vec::new(),
                optimization: None,
                checkpoint: pending,
            });
        }

        let prediction = self.model.predict_efs(config)?;
        let max_force_std = prediction.max_force_std();
        self.log.info(format!("Max force uncertainty: {}", max_force_std));
        self.log.info(format!("Oracle call #{}", self.state.dft_calls + 1));

        let truth = self.query_oracle(config, step)?;
        let corrected_energy = self.correction.apply(truth.energy, config.species());
        let record = self.training_record(config, &truth, step);

        self.needs_refit = true;
        let index = self.model.add_training_record(record)?;
        let added = self.model.add_specific_environments(index, &decision.atoms_to_add)?;
        self.model.refit()?;
        self.needs_refit = false;

        self.commit_call(step);

        let optimization = self.maybe_optimize(step, thermo)?;
        let checkpoint = self.persist()?;
        self.hook.after_update(&self.state, step);

        let (force_mae, energy_mae) = prediction_errors(&prediction, &truth, corrected_energy, config.len());
        self.log.info(format!("n_added: {}", added));
        self.log.info(format!("Fmae: {}", force_mae));
        self.log.info(format!("Emae: {}", energy_mae));

        metrics.dft_calls = self.state.dft_calls;
        metrics.called = true;
        metrics.max_force_uncertainty = Some(max_force_std);
        metrics.force_mae = Some(force_mae);
        metrics.energy_mae = Some(energy_mae);
        metrics.n_added = Some(added);
        metrics.hyperparameters = self.model.hyperparameters();
        self.emit(&metrics);

        Ok(StepOutcome {
            step,
            action: StepAction::Query,
            atoms_added: decision.atoms_to_add.clone(),
            decision: Some(decision),
            optimization,
            checkpoint: Some(checkpoint),
        })
    }

    fn query_oracle(&mut self, config: &Configuration, step: u64) -> Result<GroundTruth, OtfError> {
        self.oracle.query(config, step).map_err(|e| OtfError::oracle(step, e))
    }

    /// Attaches the enabled labels, with the energy correction applied.
    fn training_record(&self, config: &Configuration, truth: &GroundTruth, step: u64) -> TrainingRecord {
        let labels = Labels {
            energy: self
                .params
                .train_energy
                .then(|| self.correction.apply(truth.energy, config.species())),
            forces: self.params.train_forces.then(|| truth.forces.clone()),
            stress: self.params.train_stress.then_some(truth.stress),
        };
        TrainingRecord::new(config.clone(), labels, step)
    }

    fn commit_call(&mut self, step: u64) {
        self.state.dft_calls += 1;
        self.state.last_dft_call = Some(step);
        self.needs_persist = true;
    }

    /// Runs the scheduled optimization. A failed optimization is logged and the model
    /// goes back to its previous hyperparameters.
    fn maybe_optimize(&mut self, step: u64, thermo: Option<&Thermo>) -> Result<Option<OptimizationReport>, OtfError> {
        if !self.schedule.should_optimize(&self.state, thermo, step) {
            return Ok(None);
        }
        self.log.info("Optimizing hyperparameters");

        let start = self.model.hyperparameters();
        self.needs_refit = true;
        let report = match optimize_hyperparameters(&mut self.model, &self.params.optimizer) {
            Ok(report) => report,
            Err(e) => {
                self.log.warn(format!(
                    "hyperparameter optimization failed, keeping {}: {}",
                    format_named(self.model.hyperparameter_names(), &start),
                    error_chain(&e)
                ));
                if !self.model.is_fitted() || self.model.hyperparameters() != start {
                    self.model.set_hyperparameters(&start)?;
                }
                self.needs_refit = false;
                return Ok(None);
            }
        };
        self.needs_refit = false;

        self.log.info(format!(
            "Likelihood before/after: {:.4e} {:.4e}",
            report.likelihood_before, report.likelihood_after
        ));
        self.log.info(format!("Likelihood gradient: {:?}", report.gradient));
        self.log.info(format!(
            "Hyperparameters: {}",
            format_named(self.model.hyperparameter_names(), &report.hyperparameters)
        ));
        if !report.converged {
            self.log.warn(format!(
                "optimizer did not converge in {} iterations, keeping the last iterate",
                report.iterations
            ));
        }
        Ok(Some(report))
    }

    /// Writes the mapped potential and, if configured, the resume artifact.
    fn persist(&mut self) -> Result<PathBuf, OtfError> {
        let mut next = self.state.clone();
        next.revision += 1;

        let artifact = self.model.export()?;
        let path = self
            .checkpoints
            .save_model(CheckpointHeader::new(CHECKPOINT_SOURCE, &next), &artifact)?
            .to_path_buf();
        self.checkpoints
            .save_resume(CheckpointHeader::new(CHECKPOINT_SOURCE, &next), &next, &self.model)?;

        self.state = next;
        self.needs_persist = false;
        self.log.info(format!(
            "Checkpoint revision {} written to {}",
            self.state.revision,
            path.display()
        ));
        Ok(path)
    }

    fn dump_uncertainty(&mut self, config: &Configuration, scores: &[f64], step: u64) {
        let Some(namer) = &self.uncertainty_dump else {
            return;
        };
        let path = namer(step);
        let frame = extxyz::Frame::new(config, &self.species).with_scalar("uncertainty", scores);
        if let Err(e) = extxyz::write_frame(&path, &frame) {
            self.log.warn(format!("uncertainty dump {} failed: {:#}", path.display(), e));
        }
    }

    fn emit(&mut self, metrics: &StepMetrics) {
        for sink in &mut self.telemetry {
            if let Err(e) = sink.record(metrics) {
                log::warn!(target: "otf", "telemetry sink failed: {:#}", e);
            }
        }
    }
}

/// Mean absolute force error and per-atom absolute energy error.
fn prediction_errors(prediction: &EfsPrediction, truth: &Efs, corrected_energy: f64, n_atoms: usize) -> (f64, f64) {
    let components = 3 * truth.forces.len();
    let force_mae = if components == 0 {
        0.0
    } else {
        truth
            .forces
            .iter()
            .zip(&prediction.mean.forces)
            .map(|(t, p)| (t - p).abs().sum())
            .sum::<f64>()
            / components as f64
    };
    let energy_mae = (corrected_energy - prediction.mean.energy).abs() / n_atoms.max(1) as f64;
    (force_mae, energy_mae)
}

fn format_named(names: &[&str], values: &[f64]) -> String {
    names
        .iter()
        .zip(values)
        .map(|(n, v)| format!("{}={:.5e}", n, v))
        .collect::<Vec<_>>()
        .join(", ")
}
