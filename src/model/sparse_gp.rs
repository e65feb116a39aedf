//! Sparse Gaussian process over atomic environments (DTC approximation).
//!
//! Training labels are total energies, force components and stress components of whole
//! configurations; the latent function is the local energy of one environment. Kernel
//! blocks are cached at unit signal so hyperparameter sweeps only redo the small
//! `m x m` algebra and one `n x m` product.

use nalgebra::{Cholesky, DMatrix, DVector};
use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::core::domain::{Configuration, Efs, Labels, TrainingRecord};
use crate::errors::ModelError;
use crate::model::descriptor::{accumulate_efs, DescriptorSet, Environment};
use crate::model::kernel;
use crate::model::mapping::MappedPotential;
use crate::model::{EfsPrediction, Likelihood, SurrogateModel};

pub const HYPERPARAMETER_NAMES: [&str; 4] = ["signal", "energy_noise", "force_noise", "stress_noise"];

const DEFAULT_JITTER: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub signal: f64,
    pub energy_noise: f64,
    pub force_noise: f64,
    pub stress_noise: f64,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            signal: 2.0,
            energy_noise: 0.05,
            force_noise: 0.05,
            stress_noise: 0.005,
        }
    }
}

impl Hyperparameters {
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.signal, self.energy_noise, self.force_noise, self.stress_noise]
    }

    pub fn from_slice(values: &[f64]) -> Result<Self, ModelError> {
        if values.len() != HYPERPARAMETER_NAMES.len() {
            return Err(ModelError::Hyperparameters(format!(
                "expected {} values, got {}",
                HYPERPARAMETER_NAMES.len(),
                values.len()
            )));
        }
        if let Some((name, v)) = HYPERPARAMETER_NAMES
            .iter()
            .zip(values)
            .find(|(_, v)| !(v.is_finite() && **v > 0.0))
        {
            return Err(ModelError::Hyperparameters(format!("{} = {}", name, v)));
        }
        Ok(Self {
            signal: values[0],
            energy_noise: values[1],
            force_noise: values[2],
            stress_noise: values[3],
        })
    }

    fn noise(&self, kind: LabelKind) -> f64 {
        match kind {
            LabelKind::Energy => self.energy_noise,
            LabelKind::Force => self.force_noise,
            LabelKind::Stress => self.stress_noise,
        }
    }
}

/// A sparse point: the unit descriptors of one atom of one training record.
#[derive(Debug, Clone)]
pub struct SparseEnvironment {
    pub record: usize,
    pub atom: usize,
    pub species: usize,
    pub units: Vec<DVector<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelKind {
    Energy,
    Force,
    Stress,
}

impl LabelKind {
    fn gradient_slot(self) -> usize {
        match self {
            LabelKind::Energy => 1,
            LabelKind::Force => 2,
            LabelKind::Stress => 3,
        }
    }
}

/// Signal-independent kernel blocks.
#[derive(Debug, Clone)]
struct KernelCache {
    /// Lower Cholesky factor of `K0_mm + jitter I`.
    l0: DMatrix<f64>,
    /// `L0^-1 K0_mn`, shape `m x n`.
    v: DMatrix<f64>,
    y: DVector<f64>,
    kinds: Vec<LabelKind>,
}

#[derive(Debug, Clone)]
struct Fit {
    l_mm: DMatrix<f64>,
    l_a: DMatrix<f64>,
    alpha: DVector<f64>,
    likelihood: Likelihood,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseGp {
    descriptors: DescriptorSet,
    hyperparameters: Hyperparameters,
    jitter: f64,
    records: Vec<TrainingRecord>,
    /// `(record, atom)` of every sparse point, in insertion order.
    sparse_keys: Vec<(usize, usize)>,
    #[serde(skip)]
    environments: Vec<SparseEnvironment>,
    #[serde(skip)]
    cache: Option<KernelCache>,
    #[serde(skip)]
    fit: Option<Fit>,
}

impl SparseGp {
    pub fn new(descriptors: DescriptorSet, hyperparameters: Hyperparameters) -> Self {
        Self {
            descriptors,
            hyperparameters,
            jitter: DEFAULT_JITTER,
            records: Vec::new(),
            sparse_keys: Vec::new(),
            environments: Vec::new(),
            cache: None,
            fit: None,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self.invalidate();
        self
    }

    pub fn params(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    pub fn sparse_environments(&self) -> &[SparseEnvironment] {
        &self.environments
    }

    fn invalidate(&mut self) {
        self.cache = None;
        self.fit = None;
    }

    /// Recomputes sparse descriptors from the stored records, e.g. after deserialization.
    fn ensure_environments(&mut self) -> Result<(), ModelError> {
        if self.environments.len() == self.sparse_keys.len() {
            return Ok(());
        }
        let mut by_record: BTreeMap<usize, Vec<Environment>> = BTreeMap::new();
        for &(record, _) in &self.sparse_keys {
            if !by_record.contains_key(&record) {
                let envs = self.descriptors.environments(&self.record(record)?.configuration)?;
                by_record.insert(record, envs);
            }
        }
        self.environments = self
            .sparse_keys
            .iter()
            .map(|&(record, atom)| {
                by_record
                    .get(&record)
                    .and_then(|envs| envs.get(atom))
                    .map(|env| sparse_from_env(record, env))
                    .ok_or_else(|| {
                        ModelError::InvalidReference(format!("atom {} of record {}", atom, record))
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(())
    }

    fn record(&self, index: usize) -> Result<&TrainingRecord, ModelError> {
        self.records
            .get(index)
            .ok_or_else(|| ModelError::InvalidReference(format!("record {}", index)))
    }

    fn is_sparse(&self, record: usize, atom: usize) -> bool {
        self.sparse_keys.contains(&(record, atom))
    }

    /// `K0` between every label component of `config` and every sparse point.
    /// Rows follow [`Efs::flatten`].
    fn label_kernels(&self, config: &Configuration) -> Result<DMatrix<f64>, ModelError> {
        let envs = self.descriptors.environments(config)?;
        let columns: Vec<Vec<f64>> = self
            .environments
            .par_iter()
            .map(|sp| {
                accumulate_efs(config, &envs, |env| {
                    (env.species == sp.species).then(|| kernel::kernel_with_grad(env, &sp.units))
                })
                .flatten()
            })
            .collect();
        let rows = 1 + 3 * config.len() + 6;
        Ok(DMatrix::from_fn(rows, columns.len(), |i, j| columns[j][i]))
    }

    fn build_cache(&self) -> Result<KernelCache, ModelError> {
        if self.records.is_empty() {
            return Err(ModelError::EmptyTrainingSet("no training records".into()));
        }
        if self.environments.is_empty() {
            return Err(ModelError::EmptyTrainingSet("no sparse environments".into()));
        }

        let m = self.environments.len();
        let mut k_mm = DMatrix::from_fn(m, m, |a, b| {
            let (ea, eb) = (&self.environments[a], &self.environments[b]);
            if ea.species == eb.species {
                kernel::kernel(&ea.units, &eb.units)
            } else {
                0.0
            }
        });
        for i in 0..m {
            k_mm[(i, i)] += self.jitter;
        }

        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut y = Vec::new();
        let mut kinds = Vec::new();
        for record in &self.records {
            let block = self.label_kernels(&record.configuration)?;
            for (row, value, kind) in label_rows(&record.labels, record.configuration.len()) {
                rows.push(block.row(row).iter().copied().collect());
                y.push(value);
                kinds.push(kind);
            }
        }
        if y.is_empty() {
            return Err(ModelError::EmptyTrainingSet("no labels".into()));
        }

        let n = y.len();
        let k_mn = DMatrix::from_fn(m, n, |j, i| rows[i][j]);
        let l0 = Cholesky::new(k_mm)
            .ok_or(ModelError::Factorization("sparse covariance"))?
            .l();
        let v = l0
            .solve_lower_triangular(&k_mn)
            .ok_or(ModelError::Factorization("sparse covariance"))?;

        Ok(KernelCache {
            l0,
            v,
            y: DVector::from_vec(y),
            kinds,
        })
    }
}

fn sparse_from_env(record: usize, env: &Environment) -> SparseEnvironment {
    SparseEnvironment {
        record,
        atom: env.atom,
        species: env.species,
        units: env.units(),
    }
}

/// `(row in the flattened label layout, value, kind)` for every present label.
fn label_rows(labels: &Labels, n_atoms: usize) -> Vec<(usize, f64, LabelKind)> {
    let mut out = Vec::new();
    if let Some(e) = labels.energy {
        out.push((0, e, LabelKind::Energy));
    }
    if let Some(forces) = &labels.forces {
        for (a, f) in forces.iter().enumerate() {
            for c in 0..3 {
                out.push((1 + 3 * a + c, f[c], LabelKind::Force));
            }
        }
    }
    if let Some(stress) = labels.stress {
        let base = 1 + 3 * n_atoms;
        for (c, s) in stress.iter().enumerate() {
            out.push((base + c, *s, LabelKind::Stress));
        }
    }
    out
}

/// DTC solve and log marginal likelihood with its analytic gradient.
///
/// With `U = s V^T`, `C = Lambda + U U^T`, `A = I + U^T Lambda^-1 U` (Woodbury).
fn solve(cache: &KernelCache, hyp: &Hyperparameters) -> Result<Fit, ModelError> {
    let s = hyp.signal;
    let n = cache.y.len();
    let m = cache.l0.nrows();

    let lam = DVector::from_iterator(
        n,
        cache.kinds.iter().map(|&k| {
            let sigma = hyp.noise(k);
            1.0 / (sigma * sigma)
        }),
    );

    let ut = &cache.v * s;
    let mut ut_lam = ut.clone();
    for (j, mut col) in ut_lam.column_iter_mut().enumerate() {
        col *= lam[j];
    }
    let g = &ut_lam * ut.transpose();
    let a = DMatrix::identity(m, m) + &g;
    let chol_a = Cholesky::new(a).ok_or(ModelError::Factorization("posterior precision"))?;

    let b = &ut_lam * &cache.y;
    let w = chol_a.solve(&b);
    let residual = &cache.y - ut.transpose() * &w;
    let alpha_c = residual.component_mul(&lam);

    let l_a = chol_a.l();
    let log_det_a: f64 = 2.0 * l_a.diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let log_det_lam: f64 = -lam.iter().map(|l| l.ln()).sum::<f64>();
    let fit_term = cache.y.dot(&alpha_c);
    let value = -0.5 * fit_term - 0.5 * (log_det_lam + log_det_a) - 0.5 * n as f64 * (2.0 * PI).ln();
    if !value.is_finite() {
        return Err(ModelError::Numerical("log marginal likelihood".into()));
    }

    let mut gradient = vec![0.0; HYPERPARAMETER_NAMES.len()];

    let a_inv_g = chol_a.solve(&g);
    let tr_g = g.trace();
    let tr_aig_g = a_inv_g.component_mul(&g).sum();
    gradient[0] = (w.norm_squared() - tr_g + tr_aig_g) / s;

    let a_inv_ut = chol_a.solve(&ut);
    for (i, &kind) in cache.kinds.iter().enumerate() {
        let quad = ut.column(i).dot(&a_inv_ut.column(i));
        let c_inv_ii = lam[i] - lam[i] * lam[i] * quad;
        gradient[kind.gradient_slot()] += alpha_c[i] * alpha_c[i] - c_inv_ii;
    }
    for kind in [LabelKind::Energy, LabelKind::Force, LabelKind::Stress] {
        gradient[kind.gradient_slot()] *= hyp.noise(kind);
    }

    let l_mm = &cache.l0 * s;
    let alpha = cache
        .l0
        .tr_solve_lower_triangular(&w)
        .ok_or(ModelError::Factorization("sparse covariance"))?
        / s;

    Ok(Fit {
        l_mm,
        l_a,
        alpha,
        likelihood: Likelihood { value, gradient },
    })
}

impl SurrogateModel for SparseGp {
    type Artifact = MappedPotential;

    fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    fn hyperparameters(&self) -> Vec<f64> {
        self.hyperparameters.to_vec()
    }

    fn hyperparameter_names(&self) -> &'static [&'static str] {
        &HYPERPARAMETER_NAMES
    }

    fn signal_std(&self) -> f64 {
        self.hyperparameters.signal
    }

    fn set_hyperparameters(&mut self, values: &[f64]) -> Result<(), ModelError> {
        let hyp = Hyperparameters::from_slice(values)?;
        if self.records.is_empty() {
            self.hyperparameters = hyp;
            self.fit = None;
            return Ok(());
        }
        self.ensure_environments()?;
        if self.cache.is_none() {
            self.cache = Some(self.build_cache()?);
        }
        let cache = self.cache.as_ref().ok_or(ModelError::Unfitted)?;
        let fit = solve(cache, &hyp)?;
        self.hyperparameters = hyp;
        self.fit = Some(fit);
        Ok(())
    }

    fn training_records(&self) -> &[TrainingRecord] {
        &self.records
    }

    fn sparse_count(&self) -> usize {
        self.sparse_keys.len()
    }

    fn add_training_record(&mut self, record: TrainingRecord) -> Result<usize, ModelError> {
        self.descriptors.check(&record.configuration)?;
        let labels = &record.labels;
        if labels.is_empty() {
            return Err(ModelError::InvalidReference("record carries no labels".into()));
        }
        if let Some(forces) = &labels.forces {
            if forces.len() != record.configuration.len() {
                return Err(ModelError::InvalidReference(format!(
                    "{} force rows for {} atoms",
                    forces.len(),
                    record.configuration.len()
                )));
            }
        }
        if label_rows(labels, record.configuration.len()).iter().any(|(_, v, _)| !v.is_finite()) {
            return Err(ModelError::Numerical("non-finite training label".into()));
        }
        self.ensure_environments()?;
        self.records.push(record);
        self.invalidate();
        Ok(self.records.len() - 1)
    }

    fn add_random_environments(
        &mut self,
        record: usize,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<usize>, ModelError> {
        self.ensure_environments()?;
        let envs = self.descriptors.environments(&self.record(record)?.configuration)?;
        let candidates: Vec<&Environment> = envs
            .iter()
            .filter(|env| !env.is_isolated() && !self.is_sparse(record, env.atom))
            .collect();

        let amount = count.min(candidates.len());
        let mut picked: Vec<usize> = rand::seq::index::sample(rng, candidates.len(), amount)
            .into_iter()
            .map(|i| candidates[i].atom)
            .collect();
        picked.sort_unstable();

        for &atom in &picked {
            self.sparse_keys.push((record, atom));
            self.environments.push(sparse_from_env(record, &envs[atom]));
        }
        if !picked.is_empty() {
            self.invalidate();
        }
        Ok(picked)
    }

    fn add_specific_environments(&mut self, record: usize, atoms: &[usize]) -> Result<usize, ModelError> {
        self.ensure_environments()?;
        let envs = self.descriptors.environments(&self.record(record)?.configuration)?;
        if let Some(&bad) = atoms.iter().find(|&&a| a >= envs.len()) {
            return Err(ModelError::InvalidReference(format!(
                "atom {} of record {} with {} atoms",
                bad,
                record,
                envs.len()
            )));
        }

        let mut added = 0;
        for &atom in atoms {
            if self.is_sparse(record, atom) {
                continue;
            }
            self.sparse_keys.push((record, atom));
            self.environments.push(sparse_from_env(record, &envs[atom]));
            added += 1;
        }
        if added > 0 {
            self.invalidate();
        }
        Ok(added)
    }

    fn refit(&mut self) -> Result<(), ModelError> {
        self.ensure_environments()?;
        if self.cache.is_none() {
            self.cache = Some(self.build_cache()?);
        }
        let cache = self.cache.as_ref().ok_or(ModelError::Unfitted)?;
        self.fit = Some(solve(cache, &self.hyperparameters)?);
        Ok(())
    }

    fn is_fitted(&self) -> bool {
        self.fit.is_some()
    }

    fn predict_local_variances(&self, config: &Configuration) -> Result<Vec<f64>, ModelError> {
        let fit = self.fit.as_ref().ok_or(ModelError::Unfitted)?;
        let envs = self.descriptors.environments(config)?;
        let s2 = self.hyperparameters.signal.powi(2);
        let m = self.environments.len();

        envs.par_iter()
            .map(|env| {
                let k = DVector::from_iterator(
                    m,
                    self.environments.iter().map(|sp| {
                        if sp.species == env.species {
                            s2 * kernel::kernel_env(env, &sp.units)
                        } else {
                            0.0
                        }
                    }),
                );
                let z = fit
                    .l_mm
                    .solve_lower_triangular(&k)
                    .ok_or(ModelError::Factorization("sparse covariance"))?;
                Ok(s2 * kernel::self_kernel(env) - z.norm_squared())
            })
            .collect()
    }

    fn predict_efs(&self, config: &Configuration) -> Result<EfsPrediction, ModelError> {
        let fit = self.fit.as_ref().ok_or(ModelError::Unfitted)?;
        let s2 = self.hyperparameters.signal.powi(2);
        let k_star = self.label_kernels(config)? * s2;

        let mean = &k_star * &fit.alpha;
        let z = fit
            .l_mm
            .solve_lower_triangular(&k_star.transpose())
            .ok_or(ModelError::Factorization("sparse covariance"))?;
        let z = fit
            .l_a
            .solve_lower_triangular(&z)
            .ok_or(ModelError::Factorization("posterior precision"))?;
        let variance: Vec<f64> = z.column_iter().map(|c| c.norm_squared()).collect();

        let n = config.len();
        let to_efs = |values: &[f64]| {
            Efs::from_flat(values, n).ok_or_else(|| ModelError::Numerical("prediction layout".into()))
        };
        Ok(EfsPrediction {
            mean: to_efs(mean.as_slice())?,
            variance: to_efs(&variance)?,
        })
    }

    fn likelihood(&self) -> Result<Likelihood, ModelError> {
        self.fit
            .as_ref()
            .map(|f| f.likelihood.clone())
            .ok_or(ModelError::Unfitted)
    }

    fn export(&self) -> Result<MappedPotential, ModelError> {
        let fit = self.fit.as_ref().ok_or(ModelError::Unfitted)?;
        MappedPotential::build(
            &self.descriptors,
            self.hyperparameters.signal,
            &self.environments,
            &fit.alpha,
            &fit.l_mm,
        )
    }
}
