//! Mapping coefficients: the training-history-free form of a fitted sparse GP.
//!
//! With the power-2 dot-product kernel the GP mean per atom is a quadratic form in the
//! unit descriptors, and the local variance is a quadratic form in their outer-product
//! features. Both forms are stored per central species.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::domain::{Configuration, Efs};
use crate::errors::ModelError;
use crate::model::descriptor::{accumulate_efs, DescriptorSet};
use crate::model::kernel;
use crate::model::sparse_gp::SparseEnvironment;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedPotential {
    descriptors: DescriptorSet,
    signal: f64,
    /// `[species][block]`: `E_i = sum_t u_t^T B u_t`.
    energy_maps: Vec<Vec<DMatrix<f64>>>,
    /// `[species]`: variance reduction `phi^T Q phi` over quadratic features.
    variance_maps: Vec<DMatrix<f64>>,
}

impl MappedPotential {
    /// Builds the maps from a fitted GP: sparse points, weights `alpha` and the lower
    /// Cholesky factor of the (jittered) sparse covariance.
    pub(crate) fn build(
        descriptors: &DescriptorSet,
        signal: f64,
        sparse: &[SparseEnvironment],
        alpha: &DVector<f64>,
        l_mm: &DMatrix<f64>,
    ) -> Result<Self, ModelError> {
        let n_species = descriptors.n_species();
        let n_blocks = descriptors.len();
        let s2 = signal * signal;
        let scale = s2 / n_blocks as f64;

        let mut energy_maps: Vec<Vec<DMatrix<f64>>> = (0..n_species)
            .map(|_| {
                (0..n_blocks)
                    .map(|t| {
                        let d = descriptors.block_len(t);
                        DMatrix::zeros(d, d)
                    })
                    .collect()
            })
            .collect();

        for (m, sp) in sparse.iter().enumerate() {
            for (t, u) in sp.units.iter().enumerate() {
                energy_maps[sp.species][t] += (u * u.transpose()) * (scale * alpha[m]);
            }
        }

        let m = sparse.len();
        let l_inv = l_mm
            .solve_lower_triangular(&DMatrix::identity(m, m))
            .ok_or(ModelError::Factorization("sparse covariance inverse"))?;
        let k_inv = l_inv.transpose() * &l_inv;

        let block_lens: Vec<usize> = (0..n_blocks).map(|t| descriptors.block_len(t)).collect();
        let f_len = kernel::feature_len(&block_lens);

        let variance_maps = (0..n_species)
            .map(|s| {
                let idx: Vec<usize> = sparse
                    .iter()
                    .enumerate()
                    .filter(|(_, sp)| sp.species == s)
                    .map(|(i, _)| i)
                    .collect();
                if idx.is_empty() {
                    return DMatrix::zeros(f_len, f_len);
                }
                let mut phi = DMatrix::zeros(idx.len(), f_len);
                for (row, &i) in idx.iter().enumerate() {
                    let features = kernel::quadratic_features(&sparse[i].units);
                    phi.set_row(row, &features.transpose());
                }
                let k_inv_s = k_inv.select_rows(&idx).select_columns(&idx);
                (phi.transpose() * k_inv_s * &phi) * (s2 * s2)
            })
            .collect();

        Ok(Self {
            descriptors: descriptors.clone(),
            signal,
            energy_maps,
            variance_maps,
        })
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.descriptors
    }

    pub fn signal(&self) -> f64 {
        self.signal
    }

    /// Checks internal dimensions, e.g. after loading from disk.
    pub fn validate(&self) -> Result<(), ModelError> {
        let n_species = self.descriptors.n_species();
        let n_blocks = self.descriptors.len();
        let block_lens: Vec<usize> = (0..n_blocks).map(|t| self.descriptors.block_len(t)).collect();
        let f_len = kernel::feature_len(&block_lens);

        if !(self.signal.is_finite() && self.signal > 0.0) {
            return Err(ModelError::Hyperparameters(format!("signal {}", self.signal)));
        }
        if self.energy_maps.len() != n_species || self.variance_maps.len() != n_species {
            return Err(ModelError::DescriptorMismatch(
                "map count differs from species count".into(),
            ));
        }
        for maps in &self.energy_maps {
            if maps.len() != n_blocks
                || maps
                    .iter()
                    .zip(&block_lens)
                    .any(|(b, &d)| b.nrows() != d || b.ncols() != d)
            {
                return Err(ModelError::DescriptorMismatch("energy map shape".into()));
            }
        }
        if self
            .variance_maps
            .iter()
            .any(|q| q.nrows() != f_len || q.ncols() != f_len)
        {
            return Err(ModelError::DescriptorMismatch("variance map shape".into()));
        }
        Ok(())
    }

    /// Mean energy, forces and stress.
    pub fn predict(&self, config: &Configuration) -> Result<Efs, ModelError> {
        let envs = self.descriptors.environments(config)?;
        Ok(accumulate_efs(config, &envs, |env| {
            let maps = self.energy_maps.get(env.species)?;
            let mut energy = 0.0;
            let grads = env
                .blocks
                .iter()
                .zip(maps)
                .map(|(block, b)| {
                    let bu = b * &block.unit;
                    energy += block.unit.dot(&bu);
                    bu * 2.0
                })
                .collect();
            Some((energy, grads))
        }))
    }

    /// Per-atom variance of the local energy.
    pub fn local_variances(&self, config: &Configuration) -> Result<Vec<f64>, ModelError> {
        let envs = self.descriptors.environments(config)?;
        let s2 = self.signal * self.signal;
        Ok(envs
            .par_iter()
            .map(|env| {
                let k_self = s2 * kernel::self_kernel(env);
                match self.variance_maps.get(env.species) {
                    Some(q) => {
                        let phi = kernel::quadratic_features(&env.units());
                        k_self - phi.dot(&(q * &phi))
                    }
                    None => k_self,
                }
            })
            .collect())
    }

    /// Per-atom uncertainty scores, `sqrt(|variance|) / signal`.
    pub fn local_uncertainties(&self, config: &Configuration) -> Result<Vec<f64>, ModelError> {
        let variances = self.local_variances(config)?;
        Ok(crate::learner::policy::normalize(&variances, self.signal))
    }
}
