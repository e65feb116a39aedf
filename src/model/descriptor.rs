//! Species-resolved radial-basis environment descriptors.
//!
//! For a center atom `i` and a radial basis with `K` functions, the raw descriptor has
//! one block of `K` entries per neighbor species:
//!
//! `d[s * K + k] = sum_{j in N(i), species(j) = s} g_k(r_ij)`,
//! `g_k(r) = exp(-(r - mu_k)^2 / (2 w^2)) * fc(r)`, `fc(r) = (cos(pi r / rc) + 1) / 2`.
//!
//! Kernels see the unit vector `d / |d|`; the norm is kept for back-propagation.

use nalgebra::{DVector, Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::core::domain::{voigt_from_tensor, Configuration, Efs};
use crate::core::spatial;
use crate::errors::ModelError;

const NORM_EPS: f64 = 1e-12;

/// Gaussian radial basis with a cosine cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadialBasis {
    pub n_radial: usize,
    pub cutoff: f64,
}

impl RadialBasis {
    pub fn new(n_radial: usize, cutoff: f64) -> Self {
        Self { n_radial, cutoff }
    }

    fn width(&self) -> f64 {
        self.cutoff / self.n_radial as f64
    }

    fn center(&self, k: usize) -> f64 {
        if self.n_radial == 1 {
            0.0
        } else {
            self.cutoff * k as f64 / (self.n_radial - 1) as f64
        }
    }

    /// Fills `values[k] = g_k(r)` and `derivs[k] = g_k'(r)`. Zero beyond the cutoff.
    pub fn evaluate(&self, r: f64, values: &mut [f64], derivs: &mut [f64]) {
        if r >= self.cutoff {
            values.iter_mut().for_each(|v| *v = 0.0);
            derivs.iter_mut().for_each(|v| *v = 0.0);
            return;
        }
        let w2 = self.width() * self.width();
        let arg = PI * r / self.cutoff;
        let fc = 0.5 * (arg.cos() + 1.0);
        let dfc = -0.5 * PI / self.cutoff * arg.sin();

        for k in 0..self.n_radial {
            let x = r - self.center(k);
            let gauss = (-0.5 * x * x / w2).exp();
            let dgauss = -x / w2 * gauss;
            values[k] = gauss * fc;
            derivs[k] = dgauss * fc + gauss * dfc;
        }
    }
}

/// The ordered descriptor specifications attached to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    n_species: usize,
    specs: Vec<RadialBasis>,
}

impl DescriptorSet {
    pub fn new(n_species: usize, specs: Vec<RadialBasis>) -> Result<Self, ModelError> {
        if n_species == 0 {
            return Err(ModelError::DescriptorMismatch("no species".into()));
        }
        if specs.is_empty() {
            return Err(ModelError::DescriptorMismatch("empty descriptor set".into()));
        }
        for (t, spec) in specs.iter().enumerate() {
            if spec.n_radial == 0 || !(spec.cutoff.is_finite() && spec.cutoff > 0.0) {
                return Err(ModelError::DescriptorMismatch(format!(
                    "descriptor {} needs n_radial > 0 and a positive cutoff",
                    t
                )));
            }
        }
        Ok(Self { n_species, specs })
    }

    pub fn n_species(&self) -> usize {
        self.n_species
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Length of the raw descriptor vector of block `t`.
    pub fn block_len(&self, t: usize) -> usize {
        self.n_species * self.specs[t].n_radial
    }

    pub fn max_cutoff(&self) -> f64 {
        self.specs.iter().map(|s| s.cutoff).fold(0.0, f64::max)
    }

    /// Checks that a configuration can be described by this set.
    pub fn check(&self, config: &Configuration) -> Result<(), ModelError> {
        if let Some(s) = config.max_species() {
            if s >= self.n_species {
                return Err(ModelError::DescriptorMismatch(format!(
                    "species label {} outside descriptor set of {} species",
                    s, self.n_species
                )));
            }
        }
        if self.max_cutoff() > config.cutoff() + 1e-12 {
            return Err(ModelError::DescriptorMismatch(format!(
                "descriptor cutoff {} exceeds configuration cutoff {}",
                self.max_cutoff(),
                config.cutoff()
            )));
        }
        Ok(())
    }

    /// Computes every atomic environment of `config` together with its gradients.
    pub fn environments(&self, config: &Configuration) -> Result<Vec<Environment>, ModelError> {
        self.check(config)?;
        let lists = spatial::neighbor_lists(config, self.max_cutoff());
        let species = config.species();

        let envs = lists
            .par_iter()
            .enumerate()
            .map(|(i, neighbors)| {
                let blocks = self
                    .specs
                    .iter()
                    .map(|spec| {
                        let k_len = spec.n_radial;
                        let mut raw = DVector::zeros(self.n_species * k_len);
                        let mut terms = Vec::new();
                        let mut values = vec![0.0; k_len];
                        let mut derivs = vec![0.0; k_len];

                        for nb in neighbors.iter().filter(|nb| nb.distance < spec.cutoff) {
                            spec.evaluate(nb.distance, &mut values, &mut derivs);
                            let offset = species[nb.neighbor] * k_len;
                            for k in 0..k_len {
                                raw[offset + k] += values[k];
                            }
                            terms.push(PairTerm {
                                neighbor: nb.neighbor,
                                delta: nb.delta,
                                distance: nb.distance,
                                offset,
                                dvalues: derivs.clone(),
                            });
                        }

                        let norm = raw.norm();
                        let unit = if norm > NORM_EPS { raw / norm } else { raw };
                        Block { unit, norm, terms }
                    })
                    .collect();

                Environment {
                    atom: i,
                    species: species[i],
                    blocks,
                }
            })
            .collect();

        Ok(envs)
    }
}

/// Contribution of one neighbor image to a descriptor block.
#[derive(Debug, Clone)]
pub struct PairTerm {
    pub neighbor: usize,
    pub delta: Vector3<f64>,
    pub distance: f64,
    /// Start of the neighbor-species segment inside the block.
    pub offset: usize,
    /// Radial derivatives g_k'(r) for this pair.
    pub dvalues: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub unit: DVector<f64>,
    pub norm: f64,
    pub terms: Vec<PairTerm>,
}

impl Block {
    pub fn is_empty(&self) -> bool {
        self.norm <= NORM_EPS
    }
}

/// The local environment of one atom, one block per descriptor.
#[derive(Debug, Clone)]
pub struct Environment {
    pub atom: usize,
    pub species: usize,
    pub blocks: Vec<Block>,
}

impl Environment {
    pub fn units(&self) -> Vec<DVector<f64>> {
        self.blocks.iter().map(|b| b.unit.clone()).collect()
    }

    pub fn is_isolated(&self) -> bool {
        self.blocks.iter().all(Block::is_empty)
    }
}

/// Sums a local energy model over all environments and back-propagates it to forces
/// and stress.
///
/// `local` returns `E_i` and `dE_i/d(unit_t)` for each block, or `None` when the
/// environment does not contribute. Stress follows -(1/V) dE/dstrain.
pub fn accumulate_efs<F>(config: &Configuration, envs: &[Environment], local: F) -> Efs
where
    F: Fn(&Environment) -> Option<(f64, Vec<DVector<f64>>)>,
{
    let mut efs = Efs::zeros(config.len());
    let mut virial = Matrix3::zeros();

    for env in envs {
        let Some((energy, grads)) = local(env) else {
            continue;
        };
        efs.energy += energy;

        for (block, g) in env.blocks.iter().zip(&grads) {
            if block.is_empty() {
                continue;
            }
            // d(unit)/d(raw) = (I - u u^T) / |raw|
            let proj = block.unit.dot(g);
            let g_raw = (g - &block.unit * proj) / block.norm;

            for term in &block.terms {
                let s: f64 = term
                    .dvalues
                    .iter()
                    .enumerate()
                    .map(|(k, dv)| g_raw[term.offset + k] * dv)
                    .sum();
                if s == 0.0 {
                    continue;
                }
                // dE/d(delta); delta = r_neighbor - r_center
                let v = term.delta * (s / term.distance);
                efs.forces[env.atom] += v;
                efs.forces[term.neighbor] -= v;
                virial += v * term.delta.transpose();
            }
        }
    }

    let volume = config.lattice().volume();
    efs.stress = voigt_from_tensor(&(-virial / volume));
    efs
}
