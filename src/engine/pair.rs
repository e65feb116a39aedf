use anyhow::{bail, Result};
use nalgebra::Matrix3;

use crate::core::chemistry::{PairParams, PairTable};
use crate::core::domain::{voigt_from_tensor, Configuration};
use crate::core::spatial;
use crate::engine::oracle::{GroundTruth, Oracle};

/// Closest approach accepted before a configuration is treated as collapsed, in A.
const MIN_SEPARATION: f64 = 0.5;

/// In-process Lennard-Jones oracle, energy-shifted to zero at the cutoff.
pub struct LennardJones {
    table: PairTable,
    cutoff: f64,
}

impl LennardJones {
    pub fn new(per_species: &[PairParams], cutoff: f64) -> Self {
        Self {
            table: PairTable::lorentz_berthelot(per_species),
            cutoff,
        }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Pair energy and dE/dr.
    #[inline]
    fn pair(&self, p: PairParams, r: f64) -> (f64, f64) {
        let lj = |r: f64| {
            let sr6 = (p.sigma / r).powi(6);
            4.0 * p.epsilon * (sr6 * sr6 - sr6)
        };
        let sr6 = (p.sigma / r).powi(6);
        let de_dr = -24.0 * p.epsilon * (2.0 * sr6 * sr6 - sr6) / r;
        (lj(r) - lj(self.cutoff), de_dr)
    }
}

impl Oracle for LennardJones {
    fn name(&self) -> &str {
        "Lennard-Jones"
    }

    fn compute(&self, config: &Configuration) -> Result<GroundTruth> {
        if let Some(s) = config.max_species() {
            if s >= self.table.num_species() {
                bail!("species label {} has no Lennard-Jones parameters", s);
            }
        }

        let species = config.species();
        let lists = spatial::neighbor_lists(config, self.cutoff);
        let mut truth = GroundTruth::zeros(config.len());
        let mut virial = Matrix3::zeros();

        // Full neighbor lists visit every pair twice; each visit carries half the pair.
        for (i, neighbors) in lists.iter().enumerate() {
            for nb in neighbors {
                if nb.distance < MIN_SEPARATION {
                    bail!("atoms {} and {} overlap", i, nb.neighbor);
                }
                let (e, de_dr) = self.pair(self.table.get(species[i], species[nb.neighbor]), nb.distance);
                truth.energy += 0.5 * e;
                let v = nb.delta * (0.5 * de_dr / nb.distance);
                truth.forces[i] += v;
                truth.forces[nb.neighbor] -= v;
                virial += v * nb.delta.transpose();
            }
        }

        truth.stress = voigt_from_tensor(&(-virial / config.lattice().volume()));
        Ok(truth)
    }
}
