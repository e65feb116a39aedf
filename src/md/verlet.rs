use anyhow::{bail, Context, Result};
use nalgebra::{Point3, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::path::Path;

use crate::core::domain::{Configuration, Efs, Lattice, Species};
use crate::learner::checkpoint::CheckpointManager;
use crate::md::{SimulationEngine, Thermo};
use crate::model::mapping::MappedPotential;

/// Boltzmann constant [eV/K].
pub const KB: f64 = 8.617_333_262e-5;
/// 1 amu * (A/fs)^2 in eV.
const MVV2E: f64 = 103.642_696_5;

/// NVE velocity-Verlet integrator in metal units (A, fs, amu, eV).
///
/// Runs ballistically until a potential is loaded.
pub struct VelocityVerlet {
    positions: Vec<Point3<f64>>,
    velocities: Vec<Vector3<f64>>,
    species: Vec<usize>,
    masses: Vec<f64>,
    lattice: Lattice,
    cutoff: f64,
    timestep: f64,
    step: u64,
    potential: Option<MappedPotential>,
    current: Option<Efs>,
}

impl VelocityVerlet {
    pub fn new(initial: &Configuration, species_table: &[Species], timestep: f64) -> Result<Self> {
        if !(timestep.is_finite() && timestep > 0.0) {
            bail!("timestep must be positive, got {}", timestep);
        }
        let masses = initial
            .species()
            .iter()
            .map(|&s| {
                species_table
                    .get(s)
                    .map(|sp| sp.mass)
                    .with_context(|| format!("species {} missing from the species table", s))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            positions: initial.positions().to_vec(),
            velocities: vec![Vector3::zeros(); initial.len()],
            species: initial.species().to_vec(),
            masses,
            lattice: initial.lattice().clone(),
            cutoff: initial.cutoff(),
            timestep,
            step: 0,
            potential: None,
            current: None,
        })
    }

    /// Draws Maxwell-Boltzmann velocities at `temperature` and removes the drift.
    pub fn with_temperature(mut self, temperature: f64, seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).context("unit normal distribution")?;

        for (v, &m) in self.velocities.iter_mut().zip(&self.masses) {
            let std = (KB * temperature.max(0.0) / (m * MVV2E)).sqrt();
            *v = Vector3::new(
                normal.sample(&mut rng),
                normal.sample(&mut rng),
                normal.sample(&mut rng),
            ) * std;
        }

        let total_mass: f64 = self.masses.iter().sum();
        if total_mass > 0.0 {
            let momentum: Vector3<f64> = self
                .velocities
                .iter()
                .zip(&self.masses)
                .map(|(v, m)| v * *m)
                .sum();
            let drift = momentum / total_mass;
            self.velocities.iter_mut().for_each(|v| *v -= drift);
        }
        Ok(self)
    }

    pub fn set_potential(&mut self, potential: MappedPotential) -> Result<()> {
        potential.validate().context("invalid mapped potential")?;
        self.potential = Some(potential);
        self.current = Some(self.evaluate()?);
        Ok(())
    }

    pub fn has_potential(&self) -> bool {
        self.potential.is_some()
    }

    fn configuration(&self) -> Result<Configuration> {
        Ok(Configuration::new(
            self.positions.clone(),
            self.species.clone(),
            self.lattice.clone(),
            self.cutoff,
        )?)
    }

    fn evaluate(&self) -> Result<Efs> {
        let config = self.configuration()?;
        match &self.potential {
            Some(p) => Ok(p.predict(&config)?),
            None => Ok(Efs::zeros(config.len())),
        }
    }

    pub fn kinetic_energy(&self) -> f64 {
        0.5 * MVV2E
            * self
                .velocities
                .iter()
                .zip(&self.masses)
                .map(|(v, m)| m * v.norm_squared())
                .sum::<f64>()
    }

    pub fn temperature(&self) -> f64 {
        let dof = 3 * self.positions.len();
        if dof == 0 {
            return 0.0;
        }
        2.0 * self.kinetic_energy() / (dof as f64 * KB)
    }

    /// One velocity-Verlet step.
    pub fn advance(&mut self) -> Result<()> {
        let dt = self.timestep;
        let forces = match &self.current {
            Some(efs) => efs.forces.clone(),
            None => vec![Vector3::zeros(); self.positions.len()],
        };

        for i in 0..self.positions.len() {
            let accel = forces[i] / (self.masses[i] * MVV2E);
            self.velocities[i] += accel * (0.5 * dt);
            self.positions[i] += self.velocities[i] * dt;
        }
        self.wrap_positions();

        let efs = self.evaluate()?;
        for i in 0..self.positions.len() {
            let accel = efs.forces[i] / (self.masses[i] * MVV2E);
            self.velocities[i] += accel * (0.5 * dt);
        }
        if self.potential.is_some() {
            self.current = Some(efs);
        }
        self.step += 1;
        Ok(())
    }

    fn wrap_positions(&mut self) {
        for p in &mut self.positions {
            let mut frac = self.lattice.to_fractional(p);
            frac.coords.iter_mut().for_each(|c| *c -= c.floor());
            *p = self.lattice.to_cartesian(&frac);
        }
    }
}

impl SimulationEngine for VelocityVerlet {
    fn snapshot(&self) -> Result<Configuration> {
        self.configuration()
    }

    fn step_index(&self) -> u64 {
        self.step
    }

    fn thermo(&self) -> Option<Thermo> {
        let efs = self.current.as_ref()?;
        let volume = self.lattice.volume();
        let n = self.positions.len() as f64;
        let kinetic_pressure = n * KB * self.temperature() / volume;
        let virial_pressure = (efs.stress[0] + efs.stress[3] + efs.stress[5]) / 3.0;
        Some(Thermo {
            temperature: self.temperature(),
            pressure: kinetic_pressure + virial_pressure,
            potential_energy: efs.energy,
            volume,
        })
    }

    fn reload_potential(&mut self, path: &Path) -> Result<()> {
        let checkpoint = CheckpointManager::load_model::<MappedPotential>(path)
            .with_context(|| format!("loading potential from {}", path.display()))?;
        self.set_potential(checkpoint.model)
    }
}
