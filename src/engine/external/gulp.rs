use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use regex::Regex;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::core::domain::{voigt_from_tensor, Configuration, Species};
use crate::engine::oracle::{GroundTruth, Oracle};

/// 1 eV/A^3 in GPa.
const EV_PER_A3_IN_GPA: f64 = 160.217_662_08;

/// Single-point GULP calculations over pipes.
/// Streams input/output via stdin/stdout to avoid disk latency.
pub struct GulpOracle {
    executable: String,
    potential_parameters: String,
    species_map: Vec<Species>,
    energy_re: Regex,
    derivative_re: Regex,
    stress_row_re: Regex,
}

impl GulpOracle {
    /// Creates a new oracle.
    ///
    /// # Arguments
    /// * `executable` - Path to GULP binary (e.g., "gulp").
    /// * `potential_parameters` - The potential block (buckingham, lennard, etc.).
    /// * `species_map` - Ordered species table matching the configuration labels.
    pub fn new(executable: &str, potential_parameters: &str, species_map: Vec<Species>) -> Result<Self> {
        Ok(Self {
            executable: executable.to_string(),
            potential_parameters: potential_parameters.to_string(),
            species_map,
            energy_re: Regex::new(r"(?i)total lattice energy\s*=\s*(\S+)\s*eV")?,
            derivative_re: Regex::new(r"^\s*\d+\s+\S+\s+c\s+(\S+)\s+(\S+)\s+(\S+)")?,
            stress_row_re: Regex::new(r"^\s*([xyz])\s+(\S+)\s+(\S+)\s+(\S+)\s*$")?,
        })
    }

    /// Constructs the GULP input string: a single point with gradients and stress.
    fn generate_input(&self, config: &Configuration) -> Result<String> {
        let mut s = String::with_capacity(1024);

        // 1. Header Keywords
        s.push_str("gradients conp stress\n");

        // 2. Lattice Vectors (GULP reads vectors as rows)
        s.push_str("vectors\n");
        let v = config.lattice().vectors;
        for c in 0..3 {
            s.push_str(&format!("{:.9} {:.9} {:.9}\n", v[(0, c)], v[(1, c)], v[(2, c)]));
        }

        // 3. Coordinates
        s.push_str("fractional\n");
        for (p, &label) in config.positions().iter().zip(config.species()) {
            let spec = self
                .species_map
                .get(label)
                .ok_or_else(|| anyhow!("Invalid species label {}", label))?;
            let frac = config.lattice().to_fractional(p);
            s.push_str(&format!(
                "{:<3} core {:.9} {:.9} {:.9}\n",
                spec.symbol, frac.x, frac.y, frac.z
            ));
        }

        // 4. Potentials
        s.push('\n');
        s.push_str(&self.potential_parameters);
        s.push('\n');

        Ok(s)
    }

    /// Executes GULP via stdin/stdout piping.
    fn run_process(&self, input_data: &str) -> Result<String> {
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn GULP executable")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input_data.as_bytes())
                .context("Failed to write to GULP stdin")?;
        }

        let output = child.wait_with_output().context("Failed to read GULP output")?;

        if !output.status.success() {
            let err_msg = String::from_utf8_lossy(&output.stderr);
            bail!("GULP exited with error: {}", err_msg);
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Parses energy, forces and stress from GULP output for `n_atoms` cores.
    pub fn parse_output(&self, output: &str, n_atoms: usize) -> Result<GroundTruth> {
        check_errors(output)?;
        let energy = self.parse_energy(output)?;
        let forces = self.parse_forces(output, n_atoms)?;
        let stress = self.parse_stress(output)?;
        Ok(GroundTruth { energy, forces, stress })
    }

    fn parse_energy(&self, output: &str) -> Result<f64> {
        let caps = self
            .energy_re
            .captures(output)
            .ok_or_else(|| anyhow!("Could not find total lattice energy in GULP output"))?;
        caps[1].parse::<f64>().context("Failed to parse energy float")
    }

    /// Forces are the negated Cartesian derivatives (eV/A); shells are skipped.
    fn parse_forces(&self, output: &str, n_atoms: usize) -> Result<Vec<Vector3<f64>>> {
        let lines: Vec<&str> = output.lines().collect();
        let start = lines
            .iter()
            .rposition(|l| l.to_ascii_lowercase().contains("final cartesian derivatives"))
            .ok_or_else(|| anyhow!("No Cartesian derivatives found in GULP output"))?;

        let mut forces = Vec::with_capacity(n_atoms);
        for line in &lines[start + 1..] {
            if forces.len() == n_atoms {
                break;
            }
            let Some(caps) = self.derivative_re.captures(line) else {
                continue;
            };
            let mut d = [0.0; 3];
            for (k, slot) in d.iter_mut().enumerate() {
                *slot = caps[k + 1]
                    .parse::<f64>()
                    .with_context(|| format!("Bad derivative in line '{}'", line.trim()))?;
            }
            forces.push(-Vector3::new(d[0], d[1], d[2]));
        }

        if forces.len() != n_atoms {
            bail!(
                "GULP atom count mismatch: expected {}, got {} derivative rows",
                n_atoms,
                forces.len()
            );
        }
        Ok(forces)
    }

    /// Reads the Cartesian stress tensor (GPa) and converts it to -(1/V) dE/dstrain in
    /// eV/A^3.
    fn parse_stress(&self, output: &str) -> Result<[f64; 6]> {
        let lines: Vec<&str> = output.lines().collect();
        let start = lines
            .iter()
            .rposition(|l| l.to_ascii_lowercase().contains("stress tensor"))
            .ok_or_else(|| anyhow!("No stress tensor found in GULP output"))?;

        let mut tensor: Matrix3<f64> = Matrix3::zeros();
        let mut seen = [false; 3];
        for line in &lines[start + 1..] {
            let Some(caps) = self.stress_row_re.captures(line) else {
                continue;
            };
            let row = match &caps[1] {
                "x" => 0,
                "y" => 1,
                _ => 2,
            };
            for c in 0..3 {
                tensor[(row, c)] = caps[c + 2]
                    .parse::<f64>()
                    .with_context(|| format!("Bad stress component in line '{}'", line.trim()))?;
            }
            seen[row] = true;
            if seen.iter().all(|s| *s) {
                break;
            }
        }
        if !seen.iter().all(|s| *s) {
            bail!("Incomplete stress tensor in GULP output");
        }
        Ok(voigt_from_tensor(&(-tensor / EV_PER_A3_IN_GPA)))
    }
}

fn check_errors(output: &str) -> Result<()> {
    if output.contains("Interatomic distance too small") {
        bail!("Geometric collapse");
    }
    if output.contains("Dump of error info") {
        bail!("Internal GULP error");
    }
    Ok(())
}

impl Oracle for GulpOracle {
    fn name(&self) -> &str {
        "GULP (Pipe)"
    }

    fn compute(&self, config: &Configuration) -> Result<GroundTruth> {
        let input_str = self.generate_input(config)?;
        let output_str = self.run_process(&input_str)?;
        self.parse_output(&output_str, config.len())
            .context("Parsing GULP single-point output")
    }
}
