//! Extended-XYZ writer for diagnostic dumps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::domain::{tensor_from_voigt, Configuration, Efs, Species};

/// One frame ready for writing. Borrowed views only; building a frame is free.
pub struct Frame<'a> {
    config: &'a Configuration,
    species: &'a [Species],
    truth: Option<&'a Efs>,
    per_atom: Option<(&'a str, &'a [f64])>,
}

impl<'a> Frame<'a> {
    pub fn new(config: &'a Configuration, species: &'a [Species]) -> Self {
        Self {
            config,
            species,
            truth: None,
            per_atom: None,
        }
    }

    pub fn with_truth(mut self, truth: &'a Efs) -> Self {
        self.truth = Some(truth);
        self
    }

    /// Attaches a per-atom scalar column, e.g. the uncertainty score.
    pub fn with_scalar(mut self, name: &'a str, values: &'a [f64]) -> Self {
        self.per_atom = Some((name, values));
        self
    }

    fn symbol(&self, s: usize) -> &str {
        self.species.get(s).map(|sp| sp.symbol.as_str()).unwrap_or("X")
    }

    pub fn render(&self) -> String {
        let n = self.config.len();
        let mut s = String::with_capacity(64 * (n + 2));
        s.push_str(&format!("{}\n", n));

        let v = self.config.lattice().vectors;
        s.push_str(&format!(
            "Lattice=\"{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}\"",
            v[(0, 0)], v[(1, 0)], v[(2, 0)],
            v[(0, 1)], v[(1, 1)], v[(2, 1)],
            v[(0, 2)], v[(1, 2)], v[(2, 2)]
        ));

        let mut props = String::from("species:S:1:pos:R:3");
        if self.truth.is_some() {
            props.push_str(":forces:R:3");
        }
        if let Some((name, _)) = self.per_atom {
            props.push_str(&format!(":{}:R:1", name));
        }
        s.push_str(&format!(" Properties={}", props));

        if let Some(t) = self.truth {
            s.push_str(&format!(" energy={:.9}", t.energy));
            // Readers expect (1/V) dE/dstrain, the opposite sign of `Efs::stress`.
            let m = -tensor_from_voigt(&t.stress);
            s.push_str(&format!(
                " stress=\"{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}\"",
                m[(0, 0)], m[(0, 1)], m[(0, 2)],
                m[(1, 0)], m[(1, 1)], m[(1, 2)],
                m[(2, 0)], m[(2, 1)], m[(2, 2)]
            ));
        }
        s.push_str(" pbc=\"T T T\"\n");

        for (i, (p, &sp)) in self
            .config
            .positions()
            .iter()
            .zip(self.config.species())
            .enumerate()
        {
            s.push_str(&format!(
                "{:<3} {:>15.9} {:>15.9} {:>15.9}",
                self.symbol(sp),
                p.x,
                p.y,
                p.z
            ));
            if let Some(t) = self.truth {
                let f = t.forces[i];
                s.push_str(&format!(" {:>15.9} {:>15.9} {:>15.9}", f.x, f.y, f.z));
            }
            if let Some((_, values)) = self.per_atom {
                s.push_str(&format!(" {:>15.9}", values.get(i).copied().unwrap_or(f64::NAN)));
            }
            s.push('\n');
        }
        s
    }
}

/// Writes a single frame, replacing any existing file.
pub fn write_frame(path: &Path, frame: &Frame<'_>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(frame.render().as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writer.flush()?;
    Ok(())
}
