use nalgebra::{Point3, Vector3};

use crate::core::domain::{Configuration, Lattice};

/// One directed neighbor pair `i -> j` (possibly a periodic image of `j`, or of `i` itself).
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub center: usize,
    pub neighbor: usize,
    /// Cartesian vector from `center` to the neighbor image.
    pub delta: Vector3<f64>,
    pub distance: f64,
}

/// Wraps a point into the primary cell, fractional coordinates in [0, 1).
pub fn wrap_point(p: &Point3<f64>, lattice: &Lattice) -> Point3<f64> {
    let mut frac = lattice.to_fractional(p);
    frac.coords.x = frac.coords.x.rem_euclid(1.0);
    frac.coords.y = frac.coords.y.rem_euclid(1.0);
    frac.coords.z = frac.coords.z.rem_euclid(1.0);
    lattice.to_cartesian(&frac)
}

/// Per-center neighbor lists within `cutoff`, including every periodic image the
/// cutoff sphere reaches. Works for cells smaller than the cutoff.
pub fn neighbor_lists(config: &Configuration, cutoff: f64) -> Vec<Vec<Neighbor>> {
    let lattice = config.lattice();
    let wrapped: Vec<Point3<f64>> = config
        .positions()
        .iter()
        .map(|p| wrap_point(p, lattice))
        .collect();

    // Fractional differences lie in (-1, 1), hence the extra shell.
    let h = lattice.heights();
    let reach = |height: f64| (cutoff / height).ceil() as i32 + 1;
    let (na, nb, nc) = (reach(h.x), reach(h.y), reach(h.z));

    let mut shifts = Vec::new();
    for a in -na..=na {
        for b in -nb..=nb {
            for c in -nc..=nc {
                let frac = Vector3::new(a as f64, b as f64, c as f64);
                shifts.push(((a, b, c) == (0, 0, 0), lattice.vectors * frac));
            }
        }
    }

    let cutoff_sq = cutoff * cutoff;
    let n = wrapped.len();
    let mut lists = Vec::with_capacity(n);
    for i in 0..n {
        let mut list = Vec::new();
        for j in 0..n {
            let base = wrapped[j] - wrapped[i];
            for (is_origin, shift) in &shifts {
                if i == j && *is_origin {
                    continue;
                }
                let delta = base + shift;
                let d2 = delta.norm_squared();
                if d2 < cutoff_sq && d2 > 1e-20 {
                    list.push(Neighbor {
                        center: i,
                        neighbor: j,
                        delta,
                        distance: d2.sqrt(),
                    });
                }
            }
        }
        lists.push(list);
    }
    lists
}
