//! Normalized dot-product kernel of power 2, averaged over descriptor blocks.
//!
//! `k0(a, b) = (1/T) sum_t (a_t . b_t)^2` on unit descriptors; environments of
//! different central species never correlate. Callers scale by `signal^2`.

use nalgebra::DVector;

use crate::model::descriptor::Environment;

pub fn kernel(a: &[DVector<f64>], b: &[DVector<f64>]) -> f64 {
    let t = a.len().max(1) as f64;
    a.iter().zip(b).map(|(x, y)| x.dot(y).powi(2)).sum::<f64>() / t
}

/// Kernel value between an environment and a sparse point, and its gradient with
/// respect to the environment's unit blocks.
pub fn kernel_with_grad(env: &Environment, sparse: &[DVector<f64>]) -> (f64, Vec<DVector<f64>>) {
    let t = env.blocks.len().max(1) as f64;
    let mut value = 0.0;
    let grads = env
        .blocks
        .iter()
        .zip(sparse)
        .map(|(block, s)| {
            let dot = block.unit.dot(s);
            value += dot * dot;
            s * (2.0 * dot / t)
        })
        .collect();
    (value / t, grads)
}

/// Kernel value between an environment and a sparse point, without gradients.
pub fn kernel_env(env: &Environment, sparse: &[DVector<f64>]) -> f64 {
    let t = env.blocks.len().max(1) as f64;
    env.blocks
        .iter()
        .zip(sparse)
        .map(|(block, s)| block.unit.dot(s).powi(2))
        .sum::<f64>()
        / t
}

/// `k0(a, a)`: 1 for a fully populated environment, 0 for an isolated atom.
pub fn self_kernel(env: &Environment) -> f64 {
    let t = env.blocks.len().max(1) as f64;
    env.blocks
        .iter()
        .map(|block| block.unit.norm_squared().powi(2))
        .sum::<f64>()
        / t
}

/// Feature map with `k0(a, b) = phi(a) . phi(b)`: the upper triangle of every
/// `u u^T` block, off-diagonal entries scaled by sqrt(2), all scaled by 1/sqrt(T).
pub fn quadratic_features(units: &[DVector<f64>]) -> DVector<f64> {
    let len: usize = units.iter().map(|u| u.len() * (u.len() + 1) / 2).sum();
    let scale = 1.0 / (units.len().max(1) as f64).sqrt();
    let mut phi = DVector::zeros(len);
    let mut idx = 0;
    for u in units {
        for a in 0..u.len() {
            phi[idx] = u[a] * u[a] * scale;
            idx += 1;
            for b in (a + 1)..u.len() {
                phi[idx] = std::f64::consts::SQRT_2 * u[a] * u[b] * scale;
                idx += 1;
            }
        }
    }
    phi
}

pub fn feature_len(block_lens: &[usize]) -> usize {
    block_lens.iter().map(|d| d * (d + 1) / 2).sum()
}
