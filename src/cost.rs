//! Pairwise cost terms between flattened predictions and targets.
//!
//! Every function here returns a dense `(num_predictions, num_targets)`
//! matrix. Rows are predictions, columns are targets.

use crate::moments::{kl_divergence_batched, Gaussian, MomentScale, MOMENT_DIM};
use nalgebra::DMatrix;
use rayon::prelude::*;

pub const FOCAL_ALPHA: f64 = 0.25;
pub const FOCAL_GAMMA: f64 = 2.0;
/// Keeps the focal logarithms away from `ln(0)`.
pub const LOG_EPS: f64 = 1e-8;
/// Replacement for non-finite KL entries.
pub const DEFAULT_KL_PENALTY: f64 = 1000.0;

/// Builds an `(nrows, ncols)` matrix from `f(row, col)`, one column per task.
pub(crate) fn pairwise<F>(nrows: usize, ncols: usize, f: F) -> DMatrix<f64>
where
    F: Fn(usize, usize) -> f64 + Sync,
{
    let f = &f;
    // column-major, matching nalgebra's storage
    let data: Vec<f64> = (0..ncols)
        .into_par_iter()
        .flat_map_iter(|j| (0..nrows).map(move |i| f(i, j)))
        .collect();
    DMatrix::from_vec(nrows, ncols, data)
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Focal-style classification cost.
///
/// With `p = sigmoid(logit)` of the target's own class:
/// `alpha (1-p)^gamma (-ln(p+eps)) - (1-alpha) p^gamma (-ln(1-p+eps))`.
pub fn focal_class_cost(
    logits: &DMatrix<f64>,
    labels: &[usize],
    alpha: f64,
    gamma: f64,
) -> DMatrix<f64> {
    debug_assert!(labels.iter().all(|&c| c < logits.ncols()));

    pairwise(logits.nrows(), labels.len(), |i, j| {
        let p = sigmoid(logits[(i, labels[j])]);
        let pos = alpha * (1.0 - p).powf(gamma) * -(p + LOG_EPS).ln();
        let neg = (1.0 - alpha) * p.powf(gamma) * -(1.0 - p + LOG_EPS).ln();
        pos - neg
    })
}

/// Pairwise L1 distance between moment vectors (`cdist` with `p = 1`).
pub fn l1_moment_cost(
    pred_moments: &DMatrix<f64>,
    tgt_moments: &DMatrix<f64>,
) -> DMatrix<f64> {
    debug_assert_eq!(pred_moments.ncols(), tgt_moments.ncols());

    pairwise(pred_moments.nrows(), tgt_moments.nrows(), |i, j| {
        (0..pred_moments.ncols())
            .map(|k| (pred_moments[(i, k)] - tgt_moments[(j, k)]).abs())
            .sum()
    })
}

/// Replaces every `NaN`/`±inf` with `penalty`. Returns how many were replaced.
pub fn sanitize_non_finite(cost: &mut DMatrix<f64>, penalty: f64) -> usize {
    let mut replaced = 0;
    for c in cost.iter_mut() {
        if !c.is_finite() {
            *c = penalty;
            replaced += 1;
        }
    }
    replaced
}

/// KL divergence between the Gaussians of denormalized predicted and target
/// moments, with non-finite entries replaced by `penalty`.
///
/// The penalty is an approximation for degenerate covariances, not a
/// numerically exact treatment. Returns the matrix and the number of
/// replaced entries.
pub fn kl_moment_cost(
    pred_moments: &DMatrix<f64>,
    tgt_moments: &DMatrix<f64>,
    scale: &MomentScale,
    penalty: f64,
) -> (DMatrix<f64>, usize) {
    debug_assert_eq!(pred_moments.ncols(), MOMENT_DIM);
    debug_assert_eq!(tgt_moments.ncols(), MOMENT_DIM);

    let src = Gaussian::from_moment_rows(&scale.denormalize_rows(pred_moments));
    let tgt = Gaussian::from_moment_rows(&scale.denormalize_rows(tgt_moments));

    let mut cost = kl_divergence_batched(&src, &tgt);
    let replaced = sanitize_non_finite(&mut cost, penalty);
    (cost, replaced)
}

/// Relative weights of the three cost terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostWeights {
    pub class: f64,
    pub moments: f64,
    pub kl: f64,
}

impl CostWeights {
    /// `moments * l1 + class * class_cost + kl * kl_cost`, elementwise.
    pub fn combine(
        &self,
        class_cost: &DMatrix<f64>,
        l1_cost: &DMatrix<f64>,
        kl_cost: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        debug_assert_eq!(class_cost.shape(), l1_cost.shape());
        debug_assert_eq!(class_cost.shape(), kl_cost.shape());

        l1_cost * self.moments + class_cost * self.class + kl_cost * self.kl
    }
}
