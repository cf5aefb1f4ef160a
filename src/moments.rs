//! Moment vectors and the 2-D Gaussians they describe.
//!
//! A moment vector is `[cx, cy, var_x, var_y, cov_xy]`: the centre of an
//! object followed by its second-order central moments, in coordinates
//! normalized to the image extent.

use nalgebra::{DMatrix, Matrix2, Vector2};
use serde::Deserialize;

/// Number of scalars in a moment vector.
pub const MOMENT_DIM: usize = 5;

/*------------------------------------------------------------------------------
MomentScale
------------------------------------------------------------------------------*/

/// Image extent used to map normalized moments to absolute coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct MomentScale {
    pub width: f64,
    pub height: f64,
}

impl Default for MomentScale {
    fn default() -> Self {
        Self {
            width: 1.0,
            height: 1.0,
        }
    }
}

impl MomentScale {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Per-component factors: first-order terms scale with the extent,
    /// second-order terms with its square (`cov_xy` with `width * height`).
    fn factors(&self) -> [f64; MOMENT_DIM] {
        let (w, h) = (self.width, self.height);
        [w, h, w * w, h * h, w * h]
    }

    /// Maps one normalized moment vector to absolute coordinates.
    pub fn denormalize(&self, moment: &[f64; MOMENT_DIM]) -> [f64; MOMENT_DIM] {
        let factors = self.factors();
        std::array::from_fn(|k| moment[k] * factors[k])
    }

    /// Row-wise [`MomentScale::denormalize`] over an `(n, 5)` matrix.
    pub fn denormalize_rows(&self, moments: &DMatrix<f64>) -> DMatrix<f64> {
        debug_assert_eq!(moments.ncols(), MOMENT_DIM);
        let factors = self.factors();
        DMatrix::from_fn(moments.nrows(), MOMENT_DIM, |i, k| {
            moments[(i, k)] * factors[k]
        })
    }
}

/*------------------------------------------------------------------------------
Gaussian
------------------------------------------------------------------------------*/

/// Symmetric 2x2 covariance from the trailing three moment components.
///
/// Positive-definiteness is not checked here.
pub fn moments_to_cov(var_x: f64, var_y: f64, cov_xy: f64) -> Matrix2<f64> {
    Matrix2::new(var_x, cov_xy, cov_xy, var_y)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian {
    pub mean: Vector2<f64>,
    pub cov: Matrix2<f64>,
}

impl Gaussian {
    pub fn new(mean: Vector2<f64>, cov: Matrix2<f64>) -> Self {
        Self { mean, cov }
    }

    /// Builds the Gaussian of an already denormalized moment vector.
    pub fn from_moment(moment: &[f64; MOMENT_DIM]) -> Self {
        Self {
            mean: Vector2::new(moment[0], moment[1]),
            cov: moments_to_cov(moment[2], moment[3], moment[4]),
        }
    }

    /// One Gaussian per row of a denormalized `(n, 5)` moment matrix.
    pub fn from_moment_rows(moments: &DMatrix<f64>) -> Vec<Self> {
        moments
            .row_iter()
            .map(|row| {
                Self::from_moment(&[row[0], row[1], row[2], row[3], row[4]])
            })
            .collect()
    }
}

/// Inverse and log-determinant of a target covariance, shared by every
/// source it is compared with.
struct Precision {
    inv: Matrix2<f64>,
    ln_det: f64,
}

impl Precision {
    fn of(cov: &Matrix2<f64>) -> Self {
        let det = cov.determinant();
        // adjugate / det; a singular covariance yields inf or NaN here
        let adj = Matrix2::new(cov[(1, 1)], -cov[(0, 1)], -cov[(1, 0)], cov[(0, 0)]);
        Self {
            inv: adj / det,
            ln_det: det.ln(),
        }
    }
}

/// Pairwise closed-form `KL(a_i || b_j)` for 2-D Gaussians.
///
/// Returns an `(a.len(), b.len())` matrix. Singular or indefinite covariances
/// produce `NaN` or `±inf` entries; they are left for the caller to handle.
pub fn kl_divergence_batched(a: &[Gaussian], b: &[Gaussian]) -> DMatrix<f64> {
    const K: f64 = 2.0;

    let ln_det_a: Vec<f64> = a.iter().map(|g| g.cov.determinant().ln()).collect();
    let precision_b: Vec<Precision> = b.iter().map(|g| Precision::of(&g.cov)).collect();

    DMatrix::from_fn(a.len(), b.len(), |i, j| {
        let (ga, gb, pb) = (&a[i], &b[j], &precision_b[j]);
        let trace = (pb.inv * ga.cov).trace();
        let diff = gb.mean - ga.mean;
        let mahalanobis = diff.dot(&(pb.inv * diff));
        0.5 * (trace + mahalanobis - K + (pb.ln_det - ln_det_a[i]))
    })
}
