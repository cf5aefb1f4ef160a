//! Rectangular linear assignment on top of the square LAPJV solver.

use crate::error::MatchError;
use crate::lapjv::lapjv;
use nalgebra::DMatrix;

/// Optimal one-to-one pairing of rows and columns of a cost matrix.
///
/// `rows` is strictly increasing and `cols[k]` is the column paired with
/// `rows[k]`. Both have length `min(nrows, ncols)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub rows: Vec<usize>,
    pub cols: Vec<usize>,
}

impl Assignment {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over the matched `(row, col)` pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    /// Sum of `cost` over the matched pairs.
    pub fn total_cost(&self, cost: &DMatrix<f64>) -> f64 {
        self.pairs().map(|(i, j)| cost[(i, j)]).sum()
    }
}

/// Minimum-cost assignment for a possibly rectangular cost matrix.
///
/// The matrix is padded to `max(nrows, ncols)` with zero-cost dummy rows or
/// columns. Every complete assignment of the padded matrix uses the same
/// number of dummy entries, so the optimum restricted to real entries is the
/// optimum of the rectangular problem. Pairs that touch a dummy are dropped.
pub fn linear_sum_assignment(
    cost: &DMatrix<f64>,
) -> Result<Assignment, MatchError> {
    let nrows = cost.nrows();
    let ncols = cost.ncols();

    if nrows == 0 || ncols == 0 {
        return Ok(Assignment::default());
    }

    let n = nrows.max(ncols);
    let x = if nrows == ncols {
        lapjv(cost)?.0
    } else {
        let mut padded = DMatrix::zeros(n, n);
        padded.view_mut((0, 0), (nrows, ncols)).copy_from(cost);
        lapjv(&padded)?.0
    };

    // Extract matches: x[i] = j means row i is assigned to column j
    let mut assignment = Assignment {
        rows: Vec::with_capacity(nrows.min(ncols)),
        cols: Vec::with_capacity(nrows.min(ncols)),
    };
    for (i, &j) in x.iter().enumerate().take(nrows) {
        if j >= 0 && (j as usize) < ncols {
            assignment.rows.push(i);
            assignment.cols.push(j as usize);
        }
    }
    Ok(assignment)
}
