use crate::error::MatchError::{self, LapjvError};
use nalgebra::DMatrix;

/* -----------------------------------------------------------------------------
 * lapjv.rs - Jonker-Volgenant linear assignment algorithm (dense, square)
 * ----------------------------------------------------------------------------- */

// Only used as the starting value of running minima; inputs are finite.
const LARGE: f64 = f64::INFINITY;

/// Column reduction followed by reduction transfer.
/// Returns the number of rows left unassigned in `free_rows`.
fn ccrt_dense(
    cost: &DMatrix<f64>,
    free_rows: &mut [usize],
    x: &mut [isize],
    y: &mut [isize],
    v: &mut [f64],
) -> usize {
    let n = cost.nrows();
    debug_assert!(n >= 2, "ccrt_dense expects at least two rows");

    x.fill(-1);
    v.fill(LARGE);
    y.fill(0);
    for i in 0..n {
        for j in 0..n {
            let c = cost[(i, j)];
            if c < v[j] {
                v[j] = c;
                y[j] = i as isize;
            }
        }
    }

    let mut unique = vec![true; n];
    for j in (0..n).rev() {
        let i = y[j] as usize;
        if x[i] < 0 {
            x[i] = j as isize;
        } else {
            unique[i] = false;
            y[j] = -1;
        }
    }

    let mut n_free_rows = 0;
    for i in 0..n {
        if x[i] < 0 {
            free_rows[n_free_rows] = i;
            n_free_rows += 1;
        } else if unique[i] {
            let j = x[i] as usize;
            let mut min = LARGE;
            for j2 in 0..n {
                if j2 == j {
                    continue;
                }
                let c = cost[(i, j2)] - v[j2];
                if c < min {
                    min = c;
                }
            }
            v[j] -= min;
        }
    }
    n_free_rows
}

/// Augmenting row reduction.
fn carr_dense(
    cost: &DMatrix<f64>,
    n_free_rows: usize,
    free_rows: &mut [usize],
    x: &mut [isize],
    y: &mut [isize],
    v: &mut [f64],
) -> usize {
    let n = cost.nrows();
    let mut current = 0;
    let mut new_free_rows = 0;
    let mut rr_cnt = 0;

    while current < n_free_rows {
        rr_cnt += 1;
        let free_i = free_rows[current];
        current += 1;

        let mut j1: isize = 0;
        let mut j2: isize = -1;
        let mut v1 = cost[(free_i, 0)] - v[0];
        let mut v2 = LARGE;

        for j in 1..n {
            let c = cost[(free_i, j)] - v[j];
            if c < v2 {
                if c >= v1 {
                    v2 = c;
                    j2 = j as isize;
                } else {
                    v2 = v1;
                    v1 = c;
                    j2 = j1;
                    j1 = j as isize;
                }
            }
        }

        let mut i0 = y[j1 as usize];
        let v1_new = v[j1 as usize] - (v2 - v1);
        let v1_lowers = v1_new < v[j1 as usize];

        if rr_cnt < current * n {
            if v1_lowers {
                v[j1 as usize] = v1_new;
            } else if i0 >= 0 && j2 >= 0 {
                j1 = j2;
                i0 = y[j2 as usize];
            }

            if i0 >= 0 {
                if v1_lowers {
                    current -= 1;
                    free_rows[current] = i0 as usize;
                } else {
                    free_rows[new_free_rows] = i0 as usize;
                    new_free_rows += 1;
                }
            }
        } else if i0 >= 0 {
            free_rows[new_free_rows] = i0 as usize;
            new_free_rows += 1;
        }
        x[free_i] = j1;
        y[j1 as usize] = free_i as isize;
    }
    new_free_rows
}

/// Moves every column with the smallest `d` to `cols[lo..hi]` and returns `hi`.
fn find_dense(lo: usize, d: &[f64], cols: &mut [usize]) -> usize {
    let n = cols.len();
    let mut hi = lo + 1;
    let mut mind = d[cols[lo]];
    for k in hi..n {
        let j = cols[k];
        if d[j] <= mind {
            if d[j] < mind {
                hi = lo;
                mind = d[j];
            }
            cols[k] = cols[hi];
            cols[hi] = j;
            hi += 1;
        }
    }
    hi
}

/// Scans the columns in `cols[lo..hi]`, relaxing `d`. Returns an unassigned
/// column reached at minimum distance, if any.
#[allow(clippy::too_many_arguments)]
fn scan_dense(
    cost: &DMatrix<f64>,
    plo: &mut usize,
    phi: &mut usize,
    d: &mut [f64],
    cols: &mut [usize],
    pred: &mut [usize],
    y: &[isize],
    v: &[f64],
) -> Option<usize> {
    let n = cost.nrows();
    let mut lo = *plo;
    let mut hi = *phi;

    while lo != hi {
        let mut j = cols[lo];
        lo += 1;

        debug_assert!(y[j] >= 0, "scanned column must be assigned");
        let i = y[j] as usize;
        let mind = d[j];
        let h = cost[(i, j)] - v[j] - mind;
        for k in hi..n {
            j = cols[k];
            let cred_ij = cost[(i, j)] - v[j] - h;
            if cred_ij < d[j] {
                d[j] = cred_ij;
                pred[j] = i;
                if cred_ij == mind {
                    if y[j] < 0 {
                        return Some(j);
                    }
                    cols[k] = cols[hi];
                    cols[hi] = j;
                    hi += 1;
                }
            }
        }
    }
    *plo = lo;
    *phi = hi;
    None
}

/// Dijkstra-like search for the shortest augmenting path from `start_i`.
fn find_path_dense(
    cost: &DMatrix<f64>,
    start_i: usize,
    y: &[isize],
    v: &mut [f64],
    pred: &mut [usize],
) -> usize {
    let n = cost.nrows();
    let mut lo = 0;
    let mut hi = 0;
    let mut final_j = None;
    let mut n_ready = 0;
    let mut cols: Vec<usize> = (0..n).collect();
    let mut d = vec![0.0; n];

    for j in 0..n {
        pred[j] = start_i;
        d[j] = cost[(start_i, j)] - v[j];
    }

    while final_j.is_none() {
        if lo == hi {
            n_ready = lo;
            hi = find_dense(lo, &d, &mut cols);
            for &j in &cols[lo..hi] {
                if y[j] < 0 {
                    final_j = Some(j);
                }
            }
        }
        if final_j.is_none() {
            final_j = scan_dense(
                cost, &mut lo, &mut hi, &mut d, &mut cols, pred, y, v,
            );
        }
    }

    let mind = d[cols[lo]];
    for &j in &cols[..n_ready] {
        v[j] += d[j] - mind;
    }
    final_j.unwrap_or_default()
}

/// Augments along shortest paths until every free row is assigned.
fn ca_dense(
    cost: &DMatrix<f64>,
    n_free_rows: usize,
    free_rows: &[usize],
    x: &mut [isize],
    y: &mut [isize],
    v: &mut [f64],
) -> usize {
    let n = cost.nrows();
    let mut pred = vec![0; n];

    for &free_row in &free_rows[..n_free_rows] {
        let mut i = -1isize;
        let mut k = 0;

        let mut j = find_path_dense(cost, free_row, y, v, &mut pred) as isize;
        while i != free_row as isize {
            i = pred[j as usize] as isize;
            y[j as usize] = i;

            // swap x[i] and j
            std::mem::swap(&mut j, &mut x[i as usize]);

            k += 1;
            debug_assert!(k <= n, "augmenting path longer than n");
        }
    }
    0
}

/// Solves the square assignment problem for `cost`.
///
/// Returns `(x, y)` where `x[i]` is the column assigned to row `i` and
/// `y[j]` the row assigned to column `j`.
pub(crate) fn lapjv(
    cost: &DMatrix<f64>,
) -> Result<(Vec<isize>, Vec<isize>), MatchError> {
    let n = cost.nrows();
    if n == 0 {
        return Err(LapjvError(format!(
            "cost.nrows() must be greater than 0, but cost.nrows() = {}",
            n
        )));
    }
    if n != cost.ncols() {
        return Err(LapjvError(format!(
            "cost matrix must be square, but got {}x{}",
            n,
            cost.ncols()
        )));
    }
    if let Some(pos) = cost.iter().position(|c| !c.is_finite()) {
        return Err(LapjvError(format!(
            "cost matrix must be finite, but entry ({}, {}) is {}",
            pos % n,
            pos / n,
            cost[pos]
        )));
    }

    if n == 1 {
        return Ok((vec![0], vec![0]));
    }

    let mut x = vec![-1isize; n];
    let mut y = vec![-1isize; n];
    let mut free_rows = vec![0; n];
    let mut v = vec![0.0; n];

    let mut ret = ccrt_dense(cost, &mut free_rows, &mut x, &mut y, &mut v);
    let mut i = 0;
    while ret > 0 && i < 2 {
        ret = carr_dense(cost, ret, &mut free_rows, &mut x, &mut y, &mut v);
        i += 1;
    }
    if ret > 0 {
        ret = ca_dense(cost, ret, &free_rows, &mut x, &mut y, &mut v);
    }
    if ret > 0 || x.iter().any(|&j| j < 0) {
        return Err(LapjvError(format!(
            "assignment left {} rows free",
            x.iter().filter(|&&j| j < 0).count()
        )));
    }
    Ok((x, y))
}
