use crate::assignment::linear_sum_assignment;
use crate::error::MatchError;
use crate::matcher::{HungarianMatcher, MatchIndices, Predictions, Target};
use crate::moments::{MomentScale, MOMENT_DIM};
use nalgebra::DMatrix;
use quickcheck::{Arbitrary, Gen};
use rand::Rng;

/*------------------------------------------------------------------------------
Helpers
------------------------------------------------------------------------------*/

fn moments(rows: &[[f64; MOMENT_DIM]]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), MOMENT_DIM, |i, k| rows[i][k])
}

fn logits(rows: &[&[f64]]) -> DMatrix<f64> {
    let ncols = rows.first().map_or(0, |r| r.len());
    DMatrix::from_fn(rows.len(), ncols, |i, k| rows[i][k])
}

fn assert_valid(indices: &MatchIndices, num_queries: usize, num_targets: usize) {
    assert_eq!(
        indices.prediction_indices.len(),
        indices.target_indices.len()
    );
    assert_eq!(indices.len(), num_queries.min(num_targets));
    assert!(indices.prediction_indices.windows(2).all(|w| w[0] < w[1]));
    assert!(indices
        .prediction_indices
        .iter()
        .all(|&i| 0 <= i && (i as usize) < num_queries));
    let mut seen = vec![false; num_targets];
    for &j in &indices.target_indices {
        assert!(0 <= j && (j as usize) < num_targets);
        assert!(!seen[j as usize], "target {} matched twice", j);
        seen[j as usize] = true;
    }
}

/*------------------------------------------------------------------------------
Scenarios
------------------------------------------------------------------------------*/

#[test]
fn test_single_example_three_queries_two_targets() {
    let matcher = HungarianMatcher::new(1.0, 1.0, 1.0).unwrap();
    let t0 = [0.2, 0.3, 0.010, 0.020, 0.002];
    let t1 = [0.7, 0.6, 0.020, 0.010, -0.003];
    let target = Target::new(vec![0, 1], moments(&[t0, t1]));

    // query 1 is exactly target 1, query 2 is close to target 0,
    // query 0 is background
    let predictions = Predictions::new(
        1,
        3,
        logits(&[&[-4.0, -4.0], &[-4.0, 6.0], &[5.0, -4.0]]),
        moments(&[
            [0.5, 0.9, 0.05, 0.05, 0.0],
            t1,
            [0.22, 0.31, 0.011, 0.019, 0.002],
        ]),
    )
    .unwrap();

    let indices = matcher.match_batch(&predictions, &[target]).unwrap();
    assert_eq!(indices.len(), 1);
    assert_eq!(indices[0].prediction_indices, vec![1, 2]);
    assert_eq!(indices[0].target_indices, vec![1, 0]);
    assert!(!indices[0].prediction_indices.contains(&0));
}

#[test]
fn test_identical_prediction_is_row_minimum_and_matched() {
    let matcher = HungarianMatcher::new(2.0, 5.0, 1.0)
        .unwrap()
        .with_moment_scale(MomentScale::new(256.0, 256.0))
        .unwrap();
    let targets = [
        [0.25, 0.25, 0.002, 0.003, 0.0005],
        [0.75, 0.40, 0.004, 0.001, -0.0002],
        [0.50, 0.80, 0.003, 0.003, 0.0],
    ];
    let target = Target::new(vec![2, 0, 1], moments(&targets));

    // query 1 copies target 2 with a confident class 1 logit
    let predictions = Predictions::new(
        1,
        2,
        logits(&[&[0.1, -0.3, 0.2], &[-6.0, 6.0, -6.0]]),
        moments(&[[0.45, 0.55, 0.01, 0.02, 0.0], targets[2]]),
    )
    .unwrap();

    let cost = matcher
        .cost_matrix(&predictions, std::slice::from_ref(&target))
        .unwrap();
    let row = cost.row(1);
    let argmin = (0..row.len())
        .min_by(|&a, &b| row[a].total_cmp(&row[b]))
        .unwrap();
    assert_eq!(argmin, 2);

    let indices = matcher.match_example(
        &logits(&[&[0.1, -0.3, 0.2], &[-6.0, 6.0, -6.0]]),
        &moments(&[[0.45, 0.55, 0.01, 0.02, 0.0], targets[2]]),
        &target,
    );
    let indices = indices.unwrap();
    assert_valid(&indices, 2, 3);
    assert!(indices.pairs().any(|pair| pair == (1, 2)));
}

#[test]
fn test_raising_moment_weight_flips_assignment() {
    let t0 = [0.2, 0.3, 0.01, 0.02, 0.0];
    let t1 = [0.6, 0.7, 0.02, 0.01, 0.0];
    let target = Target::new(vec![0, 1], moments(&[t0, t1]));

    // classification prefers the crossed pairing, L1 the straight one
    let predictions = Predictions::new(
        1,
        2,
        logits(&[&[-3.0, 3.0], &[3.0, -3.0]]),
        moments(&[t0, t1]),
    )
    .unwrap();

    let low = HungarianMatcher::new(1.0, 0.1, 0.0).unwrap();
    let indices = low
        .match_batch(&predictions, std::slice::from_ref(&target))
        .unwrap();
    assert_eq!(indices[0].prediction_indices, vec![0, 1]);
    assert_eq!(indices[0].target_indices, vec![1, 0]);

    let high = HungarianMatcher::new(1.0, 10.0, 0.0).unwrap();
    let indices = high
        .match_batch(&predictions, std::slice::from_ref(&target))
        .unwrap();
    assert_eq!(indices[0].prediction_indices, vec![0, 1]);
    assert_eq!(indices[0].target_indices, vec![0, 1]);
}

#[test]
fn test_singular_covariance_gets_exact_penalty() {
    let matcher = HungarianMatcher::new(0.0, 0.0, 1.0).unwrap();
    // var_x * var_y == cov_xy^2
    let singular = [0.5, 0.5, 0.25, 0.0625, 0.125];
    let regular = [0.5, 0.5, 0.25, 0.0625, 0.0];
    let target = Target::new(vec![0, 0], moments(&[singular, regular]));
    let predictions = Predictions::new(
        1,
        2,
        logits(&[&[0.0], &[0.0]]),
        moments(&[regular, [0.4, 0.6, 0.03, 0.02, 0.001]]),
    )
    .unwrap();

    let cost = matcher
        .cost_matrix(&predictions, std::slice::from_ref(&target))
        .unwrap();
    assert_eq!(cost[(0, 0)], 1000.0);
    assert_eq!(cost[(1, 0)], 1000.0);
    assert!(cost.iter().all(|c| c.is_finite()));

    let indices = matcher.match_batch(&predictions, &[target]).unwrap();
    assert_valid(&indices[0], 2, 2);
    assert!(indices[0].pairs().any(|pair| pair == (0, 1)));
}

#[test]
fn test_custom_kl_penalty() {
    let matcher = HungarianMatcher::new(0.0, 0.0, 2.0)
        .unwrap()
        .with_kl_penalty(7.5)
        .unwrap();
    let target = Target::new(vec![0], moments(&[[0.5, 0.5, 0.0, 0.0, 0.0]]));
    let predictions = Predictions::new(
        1,
        1,
        logits(&[&[0.0]]),
        moments(&[[0.5, 0.5, 0.01, 0.01, 0.0]]),
    )
    .unwrap();
    let cost = matcher.cost_matrix(&predictions, &[target]).unwrap();
    assert_eq!(cost[(0, 0)], 15.0);
}

#[test]
fn test_matching_is_idempotent() {
    let matcher = HungarianMatcher::new(2.0, 5.0, 1.0).unwrap();
    let (predictions, targets) = random_batch(&mut rand::thread_rng(), 3, 5, 4);
    let first = matcher.match_batch(&predictions, &targets).unwrap();
    let second = matcher.match_batch(&predictions, &targets).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_example_without_targets() {
    let matcher = HungarianMatcher::new(1.0, 1.0, 1.0).unwrap();
    let m = [0.5, 0.5, 0.01, 0.01, 0.0];
    let predictions = Predictions::new(
        2,
        2,
        DMatrix::zeros(4, 1),
        moments(&[m, m, m, m]),
    )
    .unwrap();
    let targets = [Target::new(vec![0], moments(&[m])), Target::empty()];

    let indices = matcher.match_batch(&predictions, &targets).unwrap();
    assert_eq!(indices.len(), 2);
    assert_eq!(indices[0].len(), 1);
    assert!(indices[1].prediction_indices.is_empty());
    assert!(indices[1].target_indices.is_empty());
}

#[test]
fn test_batch_without_queries() {
    let matcher = HungarianMatcher::new(1.0, 1.0, 1.0).unwrap();
    let m = [0.5, 0.5, 0.01, 0.01, 0.0];
    let predictions = Predictions::new(
        2,
        0,
        DMatrix::zeros(0, 3),
        DMatrix::zeros(0, MOMENT_DIM),
    )
    .unwrap();
    let targets = [
        Target::new(vec![0, 2], moments(&[m, m])),
        Target::new(vec![1], moments(&[m])),
    ];

    let indices = matcher.match_batch(&predictions, &targets).unwrap();
    assert_eq!(indices, vec![MatchIndices::default(); 2]);
}

#[test]
fn test_blocks_do_not_leak_across_examples() {
    // example 1's query 0 is a perfect copy of example 0's target, which
    // must not matter because cross-example pairs are discarded
    let matcher = HungarianMatcher::new(1.0, 1.0, 1.0).unwrap();
    let a = [0.2, 0.2, 0.01, 0.01, 0.0];
    let b = [0.8, 0.8, 0.02, 0.01, 0.0];
    let predictions = Predictions::from_examples(
        &[
            logits(&[&[4.0, -4.0], &[-4.0, -4.0]]),
            logits(&[&[4.0, -4.0], &[-4.0, 4.0]]),
        ],
        &[
            moments(&[a, [0.5, 0.5, 0.03, 0.03, 0.0]]),
            moments(&[a, b]),
        ],
    )
    .unwrap();
    let targets = [
        Target::new(vec![0], moments(&[a])),
        Target::new(vec![1], moments(&[b])),
    ];

    let indices = matcher.match_batch(&predictions, &targets).unwrap();
    assert_eq!(indices[0].prediction_indices, vec![0]);
    assert_eq!(indices[0].target_indices, vec![0]);
    assert_eq!(indices[1].prediction_indices, vec![1]);
    assert_eq!(indices[1].target_indices, vec![0]);
}

#[test]
fn test_label_out_of_range_in_later_example() {
    let matcher = HungarianMatcher::new(1.0, 1.0, 1.0).unwrap();
    let m = [0.5, 0.5, 0.01, 0.01, 0.0];
    let predictions = Predictions::new(
        2,
        1,
        DMatrix::zeros(2, 3),
        moments(&[m, m]),
    )
    .unwrap();
    let targets = [
        Target::new(vec![2], moments(&[m])),
        Target::new(vec![3], moments(&[m])),
    ];
    assert_eq!(
        matcher.match_batch(&predictions, &targets),
        Err(MatchError::LabelOutOfRange {
            example: 1,
            label: 3,
            num_classes: 3
        })
    );
}

/*------------------------------------------------------------------------------
Properties
------------------------------------------------------------------------------*/

fn random_moment<R: Rng>(rng: &mut R) -> [f64; MOMENT_DIM] {
    let var_x = rng.gen_range(0.001..0.05);
    let var_y = rng.gen_range(0.001..0.05);
    let rho: f64 = rng.gen_range(-0.9..0.9);
    [
        rng.gen_range(0.0..1.0),
        rng.gen_range(0.0..1.0),
        var_x,
        var_y,
        rho * (var_x * var_y).sqrt(),
    ]
}

fn random_batch<R: Rng>(
    rng: &mut R,
    batch_size: usize,
    num_queries: usize,
    num_classes: usize,
) -> (Predictions, Vec<Target>) {
    let rows = batch_size * num_queries;
    let pred_logits =
        DMatrix::from_fn(rows, num_classes, |_, _| rng.gen_range(-5.0..5.0));
    let pred_moments: Vec<_> = (0..rows).map(|_| random_moment(rng)).collect();
    let predictions = Predictions::new(
        batch_size,
        num_queries,
        pred_logits,
        moments(&pred_moments),
    )
    .unwrap();

    let targets = (0..batch_size)
        .map(|_| {
            let n = rng.gen_range(0..=6);
            let labels = (0..n).map(|_| rng.gen_range(0..num_classes)).collect();
            let m: Vec<_> = (0..n).map(|_| random_moment(rng)).collect();
            Target::new(labels, moments(&m))
        })
        .collect();
    (predictions, targets)
}

fn brute_force_min(cost: &DMatrix<f64>) -> f64 {
    let t = if cost.nrows() <= cost.ncols() {
        cost.clone()
    } else {
        cost.transpose()
    };
    fn go(t: &DMatrix<f64>, row: usize, used: &mut [bool], acc: f64) -> f64 {
        if row == t.nrows() {
            return acc;
        }
        let mut best = f64::INFINITY;
        for j in 0..t.ncols() {
            if !used[j] {
                used[j] = true;
                best = best.min(go(t, row + 1, used, acc + t[(row, j)]));
                used[j] = false;
            }
        }
        best
    }
    go(&t, 0, &mut vec![false; t.ncols()], 0.0)
}

#[test]
fn test_quickcheck_match_batch_invariants() {
    fn prop(_: usize) -> bool {
        let mut rng = rand::thread_rng();
        let batch_size = rng.gen_range(1..=4);
        let num_queries = rng.gen_range(0..=6);
        let num_classes = rng.gen_range(1..=4);
        let (predictions, targets) =
            random_batch(&mut rng, batch_size, num_queries, num_classes);

        let mut g = Gen::new(10);
        let mut w = || (u8::arbitrary(&mut g) % 5) as f64 + 0.5;
        let matcher = HungarianMatcher::new(w(), w(), w()).unwrap();

        let Ok(indices) = matcher.match_batch(&predictions, &targets) else {
            return false;
        };
        let cost = matcher.cost_matrix(&predictions, &targets).unwrap();

        let mut start = 0;
        for (example, (found, target)) in indices.iter().zip(&targets).enumerate() {
            let n = target.len();
            assert_valid(found, num_queries, n);
            if num_queries > 0 && n > 0 {
                let block = cost
                    .view((example * num_queries, start), (num_queries, n))
                    .clone_owned();
                let total: f64 = found
                    .pairs()
                    .map(|(i, j)| block[(i as usize, j as usize)])
                    .sum();
                if (total - brute_force_min(&block)).abs() > 1e-6 {
                    return false;
                }
                // same answer as solving the block on its own
                let direct = linear_sum_assignment(&block).unwrap();
                if MatchIndices::from(direct) != *found {
                    return false;
                }
            }
            start += n;
        }
        indices.len() == batch_size
    }
    quickcheck::QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(usize) -> bool);
}
