//! Hungarian matching between predicted and ground-truth objects.
//!
//! The matcher flattens the batch, builds one dense cost matrix for all
//! `(prediction, target)` pairs, and solves one assignment problem per
//! example on its block of that matrix.

use crate::assignment::{linear_sum_assignment, Assignment};
use crate::cost::{
    focal_class_cost, kl_moment_cost, l1_moment_cost, CostWeights,
    DEFAULT_KL_PENALTY, FOCAL_ALPHA, FOCAL_GAMMA,
};
use crate::error::MatchError;
use crate::moments::{MomentScale, MOMENT_DIM};
use log::{debug, trace, warn};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::Deserialize;

/*------------------------------------------------------------------------------
Inputs
------------------------------------------------------------------------------*/

/// Network outputs for a whole batch, flattened over `(batch, query)`.
///
/// Row `b * num_queries + q` of both matrices belongs to query `q` of
/// example `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    batch_size: usize,
    num_queries: usize,
    logits: DMatrix<f64>,
    moments: DMatrix<f64>,
}

impl Predictions {
    /// Wraps already flattened `(batch * queries, classes)` logits and
    /// `(batch * queries, 5)` moments.
    pub fn new(
        batch_size: usize,
        num_queries: usize,
        logits: DMatrix<f64>,
        moments: DMatrix<f64>,
    ) -> Result<Self, MatchError> {
        let rows = batch_size * num_queries;
        if logits.nrows() != rows {
            return Err(MatchError::ShapeMismatch(format!(
                "logits have {} rows, expected batch_size * num_queries = {}",
                logits.nrows(),
                rows
            )));
        }
        if moments.nrows() != rows {
            return Err(MatchError::ShapeMismatch(format!(
                "moments have {} rows, expected batch_size * num_queries = {}",
                moments.nrows(),
                rows
            )));
        }
        if moments.ncols() != MOMENT_DIM {
            return Err(MatchError::ShapeMismatch(format!(
                "predicted moments have {} columns, expected {}",
                moments.ncols(),
                MOMENT_DIM
            )));
        }
        Ok(Self {
            batch_size,
            num_queries,
            logits,
            moments,
        })
    }

    /// Stacks one `(queries, classes)` logit matrix and one `(queries, 5)`
    /// moment matrix per example.
    pub fn from_examples(
        logits: &[DMatrix<f64>],
        moments: &[DMatrix<f64>],
    ) -> Result<Self, MatchError> {
        if logits.len() != moments.len() {
            return Err(MatchError::ShapeMismatch(format!(
                "{} logit matrices but {} moment matrices",
                logits.len(),
                moments.len()
            )));
        }
        let batch_size = logits.len();
        let num_queries = logits.first().map_or(0, |l| l.nrows());
        let num_classes = logits.first().map_or(0, |l| l.ncols());

        for (b, (l, m)) in logits.iter().zip(moments).enumerate() {
            if l.shape() != (num_queries, num_classes) {
                return Err(MatchError::ShapeMismatch(format!(
                    "logits of example {} are {:?}, expected {:?}",
                    b,
                    l.shape(),
                    (num_queries, num_classes)
                )));
            }
            if m.shape() != (num_queries, MOMENT_DIM) {
                return Err(MatchError::ShapeMismatch(format!(
                    "moments of example {} are {:?}, expected {:?}",
                    b,
                    m.shape(),
                    (num_queries, MOMENT_DIM)
                )));
            }
        }

        let rows = batch_size * num_queries;
        let flat_logits = DMatrix::from_fn(rows, num_classes, |r, c| {
            logits[r / num_queries][(r % num_queries, c)]
        });
        let flat_moments = DMatrix::from_fn(rows, MOMENT_DIM, |r, c| {
            moments[r / num_queries][(r % num_queries, c)]
        });
        Self::new(batch_size, num_queries, flat_logits, flat_moments)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_queries(&self) -> usize {
        self.num_queries
    }

    pub fn num_classes(&self) -> usize {
        self.logits.ncols()
    }

    pub fn logits(&self) -> &DMatrix<f64> {
        &self.logits
    }

    pub fn moments(&self) -> &DMatrix<f64> {
        &self.moments
    }
}

/// Ground-truth objects of one example.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub labels: Vec<usize>,
    /// `(labels.len(), 5)` normalized moment vectors
    pub moments: DMatrix<f64>,
}

impl Target {
    pub fn new(labels: Vec<usize>, moments: DMatrix<f64>) -> Self {
        Self { labels, moments }
    }

    /// An example without any object.
    pub fn empty() -> Self {
        Self {
            labels: Vec::new(),
            moments: DMatrix::zeros(0, MOMENT_DIM),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/*------------------------------------------------------------------------------
Output
------------------------------------------------------------------------------*/

/// Matched `(prediction, target)` indices of one example.
///
/// `prediction_indices` is strictly increasing; `target_indices[k]` is the
/// target matched to `prediction_indices[k]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchIndices {
    pub prediction_indices: Vec<i64>,
    pub target_indices: Vec<i64>,
}

impl MatchIndices {
    pub fn len(&self) -> usize {
        self.prediction_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prediction_indices.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.prediction_indices
            .iter()
            .copied()
            .zip(self.target_indices.iter().copied())
    }
}

impl From<Assignment> for MatchIndices {
    fn from(assignment: Assignment) -> Self {
        Self {
            prediction_indices: assignment
                .rows
                .into_iter()
                .map(|i| i as i64)
                .collect(),
            target_indices: assignment
                .cols
                .into_iter()
                .map(|j| j as i64)
                .collect(),
        }
    }
}

/*------------------------------------------------------------------------------
Configuration
------------------------------------------------------------------------------*/

/// Matcher settings as they appear in a training configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub cost_class: f64,
    pub cost_moments: f64,
    pub cost_kl: f64,
    pub focal_alpha: f64,
    pub focal_gamma: f64,
    pub kl_penalty: f64,
    pub moment_scale: MomentScale,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            cost_class: 1.0,
            cost_moments: 1.0,
            cost_kl: 1.0,
            focal_alpha: FOCAL_ALPHA,
            focal_gamma: FOCAL_GAMMA,
            kl_penalty: DEFAULT_KL_PENALTY,
            moment_scale: MomentScale::default(),
        }
    }
}

/*------------------------------------------------------------------------------
HungarianMatcher
------------------------------------------------------------------------------*/

/// One-to-one matcher between predictions and targets.
///
/// Targets never include a "no object" entry, so there are usually more
/// predictions than targets; the unmatched predictions are background.
#[derive(Debug, Clone)]
pub struct HungarianMatcher {
    weights: CostWeights,
    focal_alpha: f64,
    focal_gamma: f64,
    kl_penalty: f64,
    moment_scale: MomentScale,
}

impl HungarianMatcher {
    /// Creates a matcher with the given cost weights.
    ///
    /// # Arguments
    /// * `cost_class` - Weight of the focal classification cost
    /// * `cost_moments` - Weight of the L1 distance between moment vectors
    /// * `cost_kl` - Weight of the KL divergence between moment Gaussians
    ///
    /// Weights must be finite and non-negative, and not all zero.
    ///
    /// # Example
    /// ```
    /// use momentmatch_rs::HungarianMatcher;
    /// let matcher = HungarianMatcher::new(2.0, 5.0, 1.0).unwrap();
    /// assert!(HungarianMatcher::new(0.0, 0.0, 0.0).is_err());
    /// ```
    pub fn new(
        cost_class: f64,
        cost_moments: f64,
        cost_kl: f64,
    ) -> Result<Self, MatchError> {
        let weights = [
            ("cost_class", cost_class),
            ("cost_moments", cost_moments),
            ("cost_kl", cost_kl),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(MatchError::InvalidConfig(format!(
                    "{} must be finite and non-negative, got {}",
                    name, w
                )));
            }
        }
        if weights.iter().all(|&(_, w)| w == 0.0) {
            return Err(MatchError::InvalidConfig(
                "all costs cant be 0".to_string(),
            ));
        }

        Ok(Self {
            weights: CostWeights {
                class: cost_class,
                moments: cost_moments,
                kl: cost_kl,
            },
            focal_alpha: FOCAL_ALPHA,
            focal_gamma: FOCAL_GAMMA,
            kl_penalty: DEFAULT_KL_PENALTY,
            moment_scale: MomentScale::default(),
        })
    }

    /// Builds a matcher from its configuration section.
    pub fn from_config(config: &MatcherConfig) -> Result<Self, MatchError> {
        Self::new(config.cost_class, config.cost_moments, config.cost_kl)?
            .with_focal(config.focal_alpha, config.focal_gamma)?
            .with_kl_penalty(config.kl_penalty)?
            .with_moment_scale(config.moment_scale)
    }

    /// Set focal cost parameters (default: alpha 0.25, gamma 2.0).
    pub fn with_focal(self, alpha: f64, gamma: f64) -> Result<Self, MatchError> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(MatchError::InvalidConfig(format!(
                "focal alpha must be within [0, 1], got {}",
                alpha
            )));
        }
        if !gamma.is_finite() || gamma < 0.0 {
            return Err(MatchError::InvalidConfig(format!(
                "focal gamma must be finite and non-negative, got {}",
                gamma
            )));
        }
        Ok(Self {
            focal_alpha: alpha,
            focal_gamma: gamma,
            ..self
        })
    }

    /// Set the value that replaces non-finite KL entries (default: 1000).
    pub fn with_kl_penalty(self, kl_penalty: f64) -> Result<Self, MatchError> {
        if !kl_penalty.is_finite() {
            return Err(MatchError::InvalidConfig(format!(
                "kl_penalty must be finite, got {}",
                kl_penalty
            )));
        }
        Ok(Self { kl_penalty, ..self })
    }

    /// Set the image extent used to denormalize moments.
    pub fn with_moment_scale(
        self,
        moment_scale: MomentScale,
    ) -> Result<Self, MatchError> {
        let MomentScale { width, height } = moment_scale;
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0)
        {
            return Err(MatchError::InvalidConfig(format!(
                "moment scale must be finite and positive, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            moment_scale,
            ..self
        })
    }

    pub fn weights(&self) -> CostWeights {
        self.weights
    }

    pub fn kl_penalty(&self) -> f64 {
        self.kl_penalty
    }

    pub fn moment_scale(&self) -> MomentScale {
        self.moment_scale
    }

    fn validate(
        predictions: &Predictions,
        targets: &[Target],
    ) -> Result<(), MatchError> {
        if targets.len() != predictions.batch_size() {
            return Err(MatchError::ShapeMismatch(format!(
                "{} targets for a batch of {}",
                targets.len(),
                predictions.batch_size()
            )));
        }
        let num_classes = predictions.num_classes();
        for (example, target) in targets.iter().enumerate() {
            if target.moments.ncols() != MOMENT_DIM {
                return Err(MatchError::ShapeMismatch(format!(
                    "target moments of example {} have {} columns, expected {}",
                    example,
                    target.moments.ncols(),
                    MOMENT_DIM
                )));
            }
            if target.moments.nrows() != target.labels.len() {
                return Err(MatchError::ShapeMismatch(format!(
                    "example {} has {} labels but {} moment vectors",
                    example,
                    target.labels.len(),
                    target.moments.nrows()
                )));
            }
            if let Some(&label) =
                target.labels.iter().find(|&&c| c >= num_classes)
            {
                return Err(MatchError::LabelOutOfRange {
                    example,
                    label,
                    num_classes,
                });
            }
        }
        Ok(())
    }

    /// Combined `(batch * queries, sum(n_i))` cost matrix of the batch.
    pub fn cost_matrix(
        &self,
        predictions: &Predictions,
        targets: &[Target],
    ) -> Result<DMatrix<f64>, MatchError> {
        Self::validate(predictions, targets)?;

        // Also concat the target labels and moments
        let total: usize = targets.iter().map(Target::len).sum();
        let tgt_labels: Vec<usize> = targets
            .iter()
            .flat_map(|t| t.labels.iter().copied())
            .collect();
        let mut tgt_moments = DMatrix::zeros(total, MOMENT_DIM);
        let mut offset = 0;
        for target in targets.iter().filter(|t| !t.is_empty()) {
            tgt_moments
                .view_mut((offset, 0), (target.len(), MOMENT_DIM))
                .copy_from(&target.moments);
            offset += target.len();
        }

        let cost_class = focal_class_cost(
            predictions.logits(),
            &tgt_labels,
            self.focal_alpha,
            self.focal_gamma,
        );
        let cost_moments = l1_moment_cost(predictions.moments(), &tgt_moments);
        let (cost_kl, replaced) = kl_moment_cost(
            predictions.moments(),
            &tgt_moments,
            &self.moment_scale,
            self.kl_penalty,
        );
        if replaced > 0 {
            debug!(
                "replaced {} non-finite KL entries with penalty {}",
                replaced, self.kl_penalty
            );
        }
        debug!(
            "cost matrix {}x{} for a batch of {}",
            cost_class.nrows(),
            cost_class.ncols(),
            predictions.batch_size()
        );

        Ok(self.weights.combine(&cost_class, &cost_moments, &cost_kl))
    }

    /// Performs the matching.
    ///
    /// Returns one [`MatchIndices`] per example, each of length
    /// `min(num_queries, num_targets)`.
    pub fn match_batch(
        &self,
        predictions: &Predictions,
        targets: &[Target],
    ) -> Result<Vec<MatchIndices>, MatchError> {
        let cost = self.cost_matrix(predictions, targets)?;
        let num_queries = predictions.num_queries();

        let sizes: Vec<usize> = targets.iter().map(Target::len).collect();
        let starts: Vec<usize> = sizes
            .iter()
            .scan(0, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect();

        sizes
            .par_iter()
            .zip(starts.par_iter())
            .enumerate()
            .map(|(example, (&n, &start))| {
                if num_queries == 0 || n == 0 {
                    return Ok(MatchIndices::default());
                }
                let block = cost
                    .view((example * num_queries, start), (num_queries, n))
                    .clone_owned();
                if block.iter().any(|c| !c.is_finite()) {
                    warn!("non-finite matching cost in example {}", example);
                    return Err(MatchError::NonFiniteCost { example });
                }
                let assignment = linear_sum_assignment(&block)?;
                trace!(
                    "example {}: matched {} of {} queries to {} targets",
                    example,
                    assignment.len(),
                    num_queries,
                    n
                );
                Ok(MatchIndices::from(assignment))
            })
            .collect()
    }

    /// Matches a single example given its `(queries, classes)` logits and
    /// `(queries, 5)` moments.
    pub fn match_example(
        &self,
        logits: &DMatrix<f64>,
        moments: &DMatrix<f64>,
        target: &Target,
    ) -> Result<MatchIndices, MatchError> {
        let predictions = Predictions::new(
            1,
            logits.nrows(),
            logits.clone(),
            moments.clone(),
        )?;
        let mut indices =
            self.match_batch(&predictions, std::slice::from_ref(target))?;
        Ok(indices.pop().unwrap_or_default())
    }
}
