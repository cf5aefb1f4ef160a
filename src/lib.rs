pub mod assignment;
pub mod cost;
pub mod error;
pub mod matcher;
pub mod moments;

mod lapjv;

#[cfg(test)]
mod test_matcher;

pub use assignment::{linear_sum_assignment, Assignment};
pub use cost::CostWeights;
pub use error::MatchError;
pub use matcher::{
    HungarianMatcher, MatchIndices, MatcherConfig, Predictions, Target,
};
pub use moments::{
    kl_divergence_batched, moments_to_cov, Gaussian, MomentScale, MOMENT_DIM,
};
