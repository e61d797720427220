// SPDX-License-Identifier: MIT OR Apache-2.0

//! Linear relational embeddings: estimation, application, filtering and
//! low-rank editing.
//!
//! - [`prompt`]: few-shot prompt rendering.
//! - [`estimator`]: [`JacobianIclMeanEstimator`] averages Jacobians over
//!   leave-one-out few-shot prompts into a [`LinearRelationOperator`].
//! - [`operator`]: applies `W·h + b` and decodes the result.
//! - [`filter`]: keeps the samples the unedited model already knows.
//! - [`svd`] and [`editor`]: rank-truncated pseudo-inverse edits from a
//!   decomposition computed once per operator.

pub mod editor;
pub mod estimator;
pub mod filter;
pub mod operator;
pub mod prompt;
pub mod svd;

pub use editor::{DeltaSource, EditRequest, EditResult, LowRankPInvEditor};
pub use estimator::{JacobianIclMeanEstimator, MIN_TRAIN_SAMPLES};
pub use filter::{filter_known_samples, is_nontrivial_prefix};
pub use operator::{LinearRelationOperator, OperatorOutput};
pub use svd::SvdFactors;
