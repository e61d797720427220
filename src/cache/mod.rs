// SPDX-License-Identifier: MIT OR Apache-2.0

//! Precomputed subject representations.
//!
//! - [`SubjectState`]: `h` and `z` for one subject under one prompt.
//! - [`SubjectStateCache`]: states keyed by subject, shared by the
//!   faithfulness and causality passes of a relation.

mod activation;

pub use activation::{SubjectState, SubjectStateCache};
