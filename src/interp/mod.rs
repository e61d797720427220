// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability tools used by the relation pipeline.
//!
//! - [`intervention`]: single-position activation patches and
//!   distribution comparisons.
//! - [`logit_lens`]: decoding representations into ranked tokens.

pub mod intervention;
pub mod logit_lens;
