// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-lre
//!
//! Linear relational embeddings for language models in Rust, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A linear relational embedding (LRE) is an affine map `z ≈ W·h + b` from
//! the hidden state `h` of a subject (at one layer, on the subject's last
//! token) to the final representation `z` that decides the relation's
//! object. candle-lre estimates `(W, b)` per relation from Jacobians over
//! few-shot prompts, then measures
//!
//! - **faithfulness**: does decoding `W·h + b` reproduce the model's own
//!   prediction?
//! - **causality**: does moving `h` along a rank-truncated pseudo-inverse of
//!   `W` make the model predict another subject's object?
//!
//! ## Backends
//!
//! Models plug in through [`LreBackend`], a hook-aware forward pass with
//! activation capture and single-position replacement. The bundled
//! [`TokenShiftLm`](token_shift::TokenShiftLm) backend loads from a
//! `config.json` / `model.safetensors` / `tokenizer.json` directory, and
//! [`synthetic`] builds hand-wired token-shift models with known relations.
//!
//! ## Example
//!
//! ```
//! use candle_lre::lre::{JacobianIclMeanEstimator, LowRankPInvEditor, EditRequest};
//! use candle_lre::synthetic::SyntheticWorld;
//!
//! # fn main() -> candle_lre::Result<()> {
//! let world = SyntheticWorld::capitals()?;
//! let model = world.model();
//! let relation = world.relation("country capital city").unwrap();
//! let train = relation.with_samples(relation.samples[..5].to_vec());
//!
//! let operator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5)
//!     .estimate(&train)?;
//! let out = operator.apply(model, "Norway", 3)?;
//! assert_eq!(out.predictions[0].token, "Oslo");
//!
//! let editor = LowRankPInvEditor::new(model, &operator, model.hidden_size())?;
//! let edited = editor.edit(&EditRequest::new("Norway", "Peru"))?;
//! assert_eq!(edited.predictions[0].token, "Lima");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod hooks;
pub mod interp;
pub mod lre;
pub mod synthetic;
pub mod token_shift;
pub mod tokenizer;
pub mod util;

// --- Public re-exports ---------------------------------------------------

// Backend
pub use backend::{EncodedQuery, JacobianPoint, LreBackend, LreModel, SubjectQuery};

// Cache
pub use cache::{SubjectState, SubjectStateCache};

// Config
pub use config::EvalConfig;

// Data
pub use data::{Relation, RelationDataset, RelationProperties, Sample, SplitPolicy};

// Error
pub use error::{LreError, Result};

// Evaluation
pub use eval::{Evaluator, PairingPolicy, RelationOutcome, RunRecord, evaluate};

// Hooks
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};

// Interpretability
pub use interp::intervention::{ActivationPatch, kl_divergence};
pub use interp::logit_lens::TokenPrediction;

// LRE
pub use lre::{
    DeltaSource, EditRequest, EditResult, JacobianIclMeanEstimator, LinearRelationOperator,
    LowRankPInvEditor, SvdFactors, is_nontrivial_prefix,
};

// Tokenizer
pub use tokenizer::LreTokenizer;
pub use util::positioning::EncodingWithOffsets;
