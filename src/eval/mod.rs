// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation orchestration.
//!
//! [`Evaluator`] takes each relation through split, estimation, knowledge
//! filtering, faithfulness and causality, producing a typed
//! [`RelationOutcome`]. Outcomes aggregate into a [`RunRecord`] that is
//! written once as JSON.
//!
//! ```no_run
//! use candle_lre::eval::evaluate;
//! use candle_lre::synthetic::SyntheticWorld;
//! use candle_lre::EvalConfig;
//!
//! # fn main() -> candle_lre::Result<()> {
//! let world = SyntheticWorld::atlas()?;
//! let config = EvalConfig { layer: world.source_layer(), ..EvalConfig::default() };
//! let record = evaluate(world.model(), world.dataset(), config)?;
//! record.write_json("results/run.json")?;
//! # Ok(())
//! # }
//! ```

mod orchestrator;
mod pairing;
mod record;

pub use orchestrator::{Evaluator, evaluate};
pub use pairing::{PairingPolicy, random_edit_targets};
pub use record::{
    CausalityRecord, FaithfulnessRecord, RelationEvaluation, RelationOutcome, RelationStage,
    RunRecord, RunSummary, SkipReason, SkippedRelation,
};
