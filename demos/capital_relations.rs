// SPDX-License-Identifier: MIT OR Apache-2.0

//! Faithfulness and causality on a hand-wired relational world.
//!
//! ```bash
//! RUST_LOG=candle_lre=info cargo run --example capital_relations -- results/run.json
//! ```
//!
//! Builds a synthetic token-shift model that knows two relations (country
//! capitals and country languages) plus one subject it does not know,
//! evaluates both relations with a causality rank sweep, prints a summary
//! and optionally writes the run record to the path given as the first
//! argument.

use candle_lre::interp::logit_lens::format_predictions;
use candle_lre::synthetic::SyntheticWorld;
use candle_lre::{EvalConfig, JacobianIclMeanEstimator, evaluate};
use tracing_subscriber::EnvFilter;

fn main() -> candle_lre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("candle_lre=info")),
        )
        .init();

    let world = SyntheticWorld::atlas()?;
    let model = world.model();
    println!(
        "synthetic model: {} layers, hidden size {}, {} relations",
        model.num_layers(),
        model.hidden_size(),
        world.dataset().len()
    );

    // A single operator, applied by hand.
    if let Some(relation) = world.relation("country capital city") {
        let train = relation.with_samples(relation.samples.iter().take(5).cloned().collect());
        let operator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5)
            .estimate(&train)?;
        for subject in ["Norway", "Atlantis"] {
            let out = operator.apply(model, subject, 3)?;
            println!("  LRE({subject}) -> {}", format_predictions(&out.predictions));
        }
    }

    let config = EvalConfig {
        model_id: model.model_id().to_string(),
        layer: world.source_layer(),
        causality_ranks: vec![1, 2, 4, 8],
        ..EvalConfig::default()
    };
    let record = evaluate(model, world.dataset(), config)?;

    for name in world.dataset().names() {
        let Some(faith) = record.faithfulness.get(name) else {
            continue;
        };
        println!(
            "{name}: faithfulness {:.2} ({}/{})",
            faith.score, faith.hits, faith.trials
        );
        for causality in record.causality.get(name).into_iter().flatten() {
            println!(
                "    rank {:>3} (effective {:>2}): causality {:.2} ({}/{})",
                causality.rank,
                causality.effective_rank,
                causality.score,
                causality.hits,
                causality.trials
            );
        }
    }
    for skipped in &record.skipped {
        println!(
            "skipped {} at {:?}: {}",
            skipped.relation, skipped.stage, skipped.reason
        );
    }
    if let (Some(faith), Some(causal)) = (
        record.summary.mean_faithfulness,
        record.summary.mean_causality,
    ) {
        println!("mean faithfulness {faith:.3}, mean causality {causal:.3}");
    }

    if let Some(path) = std::env::args().nth(1) {
        record.write_json(&path)?;
        println!("run record written to {path}");
    }
    Ok(())
}
