// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: estimate, apply, edit and evaluate relations end to
//! end on hand-wired synthetic token-shift models.
//!
//! Run:
//!   `cargo test --test relation_eval`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::as_conversions,
    missing_docs
)]

use candle_core::Device;
use candle_lre::eval::{Evaluator, RelationOutcome, RunRecord, SkipReason};
use candle_lre::lre::{
    EditRequest, JacobianIclMeanEstimator, LowRankPInvEditor, filter_known_samples,
    is_nontrivial_prefix,
};
use candle_lre::synthetic::SyntheticWorld;
use candle_lre::{EvalConfig, LreModel, RelationDataset, Sample, SplitPolicy, evaluate};
use rand::SeedableRng;
use rand::rngs::StdRng;

const CAPITALS: &str = "country capital city";
const LANGUAGES: &str = "country language";

fn config_for(world: &SyntheticWorld) -> EvalConfig {
    EvalConfig {
        model_id: world.model().model_id().to_string(),
        layer: world.source_layer(),
        ..EvalConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

#[test]
fn country_capital_end_to_end() {
    let world = SyntheticWorld::capitals().unwrap();
    let model = world.model();
    let relation = world.relation(CAPITALS).unwrap();
    assert_eq!(relation.len(), 10);

    let mut rng = StdRng::seed_from_u64(12_345);
    let (train, test) = relation.split(5, SplitPolicy::Shuffled, &mut rng).unwrap();
    let operator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5)
        .estimate(&train)
        .unwrap();

    let d = model.hidden_size();
    assert_eq!(operator.shape().unwrap(), (d, d));
    assert_eq!(operator.n_train(), 5);

    for sample in &test.samples {
        let out = operator.apply(model, &sample.subject, 5).unwrap();
        assert!(!out.predictions.is_empty());
        assert!(
            is_nontrivial_prefix(&out.predictions[0].token, &sample.object),
            "{} -> {:?}",
            sample.subject,
            out.predictions[0].token
        );
    }
}

#[test]
fn apply_batch_matches_single_application() {
    let world = SyntheticWorld::capitals().unwrap();
    let model = world.model();
    let relation = world.relation(CAPITALS).unwrap();
    let train = relation.with_samples(relation.samples[..5].to_vec());
    let operator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5)
        .estimate(&train)
        .unwrap();

    let subjects: Vec<String> = relation.samples[5..].iter().map(|s| s.subject.clone()).collect();
    let batched = operator.apply_batch(model, &subjects, 3, 2).unwrap();
    assert_eq!(batched.len(), subjects.len());
    for (subject, out) in subjects.iter().zip(&batched) {
        let single = operator.apply(model, subject, 3).unwrap();
        assert_eq!(&out.subject, subject);
        let tokens: Vec<_> = out.predictions.iter().map(|p| &p.token).collect();
        let expected: Vec<_> = single.predictions.iter().map(|p| &p.token).collect();
        assert_eq!(tokens, expected);
    }
}

#[test]
fn operators_are_independent_per_relation() {
    let world = SyntheticWorld::atlas().unwrap();
    let model = world.model();
    let capitals = world.relation(CAPITALS).unwrap();
    let languages = world.relation(LANGUAGES).unwrap();

    let estimator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5);
    let cap_op = estimator
        .estimate(&capitals.with_samples(capitals.samples[..5].to_vec()))
        .unwrap();
    let lang_op = estimator
        .estimate(&languages.with_samples(languages.samples[..5].to_vec()))
        .unwrap();

    assert_eq!(cap_op.relation_name(), CAPITALS);
    assert_eq!(lang_op.relation_name(), LANGUAGES);
    assert!(lang_op.prompt_template().starts_with("People in"));
    let out = lang_op.apply(model, "Russia", 1).unwrap();
    assert_eq!(out.predictions[0].token, "Russian");
}

// ---------------------------------------------------------------------------
// Editing
// ---------------------------------------------------------------------------

#[test]
fn causality_is_monotone_in_rank() {
    let world = SyntheticWorld::capitals().unwrap();
    let model = world.model();
    let relation = world.relation(CAPITALS).unwrap();
    let operator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5)
        .estimate(&relation.with_samples(relation.samples[..5].to_vec()))
        .unwrap();

    // Every ordered pair of distinct subjects.
    let pairs: Vec<_> = relation
        .samples
        .iter()
        .flat_map(|s| relation.samples.iter().map(move |t| (s, t)))
        .filter(|(s, t)| s.subject != t.subject)
        .collect();

    let editor = LowRankPInvEditor::new(model, &operator, 1).unwrap();
    let mut previous = 0.0;
    for rank in [1, 2, 4, 6, 8, 10] {
        let ranked = editor.with_rank(rank).unwrap();
        let hits = pairs
            .iter()
            .filter(|(s, t)| {
                let result = ranked
                    .edit(&EditRequest::new(s.subject.clone(), t.subject.clone()))
                    .unwrap();
                is_nontrivial_prefix(&result.predictions[0].token, &t.object)
            })
            .count();
        let score = hits as f64 / pairs.len() as f64;
        assert!(score >= previous, "rank {rank}: {score} < {previous}");
        previous = score;
    }
    assert!((previous - 1.0).abs() < f64::EPSILON);
}

#[test]
fn full_rank_causality_matches_target_faithfulness() {
    let world = SyntheticWorld::capitals().unwrap();
    let model = world.model();
    let relation = world.relation(CAPITALS).unwrap();
    let train = relation.with_samples(relation.samples[..5].to_vec());
    let operator = JacobianIclMeanEstimator::new(model, world.source_layer(), 2.5)
        .estimate(&train)
        .unwrap();
    let editor = LowRankPInvEditor::new(model, &operator, model.hidden_size()).unwrap();

    for (source, target) in relation.samples.iter().zip(relation.samples.iter().rev()) {
        if source.subject == target.subject {
            continue;
        }
        let edited = editor
            .edit(&EditRequest::new(source.subject.clone(), target.subject.clone()))
            .unwrap();
        let direct = operator.apply(model, &target.subject, 1).unwrap();
        assert_eq!(edited.predictions[0].token, direct.predictions[0].token);
    }
}

// ---------------------------------------------------------------------------
// Filtering and orchestration
// ---------------------------------------------------------------------------

#[test]
fn filter_keeps_known_samples_only() {
    let world = SyntheticWorld::atlas().unwrap();
    let relation = world.relation(CAPITALS).unwrap();
    let train = relation.with_samples(relation.samples[..5].to_vec());
    let test = relation.with_samples(relation.samples[5..].to_vec());
    let operator = JacobianIclMeanEstimator::new(world.model(), world.source_layer(), 2.5)
        .estimate(&train)
        .unwrap();

    let kept = filter_known_samples(world.model(), &test, operator.prompt_template(), 4).unwrap();
    assert_eq!(kept.len(), test.len() - 1);
    assert!(kept.samples.iter().all(|s| s.subject != "Atlantis"));
}

#[test]
fn full_run_scores_both_relations_and_skips_short_ones() {
    let world = SyntheticWorld::atlas().unwrap();
    let mut relations = world.dataset().relations().to_vec();
    let short = relations[0].with_samples(relations[0].samples[..4].to_vec());
    relations.push(candle_lre::Relation {
        name: "short relation".into(),
        ..short
    });
    let dataset = RelationDataset::from_relations(relations).unwrap();

    let config = EvalConfig {
        causality_ranks: vec![1, 4],
        ..config_for(&world)
    };
    let record = evaluate(world.model(), &dataset, config).unwrap();

    assert_eq!(record.summary.evaluated, 2);
    assert_eq!(record.summary.skipped, 1);
    assert_eq!(record.skipped[0].relation, "short relation");
    assert_eq!(record.model_id, "synthetic-token-shift");

    for name in [CAPITALS, LANGUAGES] {
        let faith = &record.faithfulness[name];
        assert!((0.0..=1.0).contains(&faith.score));
        assert!(faith.score >= 0.8, "{name}: {}", faith.score);

        let causality = &record.causality[name];
        assert_eq!(
            causality.iter().map(|c| c.rank).collect::<Vec<_>>(),
            vec![100, 1, 4]
        );
        for c in causality {
            assert!((0.0..=1.0).contains(&c.score));
        }
        assert!((causality[0].score - 1.0).abs() < f64::EPSILON);
        assert!(causality[1].score <= causality[2].score);
    }
    assert!(record.summary.mean_faithfulness.unwrap() >= 0.8);
    assert_eq!(record.summary.mean_causality_by_rank.len(), 3);
}

#[test]
fn a_broken_relation_does_not_abort_the_run() {
    let world = SyntheticWorld::capitals().unwrap();
    let capitals = world.relation(CAPITALS).unwrap();
    let mut samples = capitals.samples.clone();
    samples[9] = Sample::new("", "is");
    let broken = candle_lre::Relation {
        name: "broken relation".into(),
        ..capitals.with_samples(samples)
    };
    let dataset = RelationDataset::from_relations(vec![capitals.clone(), broken]).unwrap();

    let record = evaluate(world.model(), &dataset, config_for(&world)).unwrap();

    assert_eq!(record.summary.evaluated + record.summary.skipped, 2);
    assert!((record.faithfulness[CAPITALS].score - 1.0).abs() < f64::EPSILON);
    assert!(record.causality.contains_key(CAPITALS));
    if let Some(skipped) = record.skipped.first() {
        assert_eq!(skipped.relation, "broken relation");
        assert!(matches!(skipped.reason, SkipReason::Failed { .. }));
    } else {
        assert!(record.faithfulness["broken relation"].skipped <= 1);
    }
}

#[test]
fn relation_results_do_not_depend_on_order() {
    let world = SyntheticWorld::atlas().unwrap();
    let forward = world.dataset().clone();
    let mut reversed_relations = forward.relations().to_vec();
    reversed_relations.reverse();
    let reversed = RelationDataset::from_relations(reversed_relations).unwrap();

    let evaluator = Evaluator::new(world.model(), config_for(&world)).unwrap();
    let a = evaluator.run(&forward).unwrap();
    let b = evaluator.run(&reversed).unwrap();
    assert_eq!(a.faithfulness, b.faithfulness);
    assert_eq!(a.causality, b.causality);
}

#[test]
fn run_record_round_trips_through_disk() {
    let world = SyntheticWorld::capitals().unwrap();
    let evaluator = Evaluator::new(world.model(), config_for(&world)).unwrap();
    let record = evaluator.run(world.dataset()).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("nested").join("run.json");
    record.write_json(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();

    let back: RunRecord = serde_json::from_str(&text).unwrap();
    assert_eq!(back.model_id, record.model_id);
    assert_eq!(back.hyperparameters, record.hyperparameters);
    assert_eq!(
        back.faithfulness.keys().collect::<Vec<_>>(),
        record.faithfulness.keys().collect::<Vec<_>>()
    );
    assert_eq!(back.summary.evaluated, record.summary.evaluated);
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["hyperparameters"]["split_policy"], "shuffled");
    assert_eq!(json["hyperparameters"]["pairing_policy"], "prefer_unused");
    assert_eq!(json["hyperparameters"]["seed"], 12_345);
    assert!(json["summary"]["mean_faithfulness"].is_number());
}

#[test]
fn evaluation_runs_on_a_model_loaded_from_disk() {
    let world = SyntheticWorld::capitals().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("token-shift-capitals");
    world.write_model_dir(&dir).unwrap();
    let loaded = LreModel::from_local_dir(&dir, &Device::Cpu).unwrap();
    assert_eq!(loaded.model_id(), "token-shift-capitals");

    let evaluator = Evaluator::new(&loaded, config_for(&world)).unwrap();
    let outcome = evaluator
        .evaluate_relation(world.relation(CAPITALS).unwrap())
        .unwrap();
    let RelationOutcome::Evaluated(eval) = outcome else {
        panic!("relation was skipped: {outcome:?}");
    };
    assert!((eval.faithfulness.score - 1.0).abs() < f64::EPSILON);
}
