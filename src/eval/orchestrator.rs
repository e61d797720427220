// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-relation faithfulness and causality evaluation.
//!
//! Each relation walks
//!
//! ```text
//! TrainTestSplit → OperatorEstimated → TestFiltered
//!                → FaithfulnessScored → CausalityScored
//! ```
//!
//! and ends either [`Evaluated`](RelationOutcome::Evaluated) or
//! [`Skipped`](RelationOutcome::Skipped) with the stage and reason. Within
//! a run, an error raised while a relation is in flight skips that
//! relation with [`SkipReason::Failed`] at the stage it was in; the other
//! relations still run. Subjects whose last token cannot be located in
//! their prompt are left out of scoring and counted as skipped.
//!
//! Every relation draws from its own `StdRng` seeded with the run seed, so
//! its split and pairing do not depend on which relations ran before it.

use std::collections::BTreeSet;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::backend::LreModel;
use crate::cache::SubjectStateCache;
use crate::config::EvalConfig;
use crate::data::{Relation, RelationDataset, Sample};
use crate::error::{LreError, Result};
use crate::eval::pairing::random_edit_targets;
use crate::eval::record::{
    CausalityRecord, FaithfulnessRecord, RelationEvaluation, RelationOutcome, RelationStage,
    RunRecord, SkipReason, ratio,
};
use crate::lre::{
    EditRequest, JacobianIclMeanEstimator, LinearRelationOperator, LowRankPInvEditor,
    filter_known_samples, is_nontrivial_prefix,
};

/// Runs the evaluation protocol for one model and configuration.
#[derive(Debug)]
pub struct Evaluator<'a> {
    model: &'a LreModel,
    config: EvalConfig,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator after validating `config` against the model.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] if the configuration is invalid or the
    /// layer does not exist in the model.
    pub fn new(model: &'a LreModel, config: EvalConfig) -> Result<Self> {
        config.validate()?;
        if config.layer >= model.num_layers() {
            return Err(LreError::Config(format!(
                "layer {} out of range (model has {} layers)",
                config.layer,
                model.num_layers()
            )));
        }
        Ok(Self { model, config })
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Evaluate every relation of `dataset` (restricted to
    /// `config.relations` when non-empty) and aggregate the outcomes.
    ///
    /// # Errors
    ///
    /// Never fails once the evaluator is built: data shortfalls and
    /// per-relation errors become skips.
    pub fn run(&self, dataset: &RelationDataset) -> Result<RunRecord> {
        let selected = dataset.filter(&self.config.relations);
        tracing::info!(
            model = %self.model.model_id(),
            relations = selected.len(),
            layer = self.config.layer,
            beta = self.config.beta,
            rank = self.config.rank,
            "starting evaluation run"
        );

        let outcomes = selected
            .relations()
            .iter()
            .map(|relation| self.evaluate_or_skip(relation))
            .collect::<Vec<_>>();

        let record = RunRecord::from_outcomes(self.model.model_id(), &self.config, &outcomes);
        tracing::info!(
            evaluated = record.summary.evaluated,
            skipped = record.summary.skipped,
            mean_faithfulness = ?record.summary.mean_faithfulness,
            mean_causality = ?record.summary.mean_causality,
            "evaluation run complete"
        );
        Ok(record)
    }

    /// Evaluate a single relation.
    ///
    /// # Errors
    ///
    /// Propagates model and numerical errors; data shortfalls become
    /// [`RelationOutcome::Skipped`].
    pub fn evaluate_relation(&self, relation: &Relation) -> Result<RelationOutcome> {
        let mut stage = RelationStage::TrainTestSplit;
        self.evaluate_staged(relation, &mut stage)
    }

    /// [`evaluate_relation`](Self::evaluate_relation), with an error turned
    /// into a [`SkipReason::Failed`] skip at the stage that raised it.
    #[must_use]
    pub fn evaluate_or_skip(&self, relation: &Relation) -> RelationOutcome {
        let mut stage = RelationStage::TrainTestSplit;
        match self.evaluate_staged(relation, &mut stage) {
            Ok(outcome) => outcome,
            Err(e) => skip(
                &relation.name,
                stage,
                SkipReason::Failed {
                    error: e.to_string(),
                },
            ),
        }
    }

    fn evaluate_staged(
        &self,
        relation: &Relation,
        stage: &mut RelationStage,
    ) -> Result<RelationOutcome> {
        let config = &self.config;
        let name = relation.name.as_str();
        let mut rng = StdRng::seed_from_u64(config.seed);
        tracing::info!(relation = name, samples = relation.len(), "loaded relation");

        *stage = RelationStage::TrainTestSplit;
        let needed = config.n_train + config.min_test_samples;
        if relation.len() < needed {
            return Ok(skip(
                name,
                RelationStage::TrainTestSplit,
                SkipReason::InsufficientData {
                    needed,
                    available: relation.len(),
                },
            ));
        }
        let (train, test) = relation.split(config.n_train, config.split_policy, &mut rng)?;

        *stage = RelationStage::OperatorEstimated;
        let estimator = JacobianIclMeanEstimator::new(self.model, config.layer, config.beta)
            .with_jacobian_chunk(config.jacobian_chunk);
        let operator = match estimator.estimate(&train) {
            Ok(operator) => operator,
            Err(LreError::InsufficientData {
                needed, available, ..
            }) => {
                return Ok(skip(
                    name,
                    RelationStage::OperatorEstimated,
                    SkipReason::InsufficientData { needed, available },
                ));
            }
            Err(e) => return Err(e),
        };

        *stage = RelationStage::TestFiltered;
        let filtered = filter_known_samples(
            self.model,
            &test,
            operator.prompt_template(),
            config.filter_batch_size,
        )?;
        if filtered.is_empty() {
            return Ok(skip(
                name,
                RelationStage::TestFiltered,
                SkipReason::EmptyFilteredSet,
            ));
        }

        *stage = RelationStage::FaithfulnessScored;
        let faithfulness = self.score_faithfulness(&operator, &filtered.samples)?;
        tracing::info!(
            relation = name,
            score = faithfulness.score,
            hits = faithfulness.hits,
            trials = faithfulness.trials,
            skipped = faithfulness.skipped,
            "faithfulness scored"
        );

        *stage = RelationStage::CausalityScored;
        let (causality, causality_skip) = if filtered.len() < config.min_causality_samples {
            let reason = SkipReason::TooFewForCausality {
                needed: config.min_causality_samples,
                available: filtered.len(),
            };
            tracing::warn!(relation = name, %reason, "skipping causality");
            (Vec::new(), Some(reason))
        } else {
            (self.score_causality(&operator, &filtered.samples, &mut rng)?, None)
        };

        tracing::info!(relation = name, "relation aggregated");
        Ok(RelationOutcome::Evaluated(RelationEvaluation {
            relation: name.to_string(),
            n_train: train.len(),
            n_test: test.len(),
            n_filtered: filtered.len(),
            faithfulness,
            causality,
            causality_skip,
        }))
    }

    fn score_faithfulness(
        &self,
        operator: &LinearRelationOperator,
        samples: &[Sample],
    ) -> Result<FaithfulnessRecord> {
        let config = &self.config;
        let candidates: Vec<&Sample> =
            samples.iter().take(config.max_faithfulness_samples).collect();
        let subjects: Vec<&str> = candidates.iter().map(|s| s.subject.as_str()).collect();
        let located = self.locate_subjects(operator, &subjects)?;
        let scored: Vec<&Sample> = located
            .iter()
            .filter_map(|&i| candidates.get(i).copied())
            .collect();
        let scored_subjects: Vec<String> = scored.iter().map(|s| s.subject.clone()).collect();
        let outputs = operator.apply_batch(
            self.model,
            &scored_subjects,
            config.top_k,
            config.hidden_state_batch_size,
        )?;

        let mut recall_hits = vec![0_usize; config.recall_k];
        let mut hits = 0;
        for (sample, output) in scored.iter().zip(&outputs) {
            let first_match = output
                .predictions
                .iter()
                .position(|p| is_nontrivial_prefix(&p.token, &sample.object));
            if first_match == Some(0) {
                hits += 1;
            }
            if let Some(rank) = first_match {
                for slot in recall_hits.iter_mut().skip(rank) {
                    *slot += 1;
                }
            }
            tracing::debug!(
                subject = %sample.subject,
                object = %sample.object,
                predicted = output.top().map_or("", |p| p.token.as_str()),
                "operator prediction"
            );
        }

        let trials = scored.len();
        Ok(FaithfulnessRecord {
            score: ratio(hits, trials),
            hits,
            trials,
            skipped: candidates.len() - trials,
            recall_at_k: recall_hits.iter().map(|&h| ratio(h, trials)).collect(),
        })
    }

    fn score_causality(
        &self,
        operator: &LinearRelationOperator,
        samples: &[Sample],
        rng: &mut StdRng,
    ) -> Result<Vec<CausalityRecord>> {
        let config = &self.config;
        let targets = random_edit_targets(samples, config.pairing_policy, rng);
        let pairs: Vec<(&Sample, Option<&Sample>)> = samples
            .iter()
            .zip(&targets)
            .take(config.max_causality_samples)
            .map(|(source, target)| (source, target.as_ref()))
            .collect();

        let cache = self.precompute_states(operator, &pairs)?;
        tracing::info!(
            relation = %operator.relation_name(),
            pairs = pairs.len(),
            cached = cache.len(),
            "causality ready"
        );

        let editor = LowRankPInvEditor::new(self.model, operator, config.rank)?
            .with_delta_source(config.delta_source)
            .with_top_k(config.top_k);

        let mut records = Vec::new();
        for rank in config.editor_ranks() {
            let ranked = if rank == editor.rank() {
                editor.clone()
            } else {
                editor.with_rank(rank)?
            };
            let record = score_editor(&ranked, &pairs, &cache)?;
            tracing::info!(
                relation = %operator.relation_name(),
                rank,
                effective_rank = record.effective_rank,
                score = record.score,
                hits = record.hits,
                trials = record.trials,
                skipped = record.skipped_pairs,
                "causality scored"
            );
            records.push(record);
        }
        Ok(records)
    }

    /// Hidden states of every locatable subject taking part in an edit,
    /// under the operator's template. Subjects left out surface as
    /// [`LreError::MissingHiddenState`] when edited.
    fn precompute_states(
        &self,
        operator: &LinearRelationOperator,
        pairs: &[(&Sample, Option<&Sample>)],
    ) -> Result<SubjectStateCache> {
        let subjects: Vec<&str> = pairs
            .iter()
            .flat_map(|(source, target)| {
                std::iter::once(source.subject.as_str()).chain(target.map(|t| t.subject.as_str()))
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let located: Vec<&str> = self
            .locate_subjects(operator, &subjects)?
            .into_iter()
            .filter_map(|i| subjects.get(i).copied())
            .collect();
        let queries: Vec<_> = located.iter().map(|s| operator.query(s)).collect();
        let states = self.model.subject_states(
            &queries,
            operator.h_layer(),
            self.config.hidden_state_batch_size,
        )?;

        let mut cache = SubjectStateCache::new();
        for (subject, state) in located.into_iter().zip(states) {
            cache.insert(subject, state);
        }
        Ok(cache)
    }

    /// Indices of `subjects` whose last token can be found in their query
    /// prompt. The rest are logged and left out.
    fn locate_subjects(
        &self,
        operator: &LinearRelationOperator,
        subjects: &[&str],
    ) -> Result<Vec<usize>> {
        let mut located = Vec::with_capacity(subjects.len());
        for (i, subject) in subjects.iter().enumerate() {
            match self.model.encode_query(&operator.query(subject)) {
                Ok(_) => located.push(i),
                Err(LreError::Tokenizer(reason)) => tracing::warn!(
                    relation = %operator.relation_name(),
                    subject = %subject,
                    %reason,
                    "cannot locate subject, leaving it out"
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(located)
    }
}

/// Edit every paired sample with `editor` and count target hits.
fn score_editor(
    editor: &LowRankPInvEditor<'_>,
    pairs: &[(&Sample, Option<&Sample>)],
    cache: &SubjectStateCache,
) -> Result<CausalityRecord> {
    let mut hits = 0;
    let mut trials = 0;
    let mut skipped_pairs = 0;
    let mut delta_norm_sum = 0.0_f64;

    for (source, target) in pairs {
        let Some(target) = target else {
            let err = LreError::MissingPairing {
                subject: source.subject.clone(),
            };
            tracing::warn!(%err, "skipping edit");
            skipped_pairs += 1;
            continue;
        };

        let request = EditRequest::new(source.subject.clone(), target.subject.clone()).with_cache(cache);
        let result = match editor.edit(&request) {
            Ok(result) => result,
            Err(err @ LreError::MissingHiddenState { .. }) => {
                tracing::warn!(%err, "skipping edit");
                skipped_pairs += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        trials += 1;
        delta_norm_sum += f64::from(result.delta_norm);
        if result
            .top()
            .is_some_and(|p| is_nontrivial_prefix(&p.token, &target.object))
        {
            hits += 1;
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let mean_delta_norm = if trials == 0 {
        0.0
    } else {
        delta_norm_sum / trials as f64
    };

    Ok(CausalityRecord {
        rank: editor.rank(),
        effective_rank: editor.effective_rank(),
        score: ratio(hits, trials),
        hits,
        trials,
        skipped_pairs,
        mean_delta_norm,
    })
}

fn skip(relation: &str, stage: RelationStage, reason: SkipReason) -> RelationOutcome {
    tracing::warn!(relation, ?stage, %reason, "skipping relation");
    RelationOutcome::Skipped {
        relation: relation.to_string(),
        stage,
        reason,
    }
}

/// Evaluate `dataset` on `model` with `config`.
///
/// # Errors
///
/// Returns [`LreError::Config`] for an invalid configuration and
/// propagates model errors.
pub fn evaluate(model: &LreModel, dataset: &RelationDataset, config: EvalConfig) -> Result<RunRecord> {
    Evaluator::new(model, config)?.run(dataset)
}
