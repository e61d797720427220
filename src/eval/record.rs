// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-relation outcomes and the persisted run record.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::EvalConfig;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Per-relation records
// ---------------------------------------------------------------------------

/// Faithfulness of one relation's operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaithfulnessRecord {
    /// `hits / trials`, or 0 without trials.
    pub score: f64,
    /// Samples whose top operator prediction matched the object.
    pub hits: usize,
    /// Samples scored.
    pub trials: usize,
    /// Samples left out because their subject could not be located.
    #[serde(default)]
    pub skipped: usize,
    /// Entry `k - 1` is the fraction whose object appears in the top `k`.
    pub recall_at_k: Vec<f64>,
}

/// Causality of one relation's editor at one rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalityRecord {
    /// Requested truncation rank.
    pub rank: usize,
    /// Singular directions used after the epsilon floor.
    pub effective_rank: usize,
    /// `hits / trials`, or 0 without trials.
    pub score: f64,
    /// Edits after which the model predicted the target's object.
    pub hits: usize,
    /// Edits performed.
    pub trials: usize,
    /// Samples without a target or without hidden states.
    pub skipped_pairs: usize,
    /// Mean `‖Δh‖₂` over performed edits.
    pub mean_delta_norm: f64,
}

/// Stage a relation was in when it was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationStage {
    /// Splitting samples into train and test.
    TrainTestSplit,
    /// Estimating the operator from the training samples.
    OperatorEstimated,
    /// Filtering test samples by model knowledge.
    TestFiltered,
    /// Scoring faithfulness.
    FaithfulnessScored,
    /// Pairing, editing and scoring causality.
    CausalityScored,
}

/// Why a relation (or its causality pass) was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Too few samples to split or estimate.
    InsufficientData {
        /// Samples required.
        needed: usize,
        /// Samples available.
        available: usize,
    },
    /// No test sample passed the knowledge filter.
    EmptyFilteredSet,
    /// Too few filtered samples to form edit pairs.
    TooFewForCausality {
        /// Samples required.
        needed: usize,
        /// Samples available.
        available: usize,
    },
    /// An error was raised while the relation was being evaluated.
    Failed {
        /// The error, rendered.
        error: String,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData { needed, available } => {
                write!(f, "needs {needed} samples, has {available}")
            }
            Self::EmptyFilteredSet => write!(f, "no test sample is known to the model"),
            Self::TooFewForCausality { needed, available } => {
                write!(f, "causality needs {needed} known samples, has {available}")
            }
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Everything measured for one evaluated relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEvaluation {
    /// Relation name.
    pub relation: String,
    /// Training samples.
    pub n_train: usize,
    /// Test samples before filtering.
    pub n_test: usize,
    /// Test samples the model knows.
    pub n_filtered: usize,
    /// Faithfulness of the operator.
    pub faithfulness: FaithfulnessRecord,
    /// Causality per rank, primary rank first; empty when skipped.
    pub causality: Vec<CausalityRecord>,
    /// Why causality was not scored, if it was not.
    pub causality_skip: Option<SkipReason>,
}

impl RelationEvaluation {
    /// Causality at the primary rank.
    #[must_use]
    pub fn primary_causality(&self) -> Option<&CausalityRecord> {
        self.causality.first()
    }
}

/// Typed result of processing one relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelationOutcome {
    /// The relation was scored.
    Evaluated(RelationEvaluation),
    /// The relation was dropped before scoring.
    Skipped {
        /// Relation name.
        relation: String,
        /// Stage at which it was dropped.
        stage: RelationStage,
        /// Why.
        reason: SkipReason,
    },
}

impl RelationOutcome {
    /// Relation name.
    #[must_use]
    pub fn relation(&self) -> &str {
        match self {
            Self::Evaluated(eval) => &eval.relation,
            Self::Skipped { relation, .. } => relation,
        }
    }

    /// The evaluation, if the relation was scored.
    #[must_use]
    pub const fn evaluation(&self) -> Option<&RelationEvaluation> {
        match self {
            Self::Evaluated(eval) => Some(eval),
            Self::Skipped { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run record
// ---------------------------------------------------------------------------

/// Skipped relation as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRelation {
    /// Relation name.
    pub relation: String,
    /// Stage at which it was dropped.
    pub stage: RelationStage,
    /// Why.
    pub reason: SkipReason,
}

/// Means over the relations that were not skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Mean faithfulness; `None` when no relation was evaluated.
    pub mean_faithfulness: Option<f64>,
    /// Mean primary-rank causality; `None` when no causality was scored.
    pub mean_causality: Option<f64>,
    /// Mean causality per swept rank.
    pub mean_causality_by_rank: BTreeMap<usize, f64>,
    /// Relations evaluated.
    pub evaluated: usize,
    /// Relations skipped.
    pub skipped: usize,
}

/// Structured record of one evaluation run, written once at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// RFC 3339 completion time.
    pub timestamp: String,
    /// Model identifier.
    pub model_id: String,
    /// Every hyperparameter of the run.
    pub hyperparameters: EvalConfig,
    /// Faithfulness per evaluated relation.
    pub faithfulness: BTreeMap<String, FaithfulnessRecord>,
    /// Causality per relation with a causality pass, primary rank first.
    pub causality: BTreeMap<String, Vec<CausalityRecord>>,
    /// Relations skipped entirely.
    pub skipped: Vec<SkippedRelation>,
    /// Relations evaluated without a causality pass.
    pub causality_skipped: BTreeMap<String, SkipReason>,
    /// Aggregate means.
    pub summary: RunSummary,
}

impl RunRecord {
    /// Aggregate per-relation outcomes into a record stamped with the
    /// current time.
    #[must_use]
    pub fn from_outcomes(model_id: &str, config: &EvalConfig, outcomes: &[RelationOutcome]) -> Self {
        let mut faithfulness = BTreeMap::new();
        let mut causality = BTreeMap::new();
        let mut causality_skipped = BTreeMap::new();
        let mut skipped = Vec::new();

        for outcome in outcomes {
            match outcome {
                RelationOutcome::Evaluated(eval) => {
                    faithfulness.insert(eval.relation.clone(), eval.faithfulness.clone());
                    if !eval.causality.is_empty() {
                        causality.insert(eval.relation.clone(), eval.causality.clone());
                    }
                    if let Some(reason) = &eval.causality_skip {
                        causality_skipped.insert(eval.relation.clone(), reason.clone());
                    }
                }
                RelationOutcome::Skipped {
                    relation,
                    stage,
                    reason,
                } => skipped.push(SkippedRelation {
                    relation: relation.clone(),
                    stage: *stage,
                    reason: reason.clone(),
                }),
            }
        }

        let summary = summarize(outcomes);
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model_id: model_id.to_string(),
            hyperparameters: config.clone(),
            faithfulness,
            causality,
            skipped,
            causality_skipped,
            summary,
        }
    }

    /// Pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Json`](crate::LreError::Json) on serialization
    /// failure.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the record to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Io`](crate::LreError::Io) on write failure.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json_string()?)?;
        tracing::info!(path = %path.display(), "wrote run record");
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn summarize(outcomes: &[RelationOutcome]) -> RunSummary {
    let evaluated: Vec<&RelationEvaluation> =
        outcomes.iter().filter_map(RelationOutcome::evaluation).collect();

    let faithfulness: Vec<f64> = evaluated.iter().map(|e| e.faithfulness.score).collect();
    let causality: Vec<f64> = evaluated
        .iter()
        .filter_map(|e| e.primary_causality().map(|c| c.score))
        .collect();

    let mut by_rank: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for record in evaluated.iter().flat_map(|e| &e.causality) {
        by_rank.entry(record.rank).or_default().push(record.score);
    }

    RunSummary {
        mean_faithfulness: mean(&faithfulness),
        mean_causality: mean(&causality),
        mean_causality_by_rank: by_rank
            .into_iter()
            .filter_map(|(rank, scores)| mean(&scores).map(|m| (rank, m)))
            .collect(),
        evaluated: evaluated.len(),
        skipped: outcomes.len() - evaluated.len(),
    }
}

/// `hits / trials`, or 0 without trials.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub(crate) fn ratio(hits: usize, trials: usize) -> f64 {
    if trials == 0 {
        0.0
    } else {
        hits as f64 / trials as f64
    }
}
