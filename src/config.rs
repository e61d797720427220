// SPDX-License-Identifier: MIT OR Apache-2.0

//! Evaluation run configuration and JSON parsing helpers.
//!
//! [`EvalConfig`] collects the hyperparameters of one faithfulness +
//! causality run. Every field has a default, so a config file only needs
//! to name what it changes.
//!
//! # Usage
//!
//! ```
//! use candle_lre::EvalConfig;
//!
//! let json: serde_json::Value = serde_json::from_str(
//!     r#"{"model_id": "gpt2-xl", "layer": 15, "beta": 2.5, "split_policy": "first"}"#,
//! ).unwrap();
//! let config = EvalConfig::from_json(&json).unwrap();
//! assert_eq!(config.rank, 100);
//! assert_eq!(config.n_train, 5);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::SplitPolicy;
use crate::error::{LreError, Result};
use crate::eval::PairingPolicy;
use crate::lre::DeltaSource;

// ---------------------------------------------------------------------------
// EvalConfig
// ---------------------------------------------------------------------------

/// Hyperparameters for an evaluation run.
///
/// Serialized verbatim into the run record so that every reported score
/// can be traced back to the settings that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Identifier of the model under evaluation (recorded, not loaded).
    pub model_id: String,
    /// Layer whose block output is the subject representation `h`.
    pub layer: usize,
    /// Jacobian scale `β` used when estimating the operator.
    pub beta: f64,
    /// Truncation rank of the pseudo-inverse editor.
    pub rank: usize,
    /// Number of training samples per relation.
    pub n_train: usize,
    /// Minimum number of samples left for testing after the split.
    pub min_test_samples: usize,
    /// Prompts per forward pass when filtering known samples.
    pub filter_batch_size: usize,
    /// Prompts per forward pass when extracting subject hidden states.
    pub hidden_state_batch_size: usize,
    /// Output dimensions per backward pass when building a Jacobian.
    pub jacobian_chunk: usize,
    /// Number of ranked predictions kept per decode.
    pub top_k: usize,
    /// Largest `k` reported in faithfulness recall@k.
    pub recall_k: usize,
    /// Cap on filtered samples scored for faithfulness.
    pub max_faithfulness_samples: usize,
    /// Cap on filtered samples scored for causality.
    pub max_causality_samples: usize,
    /// Minimum filtered samples required to attempt causality.
    pub min_causality_samples: usize,
    /// Seed for every per-relation random source.
    pub seed: u64,
    /// How training samples are drawn.
    pub split_policy: SplitPolicy,
    /// How edit targets are drawn.
    pub pairing_policy: PairingPolicy,
    /// Which representation difference drives an edit.
    pub delta_source: DeltaSource,
    /// Additional editor ranks evaluated from the same decomposition.
    pub causality_ranks: Vec<usize>,
    /// Relations to evaluate, by name. Empty means every relation.
    pub relations: Vec<String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            model_id: "unknown".to_string(),
            layer: 15,
            beta: 2.5,
            rank: 100,
            n_train: 5,
            min_test_samples: 5,
            filter_batch_size: 4,
            hidden_state_batch_size: 2,
            jacobian_chunk: 32,
            top_k: 5,
            recall_k: 3,
            max_faithfulness_samples: 20,
            max_causality_samples: 10,
            min_causality_samples: 2,
            seed: 12_345,
            split_policy: SplitPolicy::Shuffled,
            pairing_policy: PairingPolicy::PreferUnused,
            delta_source: DeltaSource::Operator,
            causality_ranks: Vec::new(),
            relations: Vec::new(),
        }
    }
}

impl EvalConfig {
    /// Parse a config from a JSON value, filling absent fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] if a policy field holds an unknown value
    /// or the resulting config fails [`validate`](Self::validate).
    pub fn from_json(config: &Value) -> Result<Self> {
        let defaults = Self::default();
        let parsed = Self {
            model_id: config
                .get("model_id")
                .and_then(Value::as_str)
                .map_or(defaults.model_id, str::to_string),
            layer: get_usize_or(config, "layer", defaults.layer),
            beta: get_f64_or(config, "beta", defaults.beta),
            rank: get_usize_or(config, "rank", defaults.rank),
            n_train: get_usize_or(config, "n_train", defaults.n_train),
            min_test_samples: get_usize_or(config, "min_test_samples", defaults.min_test_samples),
            filter_batch_size: get_usize_or(
                config,
                "filter_batch_size",
                defaults.filter_batch_size,
            ),
            hidden_state_batch_size: get_usize_or(
                config,
                "hidden_state_batch_size",
                defaults.hidden_state_batch_size,
            ),
            jacobian_chunk: get_usize_or(config, "jacobian_chunk", defaults.jacobian_chunk),
            top_k: get_usize_or(config, "top_k", defaults.top_k),
            recall_k: get_usize_or(config, "recall_k", defaults.recall_k),
            max_faithfulness_samples: get_usize_or(
                config,
                "max_faithfulness_samples",
                defaults.max_faithfulness_samples,
            ),
            max_causality_samples: get_usize_or(
                config,
                "max_causality_samples",
                defaults.max_causality_samples,
            ),
            min_causality_samples: get_usize_or(
                config,
                "min_causality_samples",
                defaults.min_causality_samples,
            ),
            seed: config
                .get("seed")
                .and_then(Value::as_u64)
                .unwrap_or(defaults.seed),
            split_policy: get_serde_or(config, "split_policy", defaults.split_policy)?,
            pairing_policy: get_serde_or(config, "pairing_policy", defaults.pairing_policy)?,
            delta_source: get_serde_or(config, "delta_source", defaults.delta_source)?,
            causality_ranks: get_serde_or(config, "causality_ranks", defaults.causality_ranks)?,
            relations: get_serde_or(config, "relations", defaults.relations)?,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Io`] if the file cannot be read,
    /// [`LreError::Json`] if it is not JSON, and [`LreError::Config`] if the
    /// values are invalid.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let value: Value = serde_json::from_str(&text)?;
        Self::from_json(&value)
    }

    /// Check the invariants a run relies on.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.n_train < 2 {
            return Err(LreError::Config(format!(
                "n_train must be at least 2 (got {})",
                self.n_train
            )));
        }
        if !self.beta.is_finite() || self.beta <= 0.0 {
            return Err(LreError::Config(format!(
                "beta must be a positive finite number (got {})",
                self.beta
            )));
        }
        for (name, value) in [
            ("rank", self.rank),
            ("filter_batch_size", self.filter_batch_size),
            ("hidden_state_batch_size", self.hidden_state_batch_size),
            ("jacobian_chunk", self.jacobian_chunk),
            ("top_k", self.top_k),
            ("recall_k", self.recall_k),
        ] {
            if value == 0 {
                return Err(LreError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.recall_k > self.top_k {
            return Err(LreError::Config(format!(
                "recall_k ({}) cannot exceed top_k ({})",
                self.recall_k, self.top_k
            )));
        }
        if self.min_causality_samples < 2 {
            return Err(LreError::Config(
                "min_causality_samples must be at least 2 to form edit pairs".into(),
            ));
        }
        if self.causality_ranks.contains(&0) {
            return Err(LreError::Config(
                "causality_ranks must not contain 0".into(),
            ));
        }
        Ok(())
    }

    /// Every editor rank to evaluate: the primary rank first, then the
    /// sweep ranks in ascending order without duplicates.
    #[must_use]
    pub fn editor_ranks(&self) -> Vec<usize> {
        let mut sweep: Vec<usize> = self
            .causality_ranks
            .iter()
            .copied()
            .filter(|r| *r != self.rank)
            .collect();
        sweep.sort_unstable();
        sweep.dedup();
        let mut ranks = Vec::with_capacity(sweep.len() + 1);
        ranks.push(self.rank);
        ranks.extend(sweep);
        ranks
    }
}

// ---------------------------------------------------------------------------
// Shared config helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
pub(crate) fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| LreError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| LreError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
pub(crate) fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
pub(crate) fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
pub(crate) fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Deserialize a structured field, returning a default if absent.
fn get_serde_or<T: serde::de::DeserializeOwned>(config: &Value, key: &str, default: T) -> Result<T> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| LreError::Config(format!("invalid field '{key}': {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
