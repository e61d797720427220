// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logit lens: read a representation as a next-token distribution.
//!
//! Representations are projected through the model's final norm and
//! unembedding ([`LreBackend::project_to_vocab`](crate::LreBackend::project_to_vocab)),
//! turned into probabilities with a softmax, and reported as ranked
//! [`TokenPrediction`]s. This is how both the model's own next token and an
//! operator estimate `W·h + b` are decoded.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{LreError, Result};

/// A single ranked token prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPrediction {
    /// Token ID in the vocabulary.
    pub token_id: u32,
    /// Decoded token string.
    pub token: String,
    /// Probability (0.0 to 1.0).
    pub probability: f32,
}

/// Top-`k` `(token_id, probability)` pairs from a logit vector.
///
/// Ties keep the lower token ID first.
///
/// # Shapes
/// - `logits`: `[vocab_size]` (any shape is flattened)
///
/// # Errors
///
/// Returns [`LreError::Model`] if the tensor cannot be read as `f32`, and
/// [`LreError::Hook`] if it is empty.
pub fn top_k_probabilities(logits: &Tensor, k: usize) -> Result<Vec<(u32, f32)>> {
    if logits.elem_count() == 0 {
        return Err(LreError::Hook("cannot rank an empty logit vector".into()));
    }
    let probs = softmax_to_vec(logits)?;

    let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    ranked.sort_by(|(ia, a), (ib, b)| {
        b.partial_cmp(a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ia.cmp(ib))
    });
    ranked.truncate(k);

    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    Ok(ranked
        .into_iter()
        .map(|(idx, p)| (idx as u32, p))
        .collect())
}

/// Probabilities of a logit vector, flattened.
pub(crate) fn softmax_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: softmax needs f32 for numerical stability
    let logits_f32 = logits.to_dtype(DType::F32)?.flatten_all()?;
    let probs = candle_nn::ops::softmax_last_dim(&logits_f32)?;
    Ok(probs.to_vec1()?)
}

/// Decode token IDs to [`TokenPrediction`] using a decode function.
///
/// Generic over any tokenizer: the caller provides a closure that maps
/// `token_id -> String`.
///
/// # Example
///
/// ```
/// use candle_lre::interp::logit_lens::decode_predictions_with;
///
/// let preds = decode_predictions_with(&[(42, 0.7), (99, 0.2)], |id| {
///     Ok(format!("token_{id}"))
/// })
/// .unwrap();
/// assert_eq!(preds.len(), 2);
/// assert_eq!(preds[0].token, "token_42");
/// ```
///
/// # Errors
///
/// Propagates the first error returned by `decode_fn`.
pub fn decode_predictions_with(
    predictions: &[(u32, f32)],
    decode_fn: impl Fn(u32) -> Result<String>,
) -> Result<Vec<TokenPrediction>> {
    predictions
        .iter()
        .map(|&(token_id, probability)| {
            Ok(TokenPrediction {
                token_id,
                token: decode_fn(token_id)?,
                probability,
            })
        })
        .collect()
}

/// Format a token for display, escaping whitespace characters.
#[must_use]
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

/// Render predictions as `"tok" (p%)` pairs for log lines.
#[must_use]
pub fn format_predictions(predictions: &[TokenPrediction]) -> String {
    predictions
        .iter()
        .map(|p| format!("\"{}\" ({:.1}%)", format_token(&p.token), p.probability * 100.0))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
