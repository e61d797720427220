// SPDX-License-Identifier: MIT OR Apache-2.0

//! Knowledge filter: keep only samples the unedited model already gets
//! right.

use crate::backend::LreModel;
use crate::data::Relation;
use crate::error::Result;
use crate::lre::prompt::render;

/// Whether `prediction` is a non-empty, case-insensitive prefix of
/// `target` once surrounding whitespace is dropped from both.
///
/// ```
/// use candle_lre::lre::is_nontrivial_prefix;
///
/// assert!(is_nontrivial_prefix("Paris", "Paris"));
/// assert!(is_nontrivial_prefix("par", "Paris"));
/// assert!(!is_nontrivial_prefix("Lyon", "Paris"));
/// assert!(!is_nontrivial_prefix("  ", "Paris"));
/// ```
#[must_use]
pub fn is_nontrivial_prefix(prediction: &str, target: &str) -> bool {
    let prediction = prediction.trim().to_lowercase();
    let target = target.trim().to_lowercase();
    !prediction.is_empty() && target.starts_with(&prediction)
}

/// Samples of `relation` whose object the model predicts when prompted
/// with `prompt_template` (a few-shot template with a `{}` query slot).
///
/// A sample passes when the model's top next token is a non-trivial prefix
/// of its object. Prompts run `batch_size` at a time; kept samples stay in
/// input order and may be empty.
///
/// # Errors
///
/// Propagates encoding and forward-pass errors.
pub fn filter_known_samples(
    model: &LreModel,
    relation: &Relation,
    prompt_template: &str,
    batch_size: usize,
) -> Result<Relation> {
    let prompts: Vec<String> = relation
        .samples
        .iter()
        .map(|s| render(prompt_template, &s.subject))
        .collect();
    let predictions = model.predict_batch(&prompts, 1, batch_size)?;

    let kept: Vec<_> = relation
        .samples
        .iter()
        .zip(&predictions)
        .filter_map(|(sample, preds)| {
            let known = preds
                .first()
                .is_some_and(|top| is_nontrivial_prefix(&top.token, &sample.object));
            if !known {
                tracing::debug!(
                    relation = %relation.name,
                    subject = %sample.subject,
                    predicted = preds.first().map_or("", |p| p.token.as_str()),
                    "model does not know sample"
                );
            }
            known.then(|| sample.clone())
        })
        .collect();

    tracing::info!(
        relation = %relation.name,
        kept = kept.len(),
        total = relation.samples.len(),
        "filtered samples by model knowledge"
    );
    Ok(relation.with_samples(kept))
}
