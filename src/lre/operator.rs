// SPDX-License-Identifier: MIT OR Apache-2.0

//! The estimated affine relation operator `ŷ = W·h + b`.

use candle_core::{DType, Tensor};

use crate::backend::{LreModel, SubjectQuery};
use crate::error::{LreError, Result};
use crate::interp::logit_lens::TokenPrediction;
use crate::lre::prompt::render;

/// Result of applying an operator to one subject.
#[derive(Debug, Clone)]
pub struct OperatorOutput {
    /// Subject the operator was applied to.
    pub subject: String,
    /// Top-`k` decoded predictions of `ŷ`.
    pub predictions: Vec<TokenPrediction>,
    /// Subject hidden state `h`, shape `[d_in]`.
    pub h: Tensor,
    /// Operator output `ŷ`, shape `[d_out]`.
    pub z: Tensor,
}

impl OperatorOutput {
    /// Top-1 prediction, if any.
    #[must_use]
    pub fn top(&self) -> Option<&TokenPrediction> {
        self.predictions.first()
    }
}

/// Affine approximation of how a relation maps subject states at
/// `h_layer` to the final-layer representation.
///
/// Immutable once estimated; applying it borrows a model and never
/// changes either.
#[derive(Debug, Clone)]
pub struct LinearRelationOperator {
    weight: Tensor,
    bias: Tensor,
    h_layer: usize,
    z_layer: usize,
    prompt_template: String,
    beta: f64,
    relation_name: String,
    n_train: usize,
}

impl LinearRelationOperator {
    /// Assemble an operator from its parts.
    ///
    /// # Shapes
    /// - `weight`: `[d_out, d_in]`
    /// - `bias`: `[d_out]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Linalg`] if the shapes disagree and
    /// [`LreError::Dataset`] if the template has no `{}` slot.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        weight: Tensor,
        bias: Tensor,
        h_layer: usize,
        z_layer: usize,
        prompt_template: impl Into<String>,
        beta: f64,
        relation_name: impl Into<String>,
        n_train: usize,
    ) -> Result<Self> {
        let (d_out, _) = weight.dims2()?;
        if bias.dims1()? != d_out {
            return Err(LreError::Linalg(format!(
                "bias has {} elements but weight has {d_out} rows",
                bias.dims1()?
            )));
        }
        let prompt_template = prompt_template.into();
        if !prompt_template.contains(super::prompt::SUBJECT_SLOT) {
            return Err(LreError::Dataset(format!(
                "operator template {prompt_template:?} has no {{}} slot"
            )));
        }
        Ok(Self {
            weight: weight.to_dtype(DType::F32)?,
            bias: bias.to_dtype(DType::F32)?,
            h_layer,
            z_layer,
            prompt_template,
            beta,
            relation_name: relation_name.into(),
            n_train,
        })
    }

    /// `W`, shape `[d_out, d_in]`.
    #[must_use]
    pub const fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// `b`, shape `[d_out]`.
    #[must_use]
    pub const fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Layer `h` is read from.
    #[must_use]
    pub const fn h_layer(&self) -> usize {
        self.h_layer
    }

    /// Layer `z` was read from during estimation (the final block).
    #[must_use]
    pub const fn z_layer(&self) -> usize {
        self.z_layer
    }

    /// Few-shot template with the training samples baked in.
    #[must_use]
    pub fn prompt_template(&self) -> &str {
        &self.prompt_template
    }

    /// Jacobian scale `β`.
    #[must_use]
    pub const fn beta(&self) -> f64 {
        self.beta
    }

    /// Name of the relation this operator was estimated for.
    #[must_use]
    pub fn relation_name(&self) -> &str {
        &self.relation_name
    }

    /// Number of training samples averaged.
    #[must_use]
    pub const fn n_train(&self) -> usize {
        self.n_train
    }

    /// `(d_out, d_in)`.
    ///
    /// # Errors
    ///
    /// Propagates tensor shape errors.
    pub fn shape(&self) -> Result<(usize, usize)> {
        Ok(self.weight.dims2()?)
    }

    /// The query for `subject` under this operator's template.
    #[must_use]
    pub fn query(&self, subject: &str) -> SubjectQuery {
        SubjectQuery::new(render(&self.prompt_template, subject), subject)
    }

    /// `ŷ = W·h + b` for a precomputed subject state.
    ///
    /// # Shapes
    /// - `h`: `[d_in]`
    /// - returns: `[d_out]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`] on shape mismatch.
    pub fn apply_hidden(&self, h: &Tensor) -> Result<Tensor> {
        // PROMOTE: operators are kept in F32 regardless of model dtype
        let h = h.to_dtype(DType::F32)?.unsqueeze(1)?;
        let projected = self.weight.matmul(&h)?.squeeze(1)?;
        Ok((projected + &self.bias)?)
    }

    /// Apply the operator to `subject` and decode the top `k` tokens.
    ///
    /// # Errors
    ///
    /// Propagates hidden-state extraction and decoding errors.
    pub fn apply(&self, model: &LreModel, subject: &str, k: usize) -> Result<OperatorOutput> {
        let state = model.subject_state(&self.query(subject), self.h_layer)?;
        self.finish(model, subject, state.h, k)
    }

    /// [`apply`](Self::apply) over many subjects with batched hidden-state
    /// extraction. Results follow input order.
    ///
    /// # Errors
    ///
    /// Propagates hidden-state extraction and decoding errors.
    pub fn apply_batch(
        &self,
        model: &LreModel,
        subjects: &[String],
        k: usize,
        batch_size: usize,
    ) -> Result<Vec<OperatorOutput>> {
        let queries: Vec<SubjectQuery> = subjects.iter().map(|s| self.query(s)).collect();
        let states = model.subject_states(&queries, self.h_layer, batch_size)?;
        subjects
            .iter()
            .zip(states)
            .map(|(subject, state)| self.finish(model, subject, state.h, k))
            .collect()
    }

    fn finish(
        &self,
        model: &LreModel,
        subject: &str,
        h: Tensor,
        k: usize,
    ) -> Result<OperatorOutput> {
        let z = self.apply_hidden(&h)?;
        let predictions = model.decode(&z, k)?;
        Ok(OperatorOutput {
            subject: subject.to_string(),
            predictions,
            h,
            z,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn apply_hidden_is_affine() {
        let dev = Device::Cpu;
        let weight = Tensor::new(&[[2.0_f32, 0.0], [1.0, -1.0], [0.0, 3.0]], &dev).unwrap();
        let bias = Tensor::new(&[1.0_f32, 0.0, -1.0], &dev).unwrap();
        let op = LinearRelationOperator::new(weight, bias, 0, 1, "{} is", 1.0, "toy", 2).unwrap();

        let h = Tensor::new(&[1.0_f32, 2.0], &dev).unwrap();
        let z: Vec<f32> = op.apply_hidden(&h).unwrap().to_vec1().unwrap();
        assert_eq!(z, vec![3.0, -1.0, 5.0]);
        assert_eq!(op.shape().unwrap(), (3, 2));
    }

    #[test]
    fn mismatched_bias_is_rejected() {
        let dev = Device::Cpu;
        let weight = Tensor::zeros((3, 2), DType::F32, &dev).unwrap();
        let bias = Tensor::zeros(2, DType::F32, &dev).unwrap();
        let err = LinearRelationOperator::new(weight, bias, 0, 1, "{} is", 1.0, "toy", 2)
            .unwrap_err();
        assert!(matches!(err, LreError::Linalg(_)));
    }

    #[test]
    fn query_renders_template() {
        let dev = Device::Cpu;
        let op = LinearRelationOperator::new(
            Tensor::zeros((2, 2), DType::F32, &dev).unwrap(),
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
            0,
            1,
            "A is B\n{} is",
            1.0,
            "toy",
            1,
        )
        .unwrap();
        let query = op.query("C");
        assert_eq!(query.prompt, "A is B\nC is");
        assert_eq!(query.subject, "C");
    }
}
