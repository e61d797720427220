// SPDX-License-Identifier: MIT OR Apache-2.0

//! Jacobian-ICL mean estimator.
//!
//! For each training sample the estimator builds a leave-one-out few-shot
//! prompt (every *other* training sample as a demonstration, the sample's
//! subject as the query) and linearizes the model at that point:
//!
//! ```text
//! J_i = ∂z/∂h            at (h_i, z_i)
//! b_i = z_i - β · J_i · h_i
//! W   = β · mean(J_i)
//! b   = mean(b_i)
//! ```
//!
//! `h` is the block output at `h_layer` on the query subject's last token and
//! `z` the final block output on the prompt's last token.

use candle_core::{DType, Tensor};

use crate::backend::{LreModel, SubjectQuery};
use crate::data::Relation;
use crate::error::{LreError, Result};
use crate::lre::operator::LinearRelationOperator;
use crate::lre::prompt::{icl_template, make_prompt};

/// Fewest training samples a mean over Jacobians is taken from.
pub const MIN_TRAIN_SAMPLES: usize = 2;

/// Estimates a [`LinearRelationOperator`] from a relation's training
/// samples.
///
/// # Example
///
/// ```
/// use candle_lre::lre::JacobianIclMeanEstimator;
/// use candle_lre::synthetic::SyntheticWorld;
///
/// # fn main() -> candle_lre::Result<()> {
/// let world = SyntheticWorld::capitals()?;
/// let relation = world.relation("country capital city").unwrap();
/// let train = relation.with_samples(relation.samples[..3].to_vec());
///
/// let estimator = JacobianIclMeanEstimator::new(world.model(), world.source_layer(), 2.5);
/// let operator = estimator.estimate(&train)?;
/// let d = world.model().hidden_size();
/// assert_eq!(operator.shape()?, (d, d));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct JacobianIclMeanEstimator<'a> {
    model: &'a LreModel,
    h_layer: usize,
    beta: f64,
    jacobian_chunk: usize,
}

impl<'a> JacobianIclMeanEstimator<'a> {
    /// Estimator reading `h` at `h_layer` with Jacobian scale `beta`.
    #[must_use]
    pub const fn new(model: &'a LreModel, h_layer: usize, beta: f64) -> Self {
        Self {
            model,
            h_layer,
            beta,
            jacobian_chunk: 32,
        }
    }

    /// Output dimensions differentiated per backward pass.
    #[must_use]
    pub const fn with_jacobian_chunk(mut self, chunk: usize) -> Self {
        self.jacobian_chunk = chunk;
        self
    }

    /// Estimate the operator from every sample of `relation`.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::InsufficientData`] with fewer than
    /// [`MIN_TRAIN_SAMPLES`] samples, and propagates model errors.
    pub fn estimate(&self, relation: &Relation) -> Result<LinearRelationOperator> {
        let samples = &relation.samples;
        if samples.len() < MIN_TRAIN_SAMPLES {
            return Err(LreError::InsufficientData {
                relation: relation.name.clone(),
                needed: MIN_TRAIN_SAMPLES,
                available: samples.len(),
            });
        }
        let template = relation.template();

        let mut jacobian_sum: Option<Tensor> = None;
        let mut bias_sum: Option<Tensor> = None;
        for (i, sample) in samples.iter().enumerate() {
            let demos: Vec<_> = samples
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect();
            let query = SubjectQuery::new(
                make_prompt(template, &demos, &sample.subject),
                sample.subject.clone(),
            );

            let point = self.model.jacobian(&query, self.h_layer, self.jacobian_chunk)?;
            let jacobian = point.jacobian.to_dtype(DType::F32)?;
            let h = point.state.h.to_dtype(DType::F32)?;
            let z = point.state.z.to_dtype(DType::F32)?;

            let linear = jacobian.matmul(&h.unsqueeze(1)?)?.squeeze(1)?;
            let bias = (z - (linear * self.beta)?)?;

            tracing::debug!(
                relation = %relation.name,
                subject = %sample.subject,
                "linearized training sample"
            );

            jacobian_sum = Some(match jacobian_sum {
                Some(acc) => (acc + jacobian)?,
                None => jacobian,
            });
            bias_sum = Some(match bias_sum {
                Some(acc) => (acc + bias)?,
                None => bias,
            });
        }

        let (Some(jacobian_sum), Some(bias_sum)) = (jacobian_sum, bias_sum) else {
            return Err(LreError::InsufficientData {
                relation: relation.name.clone(),
                needed: MIN_TRAIN_SAMPLES,
                available: 0,
            });
        };

        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let n = samples.len() as f64;
        let weight = (jacobian_sum * (self.beta / n))?;
        let bias = (bias_sum / n)?;

        let z_layer = self
            .model
            .num_layers()
            .checked_sub(1)
            .ok_or_else(|| LreError::Config("model has no layers".into()))?;

        tracing::info!(
            relation = %relation.name,
            n_train = samples.len(),
            h_layer = self.h_layer,
            beta = self.beta,
            "estimated relation operator"
        );

        LinearRelationOperator::new(
            weight,
            bias,
            self.h_layer,
            z_layer,
            icl_template(template, samples),
            self.beta,
            relation.name.clone(),
            samples.len(),
        )
    }
}
