// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-rank pseudo-inverse editor.
//!
//! Moves a subject's hidden state so the model predicts another subject's
//! object:
//!
//! ```text
//! δ  = (W·h_t + b) - (W·h_s + b)
//! Δh = P_r · δ              P_r = V_r Σ_r⁻¹ U_rᵀ
//! h_s ← h_s + Δh            at layer L, subject position of s
//! ```
//!
//! The SVD of `W` is computed once and shared by every rank through
//! [`LowRankPInvEditor::with_rank`].

use std::sync::Arc;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::backend::LreModel;
use crate::cache::{SubjectState, SubjectStateCache};
use crate::error::{LreError, Result};
use crate::interp::intervention::{ActivationPatch, kl_divergence};
use crate::interp::logit_lens::TokenPrediction;
use crate::lre::operator::LinearRelationOperator;
use crate::lre::prompt::render;
use crate::lre::svd::{DEFAULT_RCOND, SvdFactors, matrix_to_tensor};

/// Where the object-space delta `δ` comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaSource {
    /// `W·h_t - W·h_s`, the operator's own prediction.
    Operator,
    /// `z_t - z_s`, the model's final representations.
    Model,
}

/// One edit: move `subject` towards `target`.
#[derive(Debug, Clone)]
pub struct EditRequest {
    /// Subject whose hidden state is patched.
    pub subject: String,
    /// Subject whose object should be predicted after the edit.
    pub target: String,
    /// Precomputed state for `subject` under the operator's template.
    pub subject_state: Option<SubjectState>,
    /// Precomputed state for `target` under the operator's template.
    pub target_state: Option<SubjectState>,
}

impl EditRequest {
    /// Request without precomputed states; the editor fetches them.
    #[must_use]
    pub fn new(subject: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            target: target.into(),
            subject_state: None,
            target_state: None,
        }
    }

    /// Attach precomputed states from `cache` when present.
    #[must_use]
    pub fn with_cache(mut self, cache: &SubjectStateCache) -> Self {
        self.subject_state = cache.get(&self.subject).cloned();
        self.target_state = cache.get(&self.target).cloned();
        self
    }
}

/// Outcome of one edit.
#[derive(Debug, Clone)]
pub struct EditResult {
    /// Top-`k` predictions after patching.
    pub predictions: Vec<TokenPrediction>,
    /// `‖Δh‖₂`.
    pub delta_norm: f32,
    /// Singular directions actually used.
    pub effective_rank: usize,
    /// KL divergence of the edited next-token distribution from the
    /// unedited one.
    pub kl_from_source: f32,
}

impl EditResult {
    /// Top-1 prediction, if any.
    #[must_use]
    pub fn top(&self) -> Option<&TokenPrediction> {
        self.predictions.first()
    }
}

/// Editor applying rank-`r` pseudo-inverse edits for one operator.
#[derive(Debug, Clone)]
pub struct LowRankPInvEditor<'a> {
    model: &'a LreModel,
    operator: &'a LinearRelationOperator,
    rank: usize,
    svd: Arc<SvdFactors>,
    /// `P_r`, `[d_in, d_out]`.
    pinv: Tensor,
    effective_rank: usize,
    delta_source: DeltaSource,
    top_k: usize,
}

impl<'a> LowRankPInvEditor<'a> {
    /// Decompose the operator weight and build the rank-`rank` editor.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Linalg`] if the decomposition fails.
    pub fn new(
        model: &'a LreModel,
        operator: &'a LinearRelationOperator,
        rank: usize,
    ) -> Result<Self> {
        let svd = Arc::new(SvdFactors::from_tensor(operator.weight())?);
        Self::with_svd(model, operator, rank, svd)
    }

    /// Build the editor from an existing decomposition of the operator.
    ///
    /// # Errors
    ///
    /// Propagates tensor construction errors.
    pub fn with_svd(
        model: &'a LreModel,
        operator: &'a LinearRelationOperator,
        rank: usize,
        svd: Arc<SvdFactors>,
    ) -> Result<Self> {
        let pinv = matrix_to_tensor(&svd.pinv(rank, DEFAULT_RCOND), model.device())?;
        let effective_rank = svd.effective_rank(rank, DEFAULT_RCOND);
        tracing::debug!(
            relation = %operator.relation_name(),
            rank,
            effective_rank,
            "built pseudo-inverse editor"
        );
        Ok(Self {
            model,
            operator,
            rank,
            svd,
            pinv,
            effective_rank,
            delta_source: DeltaSource::Operator,
            top_k: 5,
        })
    }

    /// Sibling editor at another rank sharing this editor's SVD.
    ///
    /// # Errors
    ///
    /// Propagates tensor construction errors.
    pub fn with_rank(&self, rank: usize) -> Result<Self> {
        Ok(Self::with_svd(self.model, self.operator, rank, Arc::clone(&self.svd))?
            .with_delta_source(self.delta_source)
            .with_top_k(self.top_k))
    }

    /// Choose where `δ` comes from.
    #[must_use]
    pub const fn with_delta_source(mut self, delta_source: DeltaSource) -> Self {
        self.delta_source = delta_source;
        self
    }

    /// Number of predictions kept per edit.
    #[must_use]
    pub const fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Requested truncation rank.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Singular directions kept after the epsilon floor.
    #[must_use]
    pub const fn effective_rank(&self) -> usize {
        self.effective_rank
    }

    /// The shared decomposition.
    #[must_use]
    pub const fn svd(&self) -> &Arc<SvdFactors> {
        &self.svd
    }

    /// `P_r`, shape `[d_in, d_out]`.
    #[must_use]
    pub const fn pinv(&self) -> &Tensor {
        &self.pinv
    }

    /// `Δh = P_r · δ` for a pair of states.
    ///
    /// # Errors
    ///
    /// Propagates tensor shape errors.
    pub fn hidden_delta(&self, source: &SubjectState, target: &SubjectState) -> Result<Tensor> {
        let delta = match self.delta_source {
            DeltaSource::Operator => {
                let z_target = self.operator.apply_hidden(&target.h)?;
                let z_source = self.operator.apply_hidden(&source.h)?;
                (z_target - z_source)?
            }
            DeltaSource::Model => {
                (target.z.to_dtype(DType::F32)? - source.z.to_dtype(DType::F32)?)?
            }
        };
        Ok(self.pinv.matmul(&delta.unsqueeze(1)?)?.squeeze(1)?)
    }

    /// Apply one edit and decode the patched model's next token.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::MissingHiddenState`] if a state was not supplied
    /// and the model cannot produce it; propagates patching errors.
    pub fn edit(&self, request: &EditRequest) -> Result<EditResult> {
        let source = self.resolve_state(&request.subject, request.subject_state.as_ref())?;
        let target = self.resolve_state(&request.target, request.target_state.as_ref())?;

        let delta_h = self.hidden_delta(&source, &target)?;
        let delta_norm = delta_h.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        let edited_h = (source.h.to_dtype(DType::F32)? + &delta_h)?.to_dtype(source.h.dtype())?;

        let patch = ActivationPatch::new(self.operator.h_layer(), source.h_position, edited_h);
        let prompt = render(self.operator.prompt_template(), &request.subject);
        let edited_logits = self.model.patched_logits(&prompt, &patch)?;
        let predictions = self.model.decode_logits(&edited_logits, self.top_k)?;

        let source_logits = self.model.representation_logits(&source.z)?;
        let kl_from_source = kl_divergence(&source_logits, &edited_logits)?;

        tracing::debug!(
            subject = %request.subject,
            target = %request.target,
            rank = self.rank,
            delta_norm,
            predicted = predictions.first().map_or("", |p| p.token.as_str()),
            "applied low-rank edit"
        );

        Ok(EditResult {
            predictions,
            delta_norm,
            effective_rank: self.effective_rank,
            kl_from_source,
        })
    }

    fn resolve_state(&self, subject: &str, given: Option<&SubjectState>) -> Result<SubjectState> {
        if let Some(state) = given {
            return Ok(state.clone());
        }
        self.model
            .subject_state(&self.operator.query(subject), self.operator.h_layer())
            .map_err(|e| match e {
                LreError::Tokenizer(reason) => LreError::MissingHiddenState {
                    subject: subject.to_string(),
                    reason,
                },
                other => other,
            })
    }
}
