// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation patch specification and distribution comparisons.
//!
//! An [`ActivationPatch`] overwrites the residual stream at one layer and
//! one token position. It is the only kind of model edit the relation
//! editor performs: weights are never touched.

use candle_core::Tensor;

use crate::error::{LreError, Result};
use crate::hooks::{HookPoint, HookSpec, Intervention};
use crate::interp::logit_lens::softmax_to_vec;

// ---------------------------------------------------------------------------
// ActivationPatch
// ---------------------------------------------------------------------------

/// Replace the block output of `layer` at `position` with `vector`.
///
/// # Example
///
/// ```
/// use candle_lre::interp::intervention::ActivationPatch;
/// use candle_core::{DType, Device, Tensor};
///
/// let vector = Tensor::zeros(16, DType::F32, &Device::Cpu).unwrap();
/// let patch = ActivationPatch::new(3, 7, vector);
/// assert!(patch.validate(12, 10, 16).is_ok());
/// assert!(patch.validate(2, 10, 16).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ActivationPatch {
    /// Layer whose block output is overwritten.
    pub layer: usize,
    /// Token position to overwrite.
    pub position: usize,
    /// Replacement hidden state, shape `[hidden_size]`.
    pub vector: Tensor,
}

impl ActivationPatch {
    /// Create a new patch.
    #[must_use]
    pub const fn new(layer: usize, position: usize, vector: Tensor) -> Self {
        Self {
            layer,
            position,
            vector,
        }
    }

    /// Hook point the patch is applied at.
    #[must_use]
    pub const fn hook_point(&self) -> HookPoint {
        HookPoint::ResidPost(self.layer)
    }

    /// Check the patch against model and prompt dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Intervention`] if the layer or position is out of
    /// range or the vector is not `[hidden_size]`.
    pub fn validate(&self, n_layers: usize, seq_len: usize, hidden_size: usize) -> Result<()> {
        if self.layer >= n_layers {
            return Err(LreError::Intervention(format!(
                "layer {} out of range (model has {n_layers} layers)",
                self.layer
            )));
        }
        if self.position >= seq_len {
            return Err(LreError::Intervention(format!(
                "position {} out of range (sequence has {seq_len} tokens)",
                self.position
            )));
        }
        if self.vector.dims1().ok() != Some(hidden_size) {
            return Err(LreError::Intervention(format!(
                "patch vector has shape {:?}, expected [{hidden_size}]",
                self.vector.dims()
            )));
        }
        Ok(())
    }

    /// Append this patch to a hook specification.
    pub fn register(&self, hooks: &mut HookSpec) {
        hooks.intervene(
            self.hook_point(),
            Intervention::ReplacePosition {
                position: self.position,
                vector: self.vector.clone(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Distribution comparisons
// ---------------------------------------------------------------------------

/// Compute KL divergence between two logit tensors.
///
/// Returns `KL(P || Q)` where `P = softmax(baseline)`, `Q = softmax(other)`.
///
/// # Errors
///
/// Returns [`LreError::Model`] if tensor operations fail and
/// [`LreError::Intervention`] if the vocabularies differ in size.
pub fn kl_divergence(baseline_logits: &Tensor, other_logits: &Tensor) -> Result<f32> {
    let p = softmax_to_vec(baseline_logits)?;
    let q = softmax_to_vec(other_logits)?;
    if p.len() != q.len() {
        return Err(LreError::Intervention(format!(
            "cannot compare distributions of size {} and {}",
            p.len(),
            q.len()
        )));
    }

    let kl: f32 = p
        .iter()
        .zip(q.iter())
        .filter(|&(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum();

    Ok(kl)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn patch_registers_replace_position() {
        let vector = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        let patch = ActivationPatch::new(2, 1, vector);
        let mut hooks = HookSpec::new();
        patch.register(&mut hooks);

        assert!(hooks.has_intervention_at(&HookPoint::ResidPost(2)));
        let registered: Vec<_> = hooks.interventions_at(&HookPoint::ResidPost(2)).collect();
        assert!(matches!(
            registered.first(),
            Some(Intervention::ReplacePosition { position: 1, .. })
        ));
    }

    #[test]
    fn patch_validation_checks_every_axis() {
        let vector = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        assert!(ActivationPatch::new(1, 0, vector.clone()).validate(2, 3, 4).is_ok());
        assert!(ActivationPatch::new(2, 0, vector.clone()).validate(2, 3, 4).is_err());
        assert!(ActivationPatch::new(1, 3, vector.clone()).validate(2, 3, 4).is_err());
        assert!(ActivationPatch::new(1, 0, vector).validate(2, 3, 5).is_err());
    }

    #[test]
    fn kl_is_zero_for_identical_and_positive_otherwise() {
        let a = Tensor::new(&[1.0_f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let b = Tensor::new(&[3.0_f32, 2.0, 1.0], &Device::Cpu).unwrap();
        assert!(kl_divergence(&a, &a).unwrap().abs() < 1e-6);
        assert!(kl_divergence(&a, &b).unwrap() > 0.1);

        let short = Tensor::new(&[1.0_f32, 2.0], &Device::Cpu).unwrap();
        assert!(kl_divergence(&a, &short).is_err());
    }
}
