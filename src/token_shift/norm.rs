// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layer normalization for the token-shift model.
//!
//! Written out with elementary tensor ops instead of `candle_nn::LayerNorm`:
//! the fused candle kernel has no backward pass, and Jacobians through
//! the residual stream must differentiate through every norm.

use candle_core::{D, Tensor};
use candle_nn::VarBuilder;

use crate::error::Result;

/// Layer normalization with learned weight and bias.
pub struct LayerNorm {
    /// Learned scale parameter.
    weight: Tensor,
    /// Learned bias parameter.
    bias: Tensor,
    /// Epsilon for numerical stability.
    eps: f64,
}

impl LayerNorm {
    /// Load a `LayerNorm` from `weight` and `bias` tensors.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`](crate::LreError::Model) if weights
    /// cannot be loaded.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        let bias = vb.get(size, "bias")?;
        Ok(Self { weight, bias, eps })
    }

    /// Apply layer normalization over the last dimension.
    ///
    /// # Shapes
    /// - `x`: `[..., hidden_size]`
    /// - returns: `[..., hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`](crate::LreError::Model) on tensor
    /// operation failure.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let x_centered = x.broadcast_sub(&mean)?;
        let var = x_centered.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(x_normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
