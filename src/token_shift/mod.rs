// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-shift language model backend.
//!
//! A compact causal language model whose only cross-position operation is
//! the RWKV-style *token shift*: each position sees its own residual and the
//! residual of the position immediately before it. Every block is
//!
//! ```text
//! mix   = proj( x + (shift(x) - x) * time_mix )      (token mix)
//! x     = x + mix
//! ffn   = value( relu(key(x))^2 )                    (channel mix, optional)
//! x     = x + ffn
//! ```
//!
//! with optional pre-sublayer layer norms. Each block's output is exposed
//! as [`HookPoint::ResidPost`], where captures and interventions are
//! honoured, so the backend supports activation patching and Jacobians
//! through [`LreBackend::differentiable_forward`].

pub mod config;
mod norm;

use candle_core::{DType, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::backend::LreBackend;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec, apply_intervention};

use self::norm::LayerNorm;

pub use self::config::{TOKEN_SHIFT_MODEL_TYPE, TokenShiftConfig};

// ---------------------------------------------------------------------------
// Sublayers
// ---------------------------------------------------------------------------

/// Token-mixing sublayer: interpolate towards the previous position, then
/// project.
struct TokenMix {
    /// Per-channel interpolation weight between `x` and `shift(x)`.
    time_mix: Tensor,
    /// Output projection `[hidden, hidden]`.
    proj: Linear,
}

impl TokenMix {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(hidden_size: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let time_mix = vb.get(hidden_size, "time_mix")?;
        let proj = candle_nn::linear_no_bias(hidden_size, hidden_size, vb.pp("proj"))?;
        Ok(Self { time_mix, proj })
    }

    /// # Shapes
    /// - `xs`: `[batch, seq, hidden]`
    /// - returns: `[batch, seq, hidden]`
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let shifted = token_shift(xs)?;
        let delta = shifted.sub(xs)?.broadcast_mul(&self.time_mix)?;
        let mixed = (xs + delta)?;
        Ok(self.proj.forward(&mixed)?)
    }
}

/// Channel-mixing MLP with squared `ReLU`.
struct ChannelMix {
    /// Up projection `[intermediate, hidden]`.
    key: Linear,
    /// Down projection `[hidden, intermediate]`.
    value: Linear,
}

impl ChannelMix {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(hidden_size: usize, intermediate_size: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let key = candle_nn::linear_no_bias(hidden_size, intermediate_size, vb.pp("key"))?;
        let value = candle_nn::linear_no_bias(intermediate_size, hidden_size, vb.pp("value"))?;
        Ok(Self { key, value })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let activated = self.key.forward(xs)?.relu()?.sqr()?;
        Ok(self.value.forward(&activated)?)
    }
}

/// One token-shift block.
struct TokenShiftBlock {
    /// Norm before the token mix (`None` when block norms are disabled).
    ln1: Option<LayerNorm>,
    /// Token-mixing sublayer.
    mix: TokenMix,
    /// Norm before the channel mix.
    ln2: Option<LayerNorm>,
    /// Channel-mixing MLP (`None` when disabled).
    ffn: Option<ChannelMix>,
}

impl TokenShiftBlock {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    fn load(config: &TokenShiftConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let ln1 = if config.block_norms {
            Some(load_layer_norm(config, vb.pp("ln1"))?)
        } else {
            None
        };
        let mix = TokenMix::load(config.hidden_size, vb.pp("mix"))?;
        let (ln2, ffn) = if config.use_mlp {
            let ln2 = if config.block_norms {
                Some(load_layer_norm(config, vb.pp("ln2"))?)
            } else {
                None
            };
            let ffn = ChannelMix::load(config.hidden_size, config.intermediate_size, vb.pp("ffn"))?;
            (ln2, Some(ffn))
        } else {
            (None, None)
        };
        Ok(Self { ln1, mix, ln2, ffn })
    }
}

// ---------------------------------------------------------------------------
// TokenShiftLm
// ---------------------------------------------------------------------------

/// Config-driven token-shift language model.
///
/// Weights are read from a [`VarBuilder`] with the layout
/// `emb.weight`, `blocks.{i}.{ln1,mix,ln2,ffn}.*`, `ln_out.*`, `head.weight`.
pub struct TokenShiftLm {
    /// Token embedding matrix.
    emb: Embedding,
    /// Blocks in order.
    blocks: Vec<TokenShiftBlock>,
    /// Final normalization before the unembedding.
    ln_out: Option<LayerNorm>,
    /// Unembedding. `None` when tied to `emb`.
    head: Option<Linear>,
    /// Model configuration.
    config: TokenShiftConfig,
}

impl TokenShiftLm {
    /// Load a token-shift model from a [`VarBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`](crate::LreError::Model) if a weight is
    /// missing or has the wrong shape.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: TokenShiftConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let emb = candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("emb"))?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(TokenShiftBlock::load(&config, vb.pp(format!("blocks.{i}")))?);
        }

        let ln_out = if config.final_norm {
            Some(load_layer_norm(&config, vb.pp("ln_out"))?)
        } else {
            None
        };

        let head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("head"),
            )?)
        };

        Ok(Self {
            emb,
            blocks,
            ln_out,
            head,
            config,
        })
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &TokenShiftConfig {
        &self.config
    }

    /// Apply the final norm (if any).
    fn final_norm(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.ln_out {
            Some(norm) => norm.forward(hidden),
            None => Ok(hidden.clone()),
        }
    }

    /// Project normalized hidden states to logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden]` or `[batch, hidden]`
    /// - returns: `[batch, seq, vocab]` or `[batch, vocab]`
    fn unembed(&self, hidden: &Tensor) -> Result<Tensor> {
        if let Some(head) = &self.head {
            Ok(head.forward(hidden)?)
        } else {
            let embed_weight = self.emb.embeddings();
            Ok(hidden.broadcast_matmul(&embed_weight.t()?)?)
        }
    }
}

// ---------------------------------------------------------------------------
// LreBackend implementation
// ---------------------------------------------------------------------------

impl LreBackend for TokenShiftLm {
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, input_ids.device())?);

        let mut hidden = self.emb.forward(input_ids)?;

        for (layer_idx, block) in self.blocks.iter().enumerate() {
            let mix_in = match &block.ln1 {
                Some(norm) => norm.forward(&hidden)?,
                None => hidden.clone(),
            };
            let mixed = block.mix.forward(&mix_in)?;
            hidden = (hidden + mixed)?;

            if let Some(ffn) = &block.ffn {
                let ffn_in = match &block.ln2 {
                    Some(norm) => norm.forward(&hidden)?,
                    None => hidden.clone(),
                };
                let out = ffn.forward(&ffn_in)?;
                hidden = (hidden + out)?;
            }

            hidden = hook_point(hidden, HookPoint::ResidPost(layer_idx), hooks, &mut cache)?;
        }

        let normed = self.final_norm(&hidden)?;
        cache.set_output(self.unembed(&normed)?);
        Ok(cache)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let normed = self.final_norm(hidden)?;
        self.unembed(&normed)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Apply the interventions registered at `hook`, then capture the result
/// if requested.
fn hook_point(
    mut tensor: Tensor,
    hook: HookPoint,
    hooks: &HookSpec,
    cache: &mut HookCache,
) -> Result<Tensor> {
    for intervention in hooks.interventions_at(&hook) {
        tensor = apply_intervention(&tensor, intervention)?;
    }
    if hooks.is_captured(&hook) {
        cache.store(hook, tensor.clone());
    }
    Ok(tensor)
}

/// Shift a sequence one position to the right, zero-filling position 0.
///
/// # Shapes
/// - `hidden`: `[batch, seq, hidden]`
/// - returns: `[batch, seq, hidden]`
fn token_shift(hidden: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, channels) = hidden.dims3()?;
    let zeros = Tensor::zeros((batch, 1, channels), hidden.dtype(), hidden.device())?;
    if seq_len == 1 {
        return Ok(zeros);
    }
    let prev_tokens = hidden.narrow(1, 0, seq_len - 1)?;
    Ok(Tensor::cat(&[&zeros, &prev_tokens], 1)?)
}

#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
fn load_layer_norm(config: &TokenShiftConfig, vb: VarBuilder<'_>) -> Result<LayerNorm> {
    LayerNorm::load(config.hidden_size, config.norm_eps, vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;

    use super::*;
    use crate::hooks::Intervention;

    fn random_config() -> TokenShiftConfig {
        TokenShiftConfig {
            hidden_size: 6,
            num_layers: 2,
            vocab_size: 10,
            intermediate_size: 12,
            use_mlp: true,
            block_norms: true,
            final_norm: true,
            norm_eps: 1e-5,
            tie_word_embeddings: false,
        }
    }

    fn random_model(config: &TokenShiftConfig) -> TokenShiftLm {
        let device = Device::Cpu;
        let d = config.hidden_size;
        let mut ts: HashMap<String, Tensor> = HashMap::new();
        let mut randn = |name: &str, shape: &[usize]| {
            ts.insert(
                name.to_string(),
                Tensor::randn(0.0_f32, 0.5, shape, &device).unwrap(),
            );
        };
        randn("emb.weight", &[config.vocab_size, d]);
        randn("head.weight", &[config.vocab_size, d]);
        for i in 0..config.num_layers {
            randn(&format!("blocks.{i}.mix.time_mix"), &[d]);
            randn(&format!("blocks.{i}.mix.proj.weight"), &[d, d]);
            randn(&format!("blocks.{i}.ffn.key.weight"), &[config.intermediate_size, d]);
            randn(&format!("blocks.{i}.ffn.value.weight"), &[d, config.intermediate_size]);
        }
        let mut norms = vec!["ln_out".to_string()];
        for i in 0..config.num_layers {
            norms.push(format!("blocks.{i}.ln1"));
            norms.push(format!("blocks.{i}.ln2"));
        }
        for norm in norms {
            ts.insert(format!("{norm}.weight"), Tensor::ones(d, DType::F32, &device).unwrap());
            ts.insert(format!("{norm}.bias"), Tensor::zeros(d, DType::F32, &device).unwrap());
        }
        let vb = VarBuilder::from_tensors(ts, DType::F32, &device);
        TokenShiftLm::load(config.clone(), vb).unwrap()
    }

    #[test]
    fn token_shift_zero_pads_first_position() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[[[1.0_f32, 2.0], [3.0, 4.0], [5.0, 6.0]]], &device).unwrap();
        let shifted: Vec<Vec<Vec<f32>>> = token_shift(&xs).unwrap().to_vec3().unwrap();
        assert_eq!(shifted[0], vec![vec![0.0, 0.0], vec![1.0, 2.0], vec![3.0, 4.0]]);

        let single = Tensor::new(&[[[1.0_f32, 2.0]]], &device).unwrap();
        let shifted: Vec<Vec<Vec<f32>>> = token_shift(&single).unwrap().to_vec3().unwrap();
        assert_eq!(shifted[0], vec![vec![0.0, 0.0]]);
    }

    #[test]
    fn forward_shapes_and_captures() {
        let config = random_config();
        let model = random_model(&config);
        let ids = Tensor::new(&[[1_u32, 2, 3, 4], [4, 3, 2, 1]], &Device::Cpu).unwrap();

        let mut hooks = HookSpec::new();
        hooks
            .capture(HookPoint::ResidPost(0))
            .capture(HookPoint::ResidPost(1));
        let cache = model.forward(&ids, &hooks).unwrap();

        assert_eq!(cache.output().dims(), &[2, 4, 10]);
        assert_eq!(cache.require(&HookPoint::ResidPost(0)).unwrap().dims(), &[2, 4, 6]);
        assert_eq!(cache.num_captures(), 2);
        assert!(cache.get(&HookPoint::ResidPost(2)).is_none());
    }

    #[test]
    fn project_to_vocab_matches_forward_logits() {
        let config = random_config();
        let model = random_model(&config);
        let ids = Tensor::new(&[[5_u32, 6, 7]], &Device::Cpu).unwrap();

        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::ResidPost(config.num_layers - 1));
        let cache = model.forward(&ids, &hooks).unwrap();
        let last_resid = cache
            .require(&HookPoint::ResidPost(config.num_layers - 1))
            .unwrap()
            .narrow(1, 2, 1)
            .unwrap()
            .squeeze(1)
            .unwrap();

        let projected: Vec<Vec<f32>> = model.project_to_vocab(&last_resid).unwrap().to_vec2().unwrap();
        let logits: Vec<Vec<Vec<f32>>> = cache.output().to_vec3().unwrap();
        for (a, b) in projected[0].iter().zip(logits[0][2].iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn patch_only_affects_current_and_later_positions() {
        let config = random_config();
        let model = random_model(&config);
        let ids = Tensor::new(&[[1_u32, 2, 3, 4, 5]], &Device::Cpu).unwrap();

        let clean: Vec<Vec<Vec<f32>>> = model
            .forward(&ids, &HookSpec::new())
            .unwrap()
            .into_output()
            .to_vec3()
            .unwrap();

        let mut hooks = HookSpec::new();
        hooks.intervene(
            HookPoint::ResidPost(0),
            Intervention::ReplacePosition {
                position: 2,
                vector: Tensor::ones(6, DType::F32, &Device::Cpu).unwrap(),
            },
        );
        let patched: Vec<Vec<Vec<f32>>> = model
            .forward(&ids, &hooks)
            .unwrap()
            .into_output()
            .to_vec3()
            .unwrap();

        let max_diff = |pos: usize| {
            clean[0][pos]
                .iter()
                .zip(&patched[0][pos])
                .map(|(a, b)| (a - b).abs())
                .fold(0.0_f32, f32::max)
        };
        assert!(max_diff(0) < 1e-6);
        assert!(max_diff(1) < 1e-6);
        assert!(max_diff(2) > 1e-4);
        assert!(max_diff(3) > 1e-4);
    }

    #[test]
    fn tied_embeddings_skip_head_weight() {
        let config = TokenShiftConfig {
            tie_word_embeddings: true,
            use_mlp: false,
            block_norms: false,
            final_norm: false,
            ..random_config()
        };
        let device = Device::Cpu;
        let mut ts = HashMap::new();
        ts.insert(
            "emb.weight".to_string(),
            Tensor::eye(6, DType::F32, &device).unwrap().pad_with_zeros(0, 0, 4).unwrap(),
        );
        for i in 0..config.num_layers {
            ts.insert(
                format!("blocks.{i}.mix.time_mix"),
                Tensor::ones(6, DType::F32, &device).unwrap(),
            );
            ts.insert(
                format!("blocks.{i}.mix.proj.weight"),
                Tensor::zeros((6, 6), DType::F32, &device).unwrap(),
            );
        }
        let model = TokenShiftLm::load(config, VarBuilder::from_tensors(ts, DType::F32, &device)).unwrap();

        // Zero projections make the model the identity on one-hot embeddings.
        let ids = Tensor::new(&[[3_u32]], &device).unwrap();
        let logits: Vec<Vec<Vec<f32>>> = model
            .forward(&ids, &HookSpec::new())
            .unwrap()
            .into_output()
            .to_vec3()
            .unwrap();
        assert_eq!(logits[0][0][3], 1.0);
        assert_eq!(logits[0][0].iter().filter(|v| **v != 0.0).count(), 1);
    }
}
