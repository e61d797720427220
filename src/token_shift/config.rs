// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-shift language model configuration and `config.json` parsing.
//!
//! # Usage
//!
//! ```
//! use candle_lre::token_shift::TokenShiftConfig;
//!
//! let json: serde_json::Value = serde_json::from_str(
//!     r#"{"model_type": "token_shift", "hidden_size": 64,
//!         "num_hidden_layers": 4, "vocab_size": 128}"#,
//! ).unwrap();
//! let config = TokenShiftConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_layers, 4);
//! assert!(config.use_mlp);
//! ```

use serde_json::Value;

use crate::config::{get_bool_or, get_f64_or, get_usize, get_usize_or};
use crate::error::{LreError, Result};

/// `model_type` accepted by [`TokenShiftConfig::from_hf_config`].
pub const TOKEN_SHIFT_MODEL_TYPE: &str = "token_shift";

/// Configuration for [`TokenShiftLm`](super::TokenShiftLm).
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::struct_excessive_bools)] // Config structs legitimately have many boolean axes
pub struct TokenShiftConfig {
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of blocks.
    pub num_layers: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Channel-mix hidden dimension.
    pub intermediate_size: usize,
    /// Whether each block has a channel-mix MLP after the token mix.
    pub use_mlp: bool,
    /// Whether each sublayer is preceded by a layer norm.
    pub block_norms: bool,
    /// Whether a final layer norm precedes the unembedding.
    pub final_norm: bool,
    /// Layer norm epsilon.
    pub norm_eps: f64,
    /// Whether the unembedding reuses the embedding matrix.
    pub tie_word_embeddings: bool,
}

impl TokenShiftConfig {
    /// Parse a config from a `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] if `model_type` is not
    /// [`TOKEN_SHIFT_MODEL_TYPE`] or a required dimension is missing.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| LreError::Config("missing 'model_type' field".into()))?;
        if model_type != TOKEN_SHIFT_MODEL_TYPE {
            return Err(LreError::Config(format!(
                "unsupported model_type: '{model_type}'"
            )));
        }

        let hidden_size = get_usize(config, "hidden_size")?;
        let parsed = Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            vocab_size: get_usize(config, "vocab_size")?,
            intermediate_size: get_usize_or(config, "intermediate_size", hidden_size * 4),
            use_mlp: get_bool_or(config, "use_mlp", true),
            block_norms: get_bool_or(config, "block_norms", true),
            final_norm: get_bool_or(config, "final_norm", true),
            norm_eps: get_f64_or(config, "layer_norm_epsilon", 1e-5),
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", true),
        };
        if parsed.num_layers == 0 || parsed.hidden_size == 0 || parsed.vocab_size == 0 {
            return Err(LreError::Config(
                "hidden_size, num_hidden_layers and vocab_size must be non-zero".into(),
            ));
        }
        Ok(parsed)
    }

    /// Serialize back to the `config.json` layout read by
    /// [`from_hf_config`](Self::from_hf_config).
    #[must_use]
    pub fn to_hf_config(&self) -> Value {
        serde_json::json!({
            "model_type": TOKEN_SHIFT_MODEL_TYPE,
            "hidden_size": self.hidden_size,
            "num_hidden_layers": self.num_layers,
            "vocab_size": self.vocab_size,
            "intermediate_size": self.intermediate_size,
            "use_mlp": self.use_mlp,
            "block_norms": self.block_norms,
            "final_norm": self.final_norm,
            "layer_norm_epsilon": self.norm_eps,
            "tie_word_embeddings": self.tie_word_embeddings,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_optional_axes() {
        let json = serde_json::json!({
            "model_type": "token_shift",
            "hidden_size": 8,
            "num_hidden_layers": 2,
            "vocab_size": 16,
        });
        let config = TokenShiftConfig::from_hf_config(&json).unwrap();
        assert_eq!(config.intermediate_size, 32);
        assert!(config.block_norms);
        assert!(config.final_norm);
        assert!(config.tie_word_embeddings);
    }

    #[test]
    fn hf_config_roundtrip() {
        let config = TokenShiftConfig {
            hidden_size: 4,
            num_layers: 3,
            vocab_size: 4,
            intermediate_size: 8,
            use_mlp: false,
            block_norms: false,
            final_norm: false,
            norm_eps: 1e-6,
            tie_word_embeddings: false,
        };
        let parsed = TokenShiftConfig::from_hf_config(&config.to_hf_config()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn wrong_model_type_is_rejected() {
        let json = serde_json::json!({
            "model_type": "llama",
            "hidden_size": 8,
            "num_hidden_layers": 2,
            "vocab_size": 16,
        });
        assert!(matches!(
            TokenShiftConfig::from_hf_config(&json),
            Err(LreError::Config(_))
        ));
    }
}
