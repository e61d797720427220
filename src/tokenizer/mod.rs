// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer abstraction over the `HuggingFace` `tokenizers` crate.
//!
//! [`LreTokenizer`] provides the encode/decode surface the relation
//! pipeline needs, including offset-aware encoding for locating subject
//! tokens inside rendered prompts.

use crate::error::{LreError, Result};
use crate::util::positioning::EncodingWithOffsets;

/// Tokenizer used by [`LreModel`](crate::LreModel).
///
/// # Example
///
/// ```no_run
/// use candle_lre::LreTokenizer;
///
/// # fn main() -> candle_lre::Result<()> {
/// let tok = LreTokenizer::from_hf_path("tokenizer.json")?;
/// let ids = tok.encode("The capital city of France is")?;
/// let text = tok.decode(&ids)?;
/// assert!(!ids.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct LreTokenizer(tokenizers::Tokenizer);

impl LreTokenizer {
    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_hf_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            LreError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self(tok))
    }

    /// Build a `HuggingFace` tokenizer from the contents of a
    /// `tokenizer.json` document.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if the JSON is not a valid tokenizer.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_bytes(json.as_bytes())
            .map_err(|e| LreError::Tokenizer(format!("failed to parse HF tokenizer JSON: {e}")))?;
        Ok(Self(tok))
    }

    /// Build a whitespace-split word-level tokenizer over `words`.
    ///
    /// Token IDs follow the order of `words`. `unk_token` must be one of
    /// `words`; any other out-of-vocabulary word encodes to it.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if `unk_token` is not in `words` or
    /// a word is repeated.
    pub fn word_level<S: AsRef<str>>(words: &[S], unk_token: &str) -> Result<Self> {
        let mut vocab = serde_json::Map::with_capacity(words.len());
        for (id, word) in words.iter().enumerate() {
            let previous = vocab.insert(word.as_ref().to_string(), serde_json::Value::from(id));
            if previous.is_some() {
                return Err(LreError::Tokenizer(format!(
                    "duplicate word `{}` in word-level vocabulary",
                    word.as_ref()
                )));
            }
        }
        if !vocab.contains_key(unk_token) {
            return Err(LreError::Tokenizer(format!(
                "unknown token `{unk_token}` is not in the vocabulary"
            )));
        }
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": unk_token }
        });
        Self::from_json_str(&json.to_string())
    }

    /// Write the tokenizer as a `tokenizer.json` document.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        self.0.save(path.as_ref(), false).map_err(|e| {
            LreError::Tokenizer(format!(
                "failed to save HF tokenizer to {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Encode text into token IDs, adding special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .0
            .encode(text, true)
            .map_err(|e| LreError::Tokenizer(format!("HF encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode text with special tokens and keep each token's byte offsets
    /// into `text`.
    ///
    /// Special tokens carry a `(0, 0)` offset and therefore never match a
    /// subject range.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if encoding fails.
    pub fn encode_with_offsets(&self, text: &str) -> Result<EncodingWithOffsets> {
        let encoding = self
            .0
            .encode(text, true)
            .map_err(|e| LreError::Tokenizer(format!("HF encode failed: {e}")))?;
        Ok(EncodingWithOffsets::new(
            encoding.get_ids().to_vec(),
            encoding.get_tokens().to_vec(),
            encoding.get_offsets().to_vec(),
        ))
    }

    /// Decode token IDs back to a string.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.0
            .decode(ids, false)
            .map_err(|e| LreError::Tokenizer(format!("HF decode failed: {e}")))
    }

    /// Look up the ID of a single vocabulary token.
    #[must_use]
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.0.token_to_id(token)
    }

    /// Get vocabulary size (including added tokens).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.0.get_vocab_size(true)
    }
}

impl std::fmt::Debug for LreTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LreTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
