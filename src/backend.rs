// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`LreBackend`] is the trait that every model backend implements.
//! [`LreModel`] wraps a backend with its tokenizer and device and exposes
//! the prompt-level operations the relation pipeline is built on:
//! subject hidden states, next-token predictions, Jacobians of the final
//! representation, activation-patched predictions, and logit-lens
//! decoding of arbitrary representations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};

use crate::cache::SubjectState;
use crate::error::{LreError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};
use crate::interp::intervention::ActivationPatch;
use crate::interp::logit_lens::{TokenPrediction, decode_predictions_with, top_k_probabilities};
use crate::token_shift::{TokenShiftConfig, TokenShiftLm};
use crate::tokenizer::LreTokenizer;

// ---------------------------------------------------------------------------
// LreBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model backends with hook-aware forward passes.
///
/// The caller specifies captures and interventions via [`HookSpec`], and
/// the backend returns a [`HookCache`] containing the logits plus any
/// requested activations. Backends must honour
/// [`Intervention::ReplacePosition`] at [`HookPoint::ResidPost`] for
/// activation patching to work.
pub trait LreBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of blocks.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Vocabulary size.
    fn vocab_size(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// Unified forward pass with optional hook capture and interventions.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`] on tensor operation failures and
    /// [`LreError::Intervention`] if an intervention is invalid for
    /// the current model dimensions.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Logit projection ------------------------------------------------

    /// Project final-block representations to vocabulary logits, applying
    /// the final norm and the unembedding.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, hidden_size]`
    /// - returns: `[batch, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`] on shape mismatch or tensor operation failure.
    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor>;

    // --- Differentiation -------------------------------------------------

    /// Final-block residual stream as a differentiable function of the
    /// block output of `layer` at `position`.
    ///
    /// Every other activation is recomputed from `input_ids` and is not
    /// differentiated. The default implementation splices `replacement`
    /// in with [`Intervention::ReplacePosition`] and captures the last
    /// [`HookPoint::ResidPost`]; backends whose forward pass is not
    /// differentiable end to end should override it.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - `replacement`: `[batch, hidden_size]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Hook`] if the backend has no layers, and
    /// propagates forward-pass errors.
    fn differentiable_forward(
        &self,
        input_ids: &Tensor,
        layer: usize,
        position: usize,
        replacement: &Tensor,
    ) -> Result<Tensor> {
        let last_layer = self
            .num_layers()
            .checked_sub(1)
            .ok_or_else(|| LreError::Hook("backend has no layers".into()))?;
        let output_hook = HookPoint::ResidPost(last_layer);

        let mut hooks = HookSpec::new();
        hooks.intervene(
            HookPoint::ResidPost(layer),
            Intervention::ReplacePosition {
                position,
                vector: replacement.clone(),
            },
        );
        hooks.capture(output_hook.clone());

        let cache = self.forward(input_ids, &hooks)?;
        Ok(cache.require(&output_hook)?.clone())
    }
}

// ---------------------------------------------------------------------------
// Query types
// ---------------------------------------------------------------------------

/// A rendered prompt together with the subject whose hidden state is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectQuery {
    /// Full prompt text (few-shot demonstrations included).
    pub prompt: String,
    /// Subject string; its last occurrence in `prompt` is used.
    pub subject: String,
}

impl SubjectQuery {
    /// Create a query.
    #[must_use]
    pub fn new(prompt: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            subject: subject.into(),
        }
    }
}

/// Token IDs and the two read positions of a [`SubjectQuery`].
#[derive(Debug, Clone)]
pub struct EncodedQuery {
    /// Prompt token IDs.
    pub ids: Vec<u32>,
    /// Index of the subject's last token.
    pub subject_position: usize,
    /// Index of the prompt's last token.
    pub last_position: usize,
}

/// Subject state plus the Jacobian `∂z/∂h` at that point.
#[derive(Debug, Clone)]
pub struct JacobianPoint {
    /// `h` and `z` the Jacobian was taken at.
    pub state: SubjectState,
    /// `[hidden_size, hidden_size]`; row `i` is `∂z_i/∂h`.
    pub jacobian: Tensor,
}

// ---------------------------------------------------------------------------
// LreModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend, its tokenizer and device.
pub struct LreModel {
    /// The underlying model backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    backend: Box<dyn LreBackend>,
    /// Tokenizer matching the backend's vocabulary.
    tokenizer: LreTokenizer,
    /// The device this model lives on.
    device: Device,
    /// Identifier recorded in run records.
    model_id: String,
}

impl LreModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous model backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn LreBackend>, tokenizer: LreTokenizer, device: Device) -> Self {
        Self {
            backend,
            tokenizer,
            device,
            model_id: "unnamed".to_string(),
        }
    }

    /// Set the identifier recorded in run records.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Load a token-shift model from a directory holding `config.json`,
    /// `model.safetensors` and `tokenizer.json`.
    ///
    /// The directory name becomes the model identifier.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Io`] / [`LreError::Json`] if a file cannot be
    /// read, [`LreError::Config`] if the config is invalid, and
    /// [`LreError::Model`] if weight loading fails.
    pub fn from_local_dir(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();

        let config_str = std::fs::read_to_string(dir.join("config.json"))?;
        let json: serde_json::Value = serde_json::from_str(&config_str)?;
        let config = TokenShiftConfig::from_hf_config(&json)?;

        let weights = dir.join("model.safetensors");
        let vb = create_var_builder(&[weights], DType::F32, device)?;
        let backend = TokenShiftLm::load(config, vb)?;

        let tokenizer = LreTokenizer::from_hf_path(dir.join("tokenizer.json"))?;
        if tokenizer.vocab_size() > backend.config().vocab_size {
            return Err(LreError::Config(format!(
                "tokenizer has {} tokens but the model only {}",
                tokenizer.vocab_size(),
                backend.config().vocab_size
            )));
        }

        let model_id = dir
            .file_name()
            .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned());
        tracing::info!(model_id = %model_id, "loaded token-shift model");

        Ok(Self::new(Box::new(backend), tokenizer, device.clone()).with_model_id(model_id))
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Identifier recorded in run records.
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// The tokenizer.
    #[must_use]
    pub const fn tokenizer(&self) -> &LreTokenizer {
        &self.tokenizer
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Access the underlying backend.
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn LreBackend {
        &*self.backend
    }

    /// Run a forward pass with the given hook specification.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }

    // --- Encoding --------------------------------------------------------

    /// Tokenize a prompt, rejecting prompts that encode to nothing.
    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let ids = self.tokenizer.encode(prompt)?;
        if ids.is_empty() {
            return Err(LreError::Tokenizer(format!(
                "prompt {prompt:?} encodes to zero tokens"
            )));
        }
        Ok(ids)
    }

    /// Tokenize a query and locate the subject's last token.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if the prompt is empty or the
    /// subject does not occur in it.
    pub fn encode_query(&self, query: &SubjectQuery) -> Result<EncodedQuery> {
        let encoding = self.tokenizer.encode_with_offsets(&query.prompt)?;
        let last_position = encoding.last_index().ok_or_else(|| {
            LreError::Tokenizer(format!("prompt {:?} encodes to zero tokens", query.prompt))
        })?;
        let subject_position = encoding
            .subject_last_token(&query.prompt, &query.subject)
            .ok_or_else(|| {
                LreError::Tokenizer(format!(
                    "subject {:?} not found in prompt {:?}",
                    query.subject, query.prompt
                ))
            })?;
        Ok(EncodedQuery {
            ids: encoding.ids,
            subject_position,
            last_position,
        })
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.num_layers() {
            return Err(LreError::Config(format!(
                "layer {layer} out of range (model has {} layers)",
                self.num_layers()
            )));
        }
        Ok(())
    }

    /// Hook point `z` is read from.
    fn final_hook(&self) -> Result<HookPoint> {
        self.num_layers()
            .checked_sub(1)
            .map(HookPoint::ResidPost)
            .ok_or_else(|| LreError::Hook("model has no layers".into()))
    }

    // --- Batched forward -------------------------------------------------

    /// Run `inputs` through the model in chunks of `batch_size`, grouping
    /// equal-length sequences so no padding is needed, and call `extract`
    /// once per input with its cache and batch row.
    ///
    /// Results are returned in input order.
    fn run_batched<T>(
        &self,
        inputs: &[Vec<u32>],
        batch_size: usize,
        hooks: &HookSpec,
        mut extract: impl FnMut(usize, &HookCache, usize) -> Result<T>,
    ) -> Result<Vec<T>> {
        let batch_size = batch_size.max(1);
        let mut results: Vec<Option<T>> = (0..inputs.len()).map(|_| None).collect();

        for chunk_start in (0..inputs.len()).step_by(batch_size) {
            let chunk_end = (chunk_start + batch_size).min(inputs.len());

            let mut buckets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (offset, ids) in inputs.iter().enumerate().take(chunk_end).skip(chunk_start) {
                buckets.entry(ids.len()).or_default().push(offset);
            }

            for (seq_len, members) in buckets {
                let flat: Vec<u32> = members
                    .iter()
                    .filter_map(|&i| inputs.get(i))
                    .flat_map(|ids| ids.iter().copied())
                    .collect();
                let input_ids = Tensor::from_vec(flat, (members.len(), seq_len), &self.device)?;
                let cache = self.backend.forward(&input_ids, hooks)?;
                for (row, &input_idx) in members.iter().enumerate() {
                    let value = extract(input_idx, &cache, row)?;
                    if let Some(slot) = results.get_mut(input_idx) {
                        *slot = Some(value);
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| LreError::Hook("batched forward skipped an input".into())))
            .collect()
    }

    // --- Hidden states ---------------------------------------------------

    /// Subject states for many queries, batched.
    ///
    /// `h` is read from [`HookPoint::ResidPost`]`(layer)` on each subject's
    /// last token, `z` from the final block on each prompt's last token.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] if `layer` is out of range,
    /// [`LreError::Tokenizer`] if a subject is absent from its prompt, and
    /// propagates forward-pass errors.
    pub fn subject_states(
        &self,
        queries: &[SubjectQuery],
        layer: usize,
        batch_size: usize,
    ) -> Result<Vec<SubjectState>> {
        self.check_layer(layer)?;
        let encoded: Vec<EncodedQuery> = queries
            .iter()
            .map(|q| self.encode_query(q))
            .collect::<Result<_>>()?;
        let inputs: Vec<Vec<u32>> = encoded.iter().map(|e| e.ids.clone()).collect();

        let h_hook = HookPoint::ResidPost(layer);
        let z_hook = self.final_hook()?;
        let mut hooks = HookSpec::new();
        hooks.capture(h_hook.clone()).capture(z_hook.clone());

        self.run_batched(&inputs, batch_size, &hooks, |idx, cache, row| {
            let enc = encoded
                .get(idx)
                .ok_or_else(|| LreError::Hook(format!("no encoding for input {idx}")))?;
            let h = cache
                .require(&h_hook)?
                .get(row)?
                .get(enc.subject_position)?;
            let z = cache.require(&z_hook)?.get(row)?.get(enc.last_position)?;
            Ok(SubjectState {
                h,
                z,
                h_position: enc.subject_position,
                z_position: enc.last_position,
            })
        })
    }

    /// Subject state for a single query.
    ///
    /// # Errors
    ///
    /// Same as [`subject_states`](Self::subject_states).
    pub fn subject_state(&self, query: &SubjectQuery, layer: usize) -> Result<SubjectState> {
        self.subject_states(std::slice::from_ref(query), layer, 1)?
            .pop()
            .ok_or_else(|| LreError::Hook("no state returned for query".into()))
    }

    // --- Predictions -----------------------------------------------------

    /// Top-`k` next-token predictions for many prompts, batched.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Tokenizer`] if a prompt cannot be encoded or a
    /// token cannot be decoded, and propagates forward-pass errors.
    pub fn predict_batch(
        &self,
        prompts: &[String],
        k: usize,
        batch_size: usize,
    ) -> Result<Vec<Vec<TokenPrediction>>> {
        let inputs: Vec<Vec<u32>> = prompts
            .iter()
            .map(|p| self.encode_prompt(p))
            .collect::<Result<_>>()?;

        self.run_batched(&inputs, batch_size, &HookSpec::new(), |idx, cache, row| {
            let last = inputs
                .get(idx)
                .map(|ids| ids.len() - 1)
                .ok_or_else(|| LreError::Hook(format!("no encoding for input {idx}")))?;
            let logits = cache.output().get(row)?.get(last)?;
            self.decode_logits(&logits, k)
        })
    }

    /// Top-`k` next-token predictions for one prompt.
    ///
    /// # Errors
    ///
    /// Same as [`predict_batch`](Self::predict_batch).
    pub fn predict(&self, prompt: &str, k: usize) -> Result<Vec<TokenPrediction>> {
        self.predict_batch(&[prompt.to_string()], k, 1)?
            .pop()
            .ok_or_else(|| LreError::Hook("no prediction returned for prompt".into()))
    }

    /// Project a final-block representation to vocabulary logits.
    ///
    /// # Shapes
    /// - `representation`: `[hidden_size]`
    /// - returns: `[vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates backend projection errors.
    pub fn representation_logits(&self, representation: &Tensor) -> Result<Tensor> {
        let batched = representation.unsqueeze(0)?;
        Ok(self.backend.project_to_vocab(&batched)?.squeeze(0)?)
    }

    /// Decode a final-block representation into top-`k` predictions via the
    /// model's final norm and unembedding.
    ///
    /// # Errors
    ///
    /// Propagates projection and tokenizer errors.
    pub fn decode(&self, representation: &Tensor, k: usize) -> Result<Vec<TokenPrediction>> {
        let logits = self.representation_logits(representation)?;
        self.decode_logits(&logits, k)
    }

    /// Top-`k` predictions of a `[vocab_size]` logit vector.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Hook`] for empty logits and propagates tokenizer
    /// errors.
    pub fn decode_logits(&self, logits: &Tensor, k: usize) -> Result<Vec<TokenPrediction>> {
        let top = top_k_probabilities(logits, k)?;
        decode_predictions_with(&top, |id| self.tokenizer.decode(&[id]))
    }

    // --- Patching --------------------------------------------------------

    /// Last-position logits of `prompt` with `patch` applied.
    ///
    /// # Shapes
    /// - returns: `[vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Intervention`] if the patch does not fit the
    /// model or prompt, and propagates forward-pass errors.
    pub fn patched_logits(&self, prompt: &str, patch: &ActivationPatch) -> Result<Tensor> {
        let ids = self.encode_prompt(prompt)?;
        patch.validate(self.num_layers(), ids.len(), self.hidden_size())?;

        let mut hooks = HookSpec::new();
        patch.register(&mut hooks);

        let last = ids.len() - 1;
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let cache = self.backend.forward(&input_ids, &hooks)?;
        Ok(cache.output().get(0)?.get(last)?)
    }

    /// Top-`k` next-token predictions of `prompt` with `patch` applied.
    ///
    /// # Errors
    ///
    /// Same as [`patched_logits`](Self::patched_logits).
    pub fn patched_predict(
        &self,
        prompt: &str,
        patch: &ActivationPatch,
        k: usize,
    ) -> Result<Vec<TokenPrediction>> {
        let logits = self.patched_logits(prompt, patch)?;
        self.decode_logits(&logits, k)
    }

    // --- Jacobian --------------------------------------------------------

    /// Jacobian of the final representation `z` (last token) with respect to
    /// the subject hidden state `h` (layer `layer`, subject's last token).
    ///
    /// Rows are computed `chunk` at a time: the prompt is replicated `chunk`
    /// times, each copy's `h` is an independent row of one variable, and
    /// copy `b` back-propagates only output dimension `start + b`. A
    /// `d × d` Jacobian therefore costs `⌈d / chunk⌉` backward passes.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Config`] if `layer` is out of range and
    /// propagates encoding, forward and backward errors.
    pub fn jacobian(
        &self,
        query: &SubjectQuery,
        layer: usize,
        chunk: usize,
    ) -> Result<JacobianPoint> {
        self.check_layer(layer)?;
        let encoded = self.encode_query(query)?;
        let state = self.subject_state(query, layer)?;

        let hidden = self.hidden_size();
        let chunk = chunk.clamp(1, hidden.max(1));
        // PROMOTE: gradients are accumulated in F32 regardless of model dtype
        let h_row = state.h.to_dtype(DType::F32)?.reshape((1, hidden))?;

        let mut blocks = Vec::with_capacity(hidden.div_ceil(chunk));
        let mut start = 0;
        while start < hidden {
            let rows = chunk.min(hidden - start);
            let h_var = Var::from_tensor(&h_row.broadcast_as((rows, hidden))?.contiguous()?)?;
            let input_ids = Tensor::new(encoded.ids.as_slice(), &self.device)?
                .unsqueeze(0)?
                .repeat((rows, 1))?;

            let resid = self.backend.differentiable_forward(
                &input_ids,
                layer,
                encoded.subject_position,
                h_var.as_tensor(),
            )?;
            let z = resid
                .narrow(1, encoded.last_position, 1)?
                .squeeze(1)?
                .to_dtype(DType::F32)?;

            let mask = diagonal_selector(rows, hidden, start, &self.device)?;
            let selected = (z * mask)?.sum_all()?;
            let grads = selected.backward()?;
            let block = match grads.get(h_var.as_tensor()) {
                Some(grad) => grad.clone(),
                None => Tensor::zeros((rows, hidden), DType::F32, &self.device)?,
            };
            blocks.push(block);
            start += rows;
        }

        let jacobian = Tensor::cat(&blocks, 0)?;
        tracing::debug!(subject = %query.subject, layer, "computed jacobian");
        Ok(JacobianPoint { state, jacobian })
    }
}

impl std::fmt::Debug for LreModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LreModel")
            .field("model_id", &self.model_id)
            .field("num_layers", &self.num_layers())
            .field("hidden_size", &self.hidden_size())
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// `[rows, cols]` matrix with a one at `(b, offset + b)` for every row `b`.
fn diagonal_selector(rows: usize, cols: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0_f32; rows * cols];
    for b in 0..rows {
        if let Some(cell) = data.get_mut(b * cols + offset + b) {
            *cell = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

// ---------------------------------------------------------------------------
// Weight loading helpers
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading.
fn create_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered (safe) reading; reads all data into RAM.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    if paths.len() > 1 {
        return Err(LreError::Config(
            "sharded weights require the `mmap` feature".into(),
        ));
    }
    let path = paths
        .first()
        .ok_or_else(|| LreError::Config("no safetensors files".into()))?;
    let data = std::fs::read(path)?;
    let vb = candle_nn::VarBuilder::from_buffered_safetensors(data, dtype, device)?;
    Ok(vb)
}

/// Load weights via memory-mapped files.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticWorld;

    fn world() -> SyntheticWorld {
        SyntheticWorld::capitals().unwrap()
    }

    #[test]
    fn diagonal_selector_places_offsets() {
        let m: Vec<Vec<f32>> = diagonal_selector(2, 4, 1, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(m[0], vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(m[1], vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn encode_query_finds_subject_and_last_token() {
        let world = world();
        let model = world.model();
        let query = SubjectQuery::new("The capital of France is", "France");
        let encoded = model.encode_query(&query).unwrap();
        assert_eq!(encoded.ids.len(), 5);
        assert_eq!(encoded.subject_position, 3);
        assert_eq!(encoded.last_position, 4);

        let missing = SubjectQuery::new("The capital of France is", "Japan");
        assert!(matches!(
            model.encode_query(&missing),
            Err(LreError::Tokenizer(_))
        ));
    }

    #[test]
    fn batched_states_match_single_states_in_order() {
        let world = world();
        let model = world.model();
        let layer = world.source_layer();
        let queries = vec![
            SubjectQuery::new("The capital of France is", "France"),
            SubjectQuery::new("The capital of Japan is Tokyo\nThe capital of Peru is", "Peru"),
            SubjectQuery::new("The capital of Egypt is", "Egypt"),
        ];

        let batched = model.subject_states(&queries, layer, 2).unwrap();
        assert_eq!(batched.len(), 3);
        for (query, state) in queries.iter().zip(&batched) {
            let single = model.subject_state(query, layer).unwrap();
            assert_eq!(single.h_vec().unwrap(), state.h_vec().unwrap());
            assert_eq!(single.z_vec().unwrap(), state.z_vec().unwrap());
            assert_eq!(single.h_position, state.h_position);
        }
        assert_eq!(batched[1].h_position, 9);
        assert_eq!(batched[1].z_position, 10);
    }

    #[test]
    fn model_predicts_known_capital() {
        let world = world();
        let model = world.model();
        let preds = model.predict("The capital of France is", 3).unwrap();
        assert_eq!(preds.len(), 3);
        assert_eq!(preds[0].token, "Paris");

        let batch = model
            .predict_batch(
                &[
                    "The capital of Japan is".to_string(),
                    "The capital of France is".to_string(),
                ],
                1,
                4,
            )
            .unwrap();
        assert_eq!(batch[0][0].token, "Tokyo");
        assert_eq!(batch[1][0].token, "Paris");
    }

    #[test]
    fn decode_of_final_state_matches_prediction() {
        let world = world();
        let model = world.model();
        let query = SubjectQuery::new("The capital of Kenya is", "Kenya");
        let state = model.subject_state(&query, world.source_layer()).unwrap();
        let decoded = model.decode(&state.z, 1).unwrap();
        let predicted = model.predict(&query.prompt, 1).unwrap();
        assert_eq!(decoded[0].token, predicted[0].token);
    }

    #[test]
    fn jacobian_recovers_relation_map() {
        let world = world();
        let model = world.model();
        let layer = world.source_layer();
        let query = SubjectQuery::new("The capital of France is", "France");

        // Chunk sizes that do and do not divide the hidden size agree.
        let full = model.jacobian(&query, layer, model.hidden_size()).unwrap();
        let chunked = model.jacobian(&query, layer, 3).unwrap();
        let a: Vec<Vec<f32>> = full.jacobian.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = chunked.jacobian.to_vec2().unwrap();
        assert_eq!(a, b);

        // Column of "France" maps onto "Paris" with the wired strength.
        let france = world.token_id("France") as usize;
        let paris = world.token_id("Paris") as usize;
        assert!((a[paris][france] - world.strength("France")).abs() < 1e-5);
        assert!(a[paris][paris].abs() < 1e-6);
    }

    #[test]
    fn patched_prediction_follows_replacement() {
        let world = world();
        let model = world.model();
        let layer = world.source_layer();
        let prompt = "The capital of France is";
        let japan = model
            .subject_state(&SubjectQuery::new("The capital of Japan is", "Japan"), layer)
            .unwrap();

        let patch = ActivationPatch::new(layer, 3, japan.h);
        let preds = model.patched_predict(prompt, &patch, 1).unwrap();
        assert_eq!(preds[0].token, "Tokyo");

        let bad = ActivationPatch::new(layer, 9, Tensor::zeros(model.hidden_size(), DType::F32, &Device::Cpu).unwrap());
        assert!(model.patched_predict(prompt, &bad, 1).is_err());
    }

    #[test]
    fn layer_out_of_range_is_config_error() {
        let world = world();
        let model = world.model();
        let query = SubjectQuery::new("The capital of France is", "France");
        assert!(matches!(
            model.subject_state(&query, model.num_layers()),
            Err(LreError::Config(_))
        ));
    }

    /// Two-layer model with every nonlinearity switched on and seeded
    /// random weights, over a ten-word vocabulary.
    fn nonlinear_model() -> LreModel {
        use rand::{Rng, SeedableRng};

        let config = TokenShiftConfig {
            hidden_size: 6,
            num_layers: 2,
            vocab_size: 10,
            intermediate_size: 12,
            use_mlp: true,
            block_norms: true,
            final_norm: true,
            norm_eps: 1e-5,
            tie_word_embeddings: false,
        };
        let d = config.hidden_size;
        let device = Device::Cpu;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut ts = std::collections::HashMap::new();
        let mut random = |name: String, shape: &[usize]| {
            let n: usize = shape.iter().product();
            let data: Vec<f32> = (0..n).map(|_| rng.gen_range(-0.8..0.8)).collect();
            ts.insert(name, Tensor::from_vec(data, shape, &device).unwrap());
        };
        random("emb.weight".into(), &[config.vocab_size, d]);
        random("head.weight".into(), &[config.vocab_size, d]);
        for i in 0..config.num_layers {
            random(format!("blocks.{i}.mix.time_mix"), &[d]);
            random(format!("blocks.{i}.mix.proj.weight"), &[d, d]);
            random(format!("blocks.{i}.ffn.key.weight"), &[config.intermediate_size, d]);
            random(format!("blocks.{i}.ffn.value.weight"), &[d, config.intermediate_size]);
            for norm in ["ln1", "ln2"] {
                random(format!("blocks.{i}.{norm}.weight"), &[d]);
                random(format!("blocks.{i}.{norm}.bias"), &[d]);
            }
        }
        random("ln_out.weight".into(), &[d]);
        random("ln_out.bias".into(), &[d]);

        let vb = candle_nn::VarBuilder::from_tensors(ts, DType::F32, &device);
        let backend = TokenShiftLm::load(config, vb).unwrap();
        let words: &[&str] = &["[UNK]", "a", "b", "c", "d", "e", "f", "g", "h", "i"];
        let tokenizer = LreTokenizer::word_level(words, "[UNK]").unwrap();
        LreModel::new(Box::new(backend), tokenizer, device)
    }

    #[test]
    fn jacobian_matches_finite_differences_through_norms_and_mlp() {
        let model = nonlinear_model();
        let query = SubjectQuery::new("b a c d e", "d");
        let layer = 0;
        let point = model.jacobian(&query, layer, 4).unwrap();
        let jacobian: Vec<Vec<f32>> = point.jacobian.to_vec2().unwrap();
        let h: Vec<f32> = point.state.h.to_vec1().unwrap();
        let d = model.hidden_size();
        assert_eq!(jacobian.len(), d);

        let encoded = model.encode_query(&query).unwrap();
        let ids = Tensor::new(encoded.ids.as_slice(), &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let z_at = |h: &[f32]| -> Vec<f32> {
            let replacement = Tensor::from_vec(h.to_vec(), (1, d), &Device::Cpu).unwrap();
            let resid = model
                .backend()
                .differentiable_forward(&ids, layer, encoded.subject_position, &replacement)
                .unwrap();
            resid.get(0).unwrap().get(encoded.last_position).unwrap().to_vec1().unwrap()
        };

        let eps = 5e-3_f32;
        let mut largest = 0.0_f32;
        for j in 0..d {
            let mut plus = h.clone();
            let mut minus = h.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let (z_plus, z_minus) = (z_at(&plus), z_at(&minus));
            for i in 0..d {
                let numeric = (z_plus[i] - z_minus[i]) / (2.0 * eps);
                let analytic = jacobian[i][j];
                largest = largest.max(analytic.abs());
                assert!(
                    (analytic - numeric).abs() <= 1e-2 + 2e-2 * numeric.abs(),
                    "J[{i}][{j}]: autograd {analytic} vs finite difference {numeric}"
                );
            }
        }
        assert!(largest > 1e-2, "jacobian is degenerate");
    }
}
