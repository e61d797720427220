// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and patching.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and where to intervene), and
//! [`HookCache`] (captured tensors from a forward pass).
//!
//! Relation operators read hidden states from captured
//! [`HookPoint::ResidPost`] tensors; edits are delivered as an
//! [`Intervention::ReplacePosition`] on the same hook point.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{LreError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or interventions applied.
///
/// Follows the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// # String conversion
///
/// ```
/// use candle_lre::HookPoint;
///
/// let hook = HookPoint::ResidPost(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.hook_resid_post".parse().unwrap();
/// assert_eq!(parsed, hook);
/// assert!("hook_embed".parse::<HookPoint>().is_err());
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
impl FromStr for HookPoint {
    type Err = LreError;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix("blocks.")
            .and_then(|rest| rest.strip_suffix(".hook_resid_post"))
            .and_then(|layer| layer.parse::<usize>().ok())
            .map(HookPoint::ResidPost)
            .ok_or_else(|| LreError::Hook(format!("unsupported hook point `{s}`")))
    }
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention applied at a hook point during the forward pass.
///
/// Specified as part of a [`HookSpec`] and applied by the backend at the
/// corresponding [`HookPoint`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Overwrite one sequence position of a `[batch, seq, hidden]`
    /// activation.
    ///
    /// `vector` is either `[hidden]` (same row for every batch element) or
    /// `[batch, hidden]` (one row per batch element). Gradients flow
    /// through `vector`, which is how Jacobians are taken with respect to a
    /// single hidden state.
    ReplacePosition {
        /// Sequence position to overwrite.
        position: usize,
        /// Replacement row(s).
        vector: Tensor,
    },
}

// ---------------------------------------------------------------------------
// Intervention application
// ---------------------------------------------------------------------------

/// Apply a single [`Intervention`] to a tensor.
///
/// Used by backend implementations at each hook point that supports
/// interventions.
///
/// # Shapes
/// - `tensor`: `[batch, seq, hidden]`
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`LreError::Intervention`] if a position is out of range or the
/// replacement row has the wrong rank, and [`LreError::Model`] if the
/// underlying tensor operation fails.
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::ReplacePosition { position, vector } => {
            replace_position(tensor, *position, vector)
        }
    }
}

/// Splice `vector` into `tensor` at sequence `position`.
///
/// Built from `narrow` + `cat` so that the result stays differentiable
/// with respect to `vector`.
fn replace_position(tensor: &Tensor, position: usize, vector: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, hidden) = tensor.dims3()?;
    if position >= seq_len {
        return Err(LreError::Intervention(format!(
            "position {position} out of range for sequence length {seq_len}"
        )));
    }

    let row = match vector.rank() {
        1 => vector
            .reshape((1, 1, hidden))?
            .broadcast_as((batch, 1, hidden))?
            .contiguous()?,
        2 => vector.reshape((batch, 1, hidden))?,
        r => {
            return Err(LreError::Intervention(format!(
                "replacement vector must be rank 1 or 2, got rank {r}"
            )));
        }
    };
    let row = row.to_dtype(tensor.dtype())?;

    // Zero-length narrows are avoided at both ends.
    let mut parts = Vec::with_capacity(3);
    if position > 0 {
        parts.push(tensor.narrow(1, 0, position)?);
    }
    parts.push(row);
    let tail = seq_len - position - 1;
    if tail > 0 {
        parts.push(tensor.narrow(1, position + 1, tail)?);
    }
    Ok(Tensor::cat(&parts, 1)?)
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// Passed to [`LreBackend::forward`](crate::LreBackend::forward). When empty,
/// the forward pass does no extra work (no clones, no extra allocations).
///
/// # Example
///
/// ```
/// use candle_lre::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::ResidPost(5))
///      .capture("blocks.11.hook_resid_post".parse::<HookPoint>()?);
/// # Ok::<(), candle_lre::LreError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no interventions).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors captured during a forward pass, plus the output logits.
///
/// Returned by [`LreBackend::forward`](crate::LreBackend::forward). Use
/// [`get`](Self::get) to retrieve activations at specific hook points.
///
/// # Example
///
/// ```
/// use candle_lre::{HookCache, HookPoint};
/// use candle_core::{Device, Tensor};
///
/// let logits = Tensor::zeros((1, 10, 64), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
///
/// let resid = Tensor::zeros((1, 10, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::ResidPost(3), resid);
///
/// assert!(cache.get(&HookPoint::ResidPost(3)).is_some());
/// assert_eq!(cache.num_captures(), 1);
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (typically logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| LreError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor (e.g., after computing final logits).
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
