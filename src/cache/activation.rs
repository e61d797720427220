// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subject hidden-state cache.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::error::{LreError, Result};

/// Representations of one subject read from a single forward pass.
///
/// `h` is the block output at the operator's source layer on the subject's
/// last token; `z` is the final block output on the prompt's last token.
#[derive(Debug, Clone)]
pub struct SubjectState {
    /// Subject hidden state, shape `[hidden_size]`.
    pub h: Tensor,
    /// Final-layer representation at the prediction position, shape
    /// `[hidden_size]`.
    pub z: Tensor,
    /// Token index `h` was read from.
    pub h_position: usize,
    /// Token index `z` was read from (the prompt's last token).
    pub z_position: usize,
}

impl SubjectState {
    /// `h` as an `f32` vector.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`] if dtype conversion fails.
    pub fn h_vec(&self) -> Result<Vec<f32>> {
        Ok(self.h.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
    }

    /// `z` as an `f32` vector.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::Model`] if dtype conversion fails.
    pub fn z_vec(&self) -> Result<Vec<f32>> {
        Ok(self.z.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
    }
}

/// Subject states for one relation and one prompt template.
///
/// # Example
///
/// ```
/// use candle_lre::{SubjectState, SubjectStateCache};
/// use candle_core::{DType, Device, Tensor};
///
/// let zeros = Tensor::zeros(8, DType::F32, &Device::Cpu).unwrap();
/// let mut cache = SubjectStateCache::new();
/// cache.insert(
///     "France",
///     SubjectState { h: zeros.clone(), z: zeros, h_position: 3, z_position: 5 },
/// );
/// assert!(cache.contains("France"));
/// assert!(cache.require("Japan").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SubjectStateCache {
    /// States keyed by subject string.
    states: BTreeMap<String, SubjectState>,
}

impl SubjectStateCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the state for `subject`, replacing any previous entry.
    pub fn insert(&mut self, subject: impl Into<String>, state: SubjectState) {
        self.states.insert(subject.into(), state);
    }

    /// State for `subject`, if cached.
    #[must_use]
    pub fn get(&self, subject: &str) -> Option<&SubjectState> {
        self.states.get(subject)
    }

    /// State for `subject`, or an error naming the missing subject.
    ///
    /// # Errors
    ///
    /// Returns [`LreError::MissingHiddenState`] if the subject was not cached.
    pub fn require(&self, subject: &str) -> Result<&SubjectState> {
        self.states
            .get(subject)
            .ok_or_else(|| LreError::MissingHiddenState {
                subject: subject.to_string(),
                reason: "not precomputed".into(),
            })
    }

    /// Whether `subject` is cached.
    #[must_use]
    pub fn contains(&self, subject: &str) -> bool {
        self.states.contains_key(subject)
    }

    /// Cached subjects in sorted order.
    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Number of cached subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn state(value: f32) -> SubjectState {
        let t = Tensor::new(&[value, value], &Device::Cpu).unwrap();
        SubjectState {
            h: t.clone(),
            z: (t * 2.0).unwrap(),
            h_position: 0,
            z_position: 1,
        }
    }

    #[test]
    fn insert_replaces_and_lists_sorted() {
        let mut cache = SubjectStateCache::new();
        cache.insert("Japan", state(1.0));
        cache.insert("France", state(2.0));
        cache.insert("Japan", state(3.0));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.subjects().collect::<Vec<_>>(), vec!["France", "Japan"]);
        assert_eq!(cache.require("Japan").unwrap().h_vec().unwrap(), vec![3.0, 3.0]);
        assert_eq!(cache.get("France").unwrap().z_vec().unwrap(), vec![4.0, 4.0]);
    }

    #[test]
    fn missing_subject_is_typed_error() {
        let cache = SubjectStateCache::new();
        assert!(cache.is_empty());
        assert!(matches!(
            cache.require("Peru"),
            Err(LreError::MissingHiddenState { subject, .. }) if subject == "Peru"
        ));
    }
}
