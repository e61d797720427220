// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-lre.
//!
//! Relation-level variants ([`InsufficientData`](LreError::InsufficientData),
//! [`EmptyFilteredSet`](LreError::EmptyFilteredSet)) and sample-level
//! variants ([`MissingPairing`](LreError::MissingPairing),
//! [`MissingHiddenState`](LreError::MissingHiddenState)) are turned into
//! typed skips by the evaluation orchestrator. Everything else aborts the
//! operation that raised it.

/// Errors that can occur while estimating or evaluating linear relational
/// embeddings.
#[derive(Debug, thiserror::Error)]
pub enum LreError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook capture or lookup error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Intervention validation or application error.
    #[error("intervention error: {0}")]
    Intervention(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Relation dataset parsing error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Numerical linear algebra failure (SVD did not produce factors).
    #[error("linear algebra error: {0}")]
    Linalg(String),

    /// A relation has too few samples for the requested stage.
    #[error("relation `{relation}` needs {needed} samples, has {available}")]
    InsufficientData {
        /// Relation name.
        relation: String,
        /// Minimum number of samples required.
        needed: usize,
        /// Number of samples actually available.
        available: usize,
    },

    /// No test sample survived the known-fact filter.
    #[error("relation `{relation}` has no samples the model already knows")]
    EmptyFilteredSet {
        /// Relation name.
        relation: String,
    },

    /// No edit target with a different subject and object exists.
    #[error("no edit target available for subject `{subject}`")]
    MissingPairing {
        /// Source subject that could not be paired.
        subject: String,
    },

    /// Hidden state for a subject was not precomputed and could not be
    /// obtained from the model.
    #[error("missing hidden state for subject `{subject}`: {reason}")]
    MissingHiddenState {
        /// Subject whose state is missing.
        subject: String,
        /// Underlying cause.
        reason: String,
    },

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-lre operations.
pub type Result<T> = std::result::Result<T, LreError>;
