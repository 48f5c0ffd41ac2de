//! Error taxonomy for the statistical core. Training termination is *not* an
//! error: convergence and early-stop outcomes live in
//! [`crate::hmm::trainer::TrainingStats`] so callers can always inspect a
//! run, even a failed one. The variants here cover contract violations and
//! genuinely unrecoverable numerics.

/// Errors surfaced by the statistical core.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A vector or matrix disagrees with the model's feature dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    /// Negative weights, non-finite values, empty sequences where data is
    /// required, and similar parameter contract violations.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Both the primary and fallback numerical paths failed. Repairs
    /// (PSD projection, diagonal regularization) happen locally before this
    /// is ever raised.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// Synthesis requested a context no trained model covers and no default
    /// model was configured.
    #[error("no model available for context '{0}'")]
    MissingModel(String),

    /// MLPG and pipeline inputs that fail up-front validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
