//! Error kinds surfaced by the trie database and its collaborators.
use thiserror::Error;

/// Error type for the byte store consumed by the database.
///
/// Implementations map their native failures onto these kinds; the database
/// translates them into [`MerkleError`] at its boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The requested key is not present in the store.
    #[error("key not found in byte store")]
    NotFound,
    /// The store has been closed and accepts no further operations.
    #[error("byte store is closed")]
    Closed,
    /// Any other backend failure.
    #[error("byte store i/o failure: {0}")]
    Io(String),
}

/// Error type for all database, view, history, and proof operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MerkleError {
    /// The requested key holds no value.
    #[error("key not found")]
    NotFound,
    /// The view was invalidated by a sibling commit (or was already
    /// committed) and can no longer be used.
    #[error("view is invalidated")]
    Invalidated,
    /// The database or its byte store has been closed.
    #[error("database is closed")]
    Closed,
    /// A change proof was requested between two identical roots.
    #[error("start root and end root are the same")]
    SameRoot,
    /// One of the requested roots is no longer retained by the history ring.
    #[error("insufficient history to serve the requested roots")]
    InsufficientHistory,
    /// Proof verification failed.
    #[error("invalid proof: {0}")]
    InvalidProof(String),
    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
    /// An internal invariant was violated; the database refuses further
    /// mutations until reopened.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<StoreError> for MerkleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => MerkleError::NotFound,
            StoreError::Closed => MerkleError::Closed,
            StoreError::Io(msg) => MerkleError::Internal(msg),
        }
    }
}
