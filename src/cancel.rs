//! Cooperative cancellation for read-side operations.
use crate::error::MerkleError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable cancellation handle threaded through every operation that may
/// block on the byte store.
///
/// Cancellation is checked before each store access; a fired token makes the
/// operation fail with [`MerkleError::Cancelled`]. Writes are not cancellable
/// once their batch has been submitted to the store.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that never fires unless [`CancelToken::cancel`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. All pending and future checks fail from here on.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fail with [`MerkleError::Cancelled`] if the token has fired.
    pub fn check(&self) -> Result<(), MerkleError> {
        if self.is_cancelled() {
            Err(MerkleError::Cancelled)
        } else {
            Ok(())
        }
    }
}
