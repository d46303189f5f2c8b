//! Storage error types.

use ddp_core::{CursorError, MethodError};
use thiserror::Error;

/// Errors returned by [`Store`](crate::Store) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for MethodError {
    fn from(err: StoreError) -> Self {
        MethodError::new(err.to_string())
    }
}

impl From<StoreError> for CursorError {
    fn from(err: StoreError) -> Self {
        CursorError::Backend(err.to_string())
    }
}
