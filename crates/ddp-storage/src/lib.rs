//! # ddp-storage
//!
//! Storage backends exposing the [`Cursor`](ddp_core::Cursor) contract.
//!
//! - [`MemoryStore`]: in-process collection whose writes are pushed to every
//!   open cursor
//! - [`ChangeFeedCursor`]: adapts an initial query plus a change-stream feed
//!   (insert / update / delete records) from an external database

#![deny(unsafe_code)]

use async_trait::async_trait;
use ddp_core::Fields;

pub mod change_feed;
pub mod errors;
pub mod memory;

pub use change_feed::{ChangeFeedCursor, ChangeRecord};
pub use errors::StoreError;
pub use memory::{MemoryCursor, MemoryStore};

/// Keyed document operations shared by writable backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Fetch a document by id.
    async fn get(&self, id: &str) -> errors::Result<Option<Fields>>;

    /// Insert a new document. Returns `false` if the id is taken.
    async fn add(&self, id: &str, fields: Fields) -> errors::Result<bool>;

    /// Replace an existing document. Returns `false` if the id is unknown.
    async fn set(&self, id: &str, fields: Fields) -> errors::Result<bool>;

    /// Delete a document. Returns `false` if the id is unknown.
    async fn remove(&self, id: &str) -> errors::Result<bool>;
}
