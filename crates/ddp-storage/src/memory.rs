//! In-process document store with live cursors.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ddp_core::{Change, Cursor, CursorError, CursorEvent, CursorEventStream, Document, Fields, Snapshot};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::Store;
use crate::errors::Result;

struct State {
    docs: BTreeMap<String, Fields>,
    listeners: Vec<(u64, mpsc::UnboundedSender<CursorEvent>)>,
    next_listener: u64,
}

impl State {
    fn snapshot(&self) -> Snapshot {
        self.docs
            .iter()
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect()
    }

    /// Fan out to every live listener, pruning those whose cursor is gone.
    fn emit(&mut self, event: &CursorEvent) {
        self.listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

struct Inner {
    name: String,
    state: Mutex<State>,
}

/// A named, cloneable in-memory collection.
///
/// Writes are broadcast to every open [`MemoryCursor`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    docs: BTreeMap::new(),
                    listeners: Vec::new(),
                    next_listener: 0,
                }),
            }),
        }
    }

    /// Open a live cursor over the whole collection.
    pub fn cursor(&self) -> MemoryCursor {
        MemoryCursor {
            store: Arc::clone(&self.inner),
            listener: None,
            snapshot: None,
            closed: false,
        }
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.inner.state.lock().docs.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of attached cursors.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(&self, id: &str) -> Result<Option<Fields>> {
        Ok(self.inner.state.lock().docs.get(id).cloned())
    }

    async fn add(&self, id: &str, fields: Fields) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if state.docs.contains_key(id) {
            return Ok(false);
        }
        let _ = state.docs.insert(id.to_owned(), fields.clone());
        state.emit(&CursorEvent::Added {
            id: id.to_owned(),
            fields,
        });
        Ok(true)
    }

    async fn set(&self, id: &str, fields: Fields) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let Some(slot) = state.docs.get_mut(id) else {
            return Ok(false);
        };
        let previous = std::mem::replace(slot, fields.clone());
        state.emit(&CursorEvent::Changed {
            id: id.to_owned(),
            change: Change::Replaced { fields, previous },
        });
        Ok(true)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        if state.docs.remove(id).is_none() {
            return Ok(false);
        }
        state.emit(&CursorEvent::Removed { id: id.to_owned() });
        Ok(true)
    }
}

/// Live view over a [`MemoryStore`].
///
/// Attaching to events captures the snapshot under the same lock, so every
/// write lands either in the snapshot or in the event stream, never both.
pub struct MemoryCursor {
    store: Arc<Inner>,
    listener: Option<u64>,
    snapshot: Option<Snapshot>,
    closed: bool,
}

impl MemoryCursor {
    fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.store
                .state
                .lock()
                .listeners
                .retain(|(id, _)| *id != listener);
        }
    }
}

#[async_trait]
impl Cursor for MemoryCursor {
    fn name(&self) -> &str {
        &self.store.name
    }

    fn events(&mut self) -> CursorEventStream {
        self.detach();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.store.state.lock();
        let listener = state.next_listener;
        state.next_listener += 1;
        state.listeners.push((listener, tx));
        self.snapshot = Some(state.snapshot());
        drop(state);
        self.listener = Some(listener);
        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn snapshot(&mut self) -> std::result::Result<Snapshot, CursorError> {
        if self.closed {
            return Err(CursorError::Closed);
        }
        Ok(self
            .snapshot
            .take()
            .unwrap_or_else(|| self.store.state.lock().snapshot()))
    }

    async fn close(&mut self) -> std::result::Result<(), CursorError> {
        if self.closed {
            return Err(CursorError::Closed);
        }
        self.closed = true;
        self.detach();
        debug!(collection = %self.store.name, "memory cursor closed");
        Ok(())
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.detach();
    }
}
