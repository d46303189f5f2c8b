//! Cursor over an external database that reports changes as a feed.
//!
//! The cursor is fed two things: a future resolving to the documents that
//! match the query right now, and a stream of [`ChangeRecord`]s describing
//! what happens afterwards. Change-stream documents of the usual shape
//! (`operationType`, `documentKey._id`, `fullDocument`,
//! `updateDescription`) can be parsed with
//! [`ChangeRecord::from_change_event`].
//!
//! Feeds report replacements as whole documents, so the cursor remembers
//! the field names of every document it has seen in order to clear the
//! ones a replacement drops.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use ddp_core::{Change, Cursor, CursorError, CursorEvent, CursorEventStream, Document, Fields, Snapshot, Value};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

const ID_FIELD: &str = "_id";

/// One entry of a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// A document was inserted.
    Insert {
        /// Document id.
        id: String,
        /// Document fields, without the id.
        document: Fields,
    },
    /// Some fields of a document were set or removed.
    Update {
        /// Document id.
        id: String,
        /// Fields set to new values.
        updated_fields: Fields,
        /// Names of removed fields.
        removed_fields: Vec<String>,
    },
    /// A document was replaced wholesale.
    Replace {
        /// Document id.
        id: String,
        /// New document fields, without the id.
        document: Fields,
    },
    /// A document was deleted.
    Delete {
        /// Document id.
        id: String,
    },
    /// Any other operation (drop, rename, invalidate...).
    Other {
        /// The reported operation type.
        operation: String,
    },
}

impl ChangeRecord {
    /// Parse a change-stream event document.
    pub fn from_change_event(event: &Value) -> Result<Self, CursorError> {
        let operation = event
            .get("operationType")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing operationType"))?;
        let key_id = || {
            event
                .get("documentKey")
                .and_then(|key| key.get(ID_FIELD))
                .map(id_string)
                .ok_or_else(|| malformed("missing documentKey._id"))
        };

        let full_document = || {
            let mut document = event
                .get("fullDocument")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| malformed(&format!("{operation} without fullDocument")))?;
            let id = match document.remove(ID_FIELD) {
                Some(id) => id_string(&id),
                None => key_id()?,
            };
            Ok::<_, CursorError>((id, document))
        };

        Ok(match operation {
            "insert" => {
                let (id, document) = full_document()?;
                Self::Insert { id, document }
            }
            "replace" => {
                let (id, document) = full_document()?;
                Self::Replace { id, document }
            }
            "update" => {
                let description = event
                    .get("updateDescription")
                    .ok_or_else(|| malformed("update without updateDescription"))?;
                Self::Update {
                    id: key_id()?,
                    updated_fields: description
                        .get("updatedFields")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                    removed_fields: description
                        .get("removedFields")
                        .and_then(Value::as_array)
                        .map(|names| {
                            names
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default(),
                }
            }
            "delete" => Self::Delete { id: key_id()? },
            other => Self::Other {
                operation: other.to_owned(),
            },
        })
    }

    /// The cursor event for this record, if it maps to one.
    ///
    /// A replacement maps to a change that sets every new field but clears
    /// nothing; [`ChangeFeedCursor`] fills in the cleared fields from what
    /// it has seen.
    pub fn into_event(self) -> Option<CursorEvent> {
        match self {
            Self::Insert { id, document } => Some(CursorEvent::Added {
                id,
                fields: document,
            }),
            Self::Update {
                id,
                updated_fields,
                removed_fields,
            } => Some(CursorEvent::Changed {
                id,
                change: Change::Diff {
                    updated: updated_fields,
                    removed: removed_fields,
                },
            }),
            Self::Replace { id, document } => Some(CursorEvent::Changed {
                id,
                change: Change::Diff {
                    updated: document,
                    removed: Vec::new(),
                },
            }),
            Self::Delete { id } => Some(CursorEvent::Removed { id }),
            Self::Other { .. } => None,
        }
    }
}

/// Field names of the documents a cursor has reported, by id.
#[derive(Default)]
struct KnownFields(HashMap<String, BTreeSet<String>>);

impl KnownFields {
    fn set(&mut self, id: &str, fields: &Fields) {
        let _ = self
            .0
            .insert(id.to_owned(), fields.keys().cloned().collect());
    }

    /// Apply a record and turn it into the event to report.
    fn apply(&mut self, record: ChangeRecord) -> Option<CursorEvent> {
        match record {
            ChangeRecord::Insert { ref id, ref document } => self.set(id, document),
            ChangeRecord::Update {
                ref id,
                ref updated_fields,
                ref removed_fields,
            } => {
                let keys = self.0.entry(id.clone()).or_default();
                keys.extend(updated_fields.keys().cloned());
                for name in removed_fields {
                    let _ = keys.remove(name);
                }
            }
            ChangeRecord::Replace { id, document } => {
                let previous = self.0.remove(&id).unwrap_or_default();
                let removed = previous
                    .into_iter()
                    .filter(|key| !document.contains_key(key))
                    .collect();
                self.set(&id, &document);
                return Some(CursorEvent::Changed {
                    id,
                    change: Change::Diff {
                        updated: document,
                        removed,
                    },
                });
            }
            ChangeRecord::Delete { ref id } => {
                let _ = self.0.remove(id);
            }
            ChangeRecord::Other { .. } => {}
        }
        record.into_event()
    }
}

fn malformed(detail: &str) -> CursorError {
    CursorError::Backend(format!("malformed change event: {detail}"))
}

fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a stream of raw change-stream events, skipping malformed ones.
pub fn change_events<S>(events: S) -> impl Stream<Item = ChangeRecord> + Send + 'static
where
    S: Stream<Item = Value> + Send + 'static,
{
    events.filter_map(|event| async move {
        match ChangeRecord::from_change_event(&event) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(error = %err, "skipping change event");
                None
            }
        }
    })
}

type InitialLoad = BoxFuture<'static, Result<Vec<Fields>, CursorError>>;
type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CursorError>> + Send>;

/// [`Cursor`] over an initial query result and a change feed.
pub struct ChangeFeedCursor {
    name: String,
    known: Arc<Mutex<KnownFields>>,
    initial: Option<InitialLoad>,
    feed: Option<BoxStream<'static, ChangeRecord>>,
    on_close: Option<CloseHook>,
    closed: bool,
}

impl ChangeFeedCursor {
    /// Build a cursor named `name`.
    ///
    /// `initial` resolves to documents carrying their id in `_id`.
    pub fn new<F, S>(name: impl Into<String>, initial: F, feed: S) -> Self
    where
        F: Future<Output = Result<Vec<Fields>, CursorError>> + Send + 'static,
        S: Stream<Item = ChangeRecord> + Send + 'static,
    {
        Self {
            name: name.into(),
            known: Arc::new(Mutex::new(KnownFields::default())),
            initial: Some(initial.boxed()),
            feed: Some(feed.boxed()),
            on_close: None,
            closed: false,
        }
    }

    /// Run `hook` when the cursor is closed, e.g. to close the server-side
    /// change stream.
    #[must_use]
    pub fn on_close<H, Fut>(mut self, hook: H) -> Self
    where
        H: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CursorError>> + Send + 'static,
    {
        self.on_close = Some(Box::new(move || hook().boxed()));
        self
    }
}

#[async_trait]
impl Cursor for ChangeFeedCursor {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&mut self) -> CursorEventStream {
        let Some(feed) = self.feed.take() else {
            return futures::stream::empty().boxed();
        };
        let collection = self.name.clone();
        let known = Arc::clone(&self.known);
        feed.filter_map(move |record| {
            let event = match record {
                ChangeRecord::Other { operation } => {
                    debug!(collection = %collection, operation = %operation, "unhandled change event");
                    None
                }
                record => known.lock().apply(record),
            };
            futures::future::ready(event)
        })
        .boxed()
    }

    async fn snapshot(&mut self) -> Result<Snapshot, CursorError> {
        let initial = self.initial.take().ok_or(CursorError::SnapshotConsumed)?;
        let documents = initial
            .await?
            .into_iter()
            .map(|mut fields| -> Result<Document, CursorError> {
                let id = fields
                    .remove(ID_FIELD)
                    .ok_or_else(|| malformed("document without _id"))?;
                Ok(Document::new(id_string(&id), fields))
            })
            .collect::<Result<Snapshot, _>>()?;
        let mut known = self.known.lock();
        for document in &documents {
            known.set(&document.id, &document.fields);
        }
        Ok(documents)
    }

    async fn close(&mut self) -> Result<(), CursorError> {
        if self.closed {
            return Err(CursorError::Closed);
        }
        self.closed = true;
        self.feed = None;
        match self.on_close.take() {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }
}
