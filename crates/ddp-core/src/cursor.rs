//! The contract between publications and storage backends.
//!
//! A [`Cursor`] is a live view over one collection: it can produce the
//! documents currently in view and a stream of the changes that follow.
//! Publications return one or more cursors; the server drives each of them
//! and turns their events into `added` / `changed` / `removed` frames.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::ejson::Fields;
use crate::errors::CursorError;
use crate::protocol::ServerMessage;

/// A document in a cursor's result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Every field except the id.
    pub fields: Fields,
}

impl Document {
    /// Create a document.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Documents in view when a cursor is first read.
pub type Snapshot = Vec<Document>;

/// How a document changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The whole document was replaced.
    Replaced {
        /// New contents.
        fields: Fields,
        /// Contents before the replacement.
        previous: Fields,
    },
    /// Some fields were set and some removed.
    Diff {
        /// Fields set to new values.
        updated: Fields,
        /// Names of removed fields.
        removed: Vec<String>,
    },
}

impl Change {
    /// Split into the `fields` and `cleared` parts of a `changed` frame.
    ///
    /// A replacement clears every previous key missing from the new
    /// contents.
    pub fn into_wire(self) -> (Fields, Vec<String>) {
        match self {
            Self::Replaced { fields, previous } => {
                let cleared = previous
                    .into_keys()
                    .filter(|key| !fields.contains_key(key))
                    .collect();
                (fields, cleared)
            }
            Self::Diff { updated, removed } => (updated, removed),
        }
    }
}

/// A live change reported by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorEvent {
    /// A document entered the view.
    Added {
        /// Document id.
        id: String,
        /// Document fields.
        fields: Fields,
    },
    /// A document in view changed.
    Changed {
        /// Document id.
        id: String,
        /// The change.
        change: Change,
    },
    /// A document left the view.
    Removed {
        /// Document id.
        id: String,
    },
}

impl CursorEvent {
    /// Id of the affected document.
    pub fn id(&self) -> &str {
        match self {
            Self::Added { id, .. } | Self::Changed { id, .. } | Self::Removed { id } => id,
        }
    }

    /// The frame announcing this event for `collection`.
    pub fn into_message(self, collection: &str) -> ServerMessage {
        let collection = collection.to_owned();
        match self {
            Self::Added { id, fields } => ServerMessage::Added {
                collection,
                id,
                fields,
            },
            Self::Changed { id, change } => {
                let (fields, cleared) = change.into_wire();
                ServerMessage::Changed {
                    collection,
                    id,
                    fields,
                    cleared,
                }
            }
            Self::Removed { id } => ServerMessage::Removed { collection, id },
        }
    }
}

/// Stream of live events. Dropping it detaches from the cursor.
pub type CursorEventStream = BoxStream<'static, CursorEvent>;

/// A live view over a collection.
///
/// The server calls [`events`](Cursor::events) once, then
/// [`snapshot`](Cursor::snapshot) once, and [`close`](Cursor::close) exactly
/// once when the owning subscription ends. Events that happen between
/// attaching and the snapshot may be delivered after the snapshot.
#[async_trait]
pub trait Cursor: Send {
    /// Collection name used in outbound frames.
    fn name(&self) -> &str;

    /// Attach to the live change stream.
    fn events(&mut self) -> CursorEventStream;

    /// Documents currently in view.
    async fn snapshot(&mut self) -> Result<Snapshot, CursorError>;

    /// Release backend resources.
    async fn close(&mut self) -> Result<(), CursorError>;
}

/// The cursors returned by a publication.
#[derive(Default)]
pub struct Cursors(Vec<Box<dyn Cursor>>);

impl Cursors {
    /// No cursors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cursor.
    pub fn push(&mut self, cursor: impl Cursor + 'static) {
        self.0.push(Box::new(cursor));
    }

    /// Number of cursors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no cursors.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the boxed cursors.
    pub fn into_vec(self) -> Vec<Box<dyn Cursor>> {
        self.0
    }
}

impl fmt::Debug for Cursors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|c| c.name()))
            .finish()
    }
}

impl<C: Cursor + 'static> From<C> for Cursors {
    fn from(cursor: C) -> Self {
        Self(vec![Box::new(cursor)])
    }
}

impl From<Vec<Box<dyn Cursor>>> for Cursors {
    fn from(cursors: Vec<Box<dyn Cursor>>) -> Self {
        Self(cursors)
    }
}

impl FromIterator<Box<dyn Cursor>> for Cursors {
    fn from_iter<I: IntoIterator<Item = Box<dyn Cursor>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Cursors {
    type Item = Box<dyn Cursor>;
    type IntoIter = std::vec::IntoIter<Box<dyn Cursor>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ejson::Value;
    use futures::StreamExt;

    fn fields(pairs: &[(&str, i64)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn replacement_clears_dropped_keys() {
        let change = Change::Replaced {
            fields: fields(&[("a", 1), ("c", 3)]),
            previous: fields(&[("a", 1), ("b", 2)]),
        };
        let (set, cleared) = change.into_wire();
        assert_eq!(set, fields(&[("a", 1), ("c", 3)]));
        assert_eq!(cleared, vec!["b".to_owned()]);
    }

    #[test]
    fn diff_passes_through() {
        let change = Change::Diff {
            updated: fields(&[("x", 9)]),
            removed: vec!["y".into(), "z".into()],
        };
        let (set, cleared) = change.into_wire();
        assert_eq!(set, fields(&[("x", 9)]));
        assert_eq!(cleared, vec!["y".to_owned(), "z".to_owned()]);
    }

    #[test]
    fn removed_event_becomes_removed_frame() {
        let msg = CursorEvent::Removed { id: "d1".into() }.into_message("posts");
        assert_eq!(
            msg,
            ServerMessage::Removed {
                collection: "posts".into(),
                id: "d1".into()
            }
        );
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl Cursor for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn events(&mut self) -> CursorEventStream {
            futures::stream::empty().boxed()
        }

        async fn snapshot(&mut self) -> Result<Snapshot, CursorError> {
            Ok(vec![Document::new("1", Fields::new())])
        }

        async fn close(&mut self) -> Result<(), CursorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cursors_from_single_and_many() {
        let one: Cursors = Fixed("a").into();
        assert_eq!(one.len(), 1);

        let many: Cursors = vec![
            Box::new(Fixed("a")) as Box<dyn Cursor>,
            Box::new(Fixed("b")),
        ]
        .into();
        assert_eq!(format!("{many:?}"), r#"["a", "b"]"#);

        for mut cursor in many {
            assert_eq!(cursor.snapshot().await.unwrap().len(), 1);
        }
    }
}
