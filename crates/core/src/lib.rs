//! Mirra core types: objects, events, and the remote source boundary.

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stable identity of an object, independent of its content or version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// An opaque record from the remote collection.
///
/// `resource_version` is an ordering/resumption token assigned by the
/// remote source; it is compared only for change detection, never parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Obj {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: String,
    /// Raw object payload as received from the source.
    pub raw: serde_json::Value,
}

impl Obj {
    pub fn key(&self) -> ObjKey {
        ObjKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

/// Net change for one key as delivered to handlers.
///
/// Immutable once queued; `Deleted` carries the last known state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    Added(Obj),
    Updated { old: Obj, new: Obj },
    Deleted(Obj),
}

impl Event {
    pub fn key(&self) -> ObjKey {
        match self {
            Event::Added(o) | Event::Deleted(o) => o.key(),
            Event::Updated { new, .. } => new.key(),
        }
    }

    /// The most recent object carried by this event.
    pub fn latest(&self) -> &Obj {
        match self {
            Event::Added(o) | Event::Deleted(o) => o,
            Event::Updated { new, .. } => new,
        }
    }
}

/// Wire-level change kind reported by the remote source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceEventKind {
    Added,
    Updated,
    Deleted,
}

/// One change from the remote change stream. The sync cursor advances to
/// `obj.resource_version` after the event is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceEvent {
    pub kind: SourceEventKind,
    pub obj: Obj,
}

/// Result of a full listing: a complete snapshot plus the collection-wide
/// resource version the snapshot corresponds to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListPage {
    pub items: Vec<Obj>,
    pub resource_version: String,
}

/// Errors surfaced by the remote source boundary.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Network/timeout class failure; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The cursor has expired on the remote side; forces a full relist.
    #[error("cursor expired")]
    ExpiredCursor,
    /// A single undecodable payload; skipped, never fatal.
    #[error("malformed event: {0}")]
    Malformed(String),
}

pub type WatchStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

/// The remote source boundary: an opaque list+watch capability.
///
/// Implementations are network clients (see mirra-kubehub) or scripted
/// fakes in tests. Streams may end at any time; ending is not an error.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    /// Full listing. `cursor=None` requests the latest complete snapshot.
    async fn list(&self, cursor: Option<&str>) -> Result<ListPage, SourceError>;

    /// Open a change stream starting just after `cursor`.
    async fn watch(&self, cursor: &str) -> Result<WatchStream, SourceError>;
}

pub mod prelude {
    pub use super::{
        Event, ListPage, ListWatch, Obj, ObjKey, SourceError, SourceEvent, SourceEventKind,
    };
}
