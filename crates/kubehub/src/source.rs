//! The list/watch boundary the reflector drives.

use futures::stream::BoxStream;
use kmirror_core::ListOptions;
use thiserror::Error;

/// Result of a point-in-time List.
#[derive(Debug, Clone)]
pub struct Listed<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Resume point only; no data change.
    Bookmark { resource_version: String },
    /// Terminal error reported in-band by the server.
    Error { code: u16, message: String },
}

impl<K> WatchEvent<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Bookmark { .. } => "bookmark",
            WatchEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The requested resource version is no longer available (HTTP 410).
    #[error("resource version too old: {0}")]
    Gone(String),
    #[error("transport: {0}")]
    Transport(String),
    /// A single event that could not be decoded; the stream stays usable.
    #[error("malformed event: {0}")]
    Malformed(String),
    /// The requested kind is not served by the cluster.
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
}

impl SourceError {
    pub fn is_gone(&self) -> bool { matches!(self, SourceError::Gone(_)) }
}

impl From<kube::Error> for SourceError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 410 => SourceError::Gone(resp.message),
            kube::Error::SerdeError(e) => SourceError::Malformed(e.to_string()),
            other => SourceError::Transport(other.to_string()),
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// Remote collection that can be listed and watched.
#[async_trait::async_trait]
pub trait Source<K>: Send + Sync + 'static {
    /// List the collection. `resource_version` of `None` asks for the most
    /// recent state; `Some` accepts any state not older than it.
    async fn list(&self, options: &ListOptions, resource_version: Option<&str>) -> Result<Listed<K>, SourceError>;

    /// Stream changes after `resource_version`, with bookmarks.
    async fn watch(&self, options: &ListOptions, resource_version: &str, timeout_secs: u32) -> Result<WatchStream<K>, SourceError>;
}
