use thiserror::Error;

/// Errors raised synchronously to callers of the mirror pipeline.
///
/// Transient conditions (transport failures, stale bookmarks, malformed watch
/// events, handler failures) are recovered internally and never show up here.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("object missing metadata.name")]
    MissingName,
    #[error("index already registered: {0}")]
    IndexExists(String),
    #[error("cannot add indexers to a non-empty store")]
    StoreNotEmpty,
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("invalid label selector: {0}")]
    InvalidSelector(String),
    #[error("pipeline is shut down")]
    ShutDown,
    /// No subscriber is attached, so nothing is being mirrored.
    #[error("informer is not connected")]
    NotConnected,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
