//! Error types for dbsync

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache, its refresher or its secondary structures
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// No sorter registered under the given id
    #[error("no sorter found with id {id} in cache {cache}")]
    UnknownSort { id: String, cache: String },

    /// No indexer registered under the given id
    #[error("no indexer found with id {id} in cache {cache}")]
    UnknownIndex { id: String, cache: String },

    /// A sorter or indexer was registered with a different key type than requested
    #[error("{structure} {id} in cache {cache} has a different key type than requested")]
    StructureTypeMismatch {
        structure: &'static str,
        id: String,
        cache: String,
    },

    /// The sort id is reserved for internal use
    #[error("sort id {0} is reserved")]
    ReservedSortId(String),

    /// A sorter or indexer is already bound to a refresher
    #[error("{0} already has an active listener")]
    AlreadyBound(String),

    /// A sorter or indexer was unbound without being bound first
    #[error("{0} wasn't bound")]
    NotBound(String),

    /// A single-result index lookup found more than one object
    #[error("multiple matches for index {index}, key {key} (cache {cache})")]
    MultipleMatches {
        index: String,
        key: String,
        cache: String,
    },

    /// The listener is not registered with the topic
    #[error("listener {0} does not seem to be registered")]
    ListenerNotRegistered(String),

    // =========================================================================
    // Synchronization Errors
    // =========================================================================
    /// Waiting for listener acknowledgements took longer than allowed
    #[error("too much time ({timeout:?}) elapsed while waiting for ACKs")]
    Overdue { timeout: Duration },

    /// The component was already shut down
    #[error("{0} is shut down")]
    ShutDown(String),

    // =========================================================================
    // Refresh Errors
    // =========================================================================
    /// A refresh run failed
    #[error("refresh failed: {0}")]
    Refresh(String),

    /// The backing store could not be read
    #[error("backing store error: {0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Seeding a sorter or indexer from the cache snapshot failed
    #[error("problem adding {structure} to cache {cache}: {reason}")]
    Seed {
        structure: String,
        cache: String,
        reason: String,
    },

    /// A listener failed to process an event
    #[error("listener failed: {0}")]
    Listener(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap any error raised by a backing store.
    pub fn source<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Source(Box::new(error))
    }

    /// Returns true for errors caused by calling the API incorrectly.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownSort { .. }
                | Error::UnknownIndex { .. }
                | Error::StructureTypeMismatch { .. }
                | Error::ReservedSortId(_)
                | Error::AlreadyBound(_)
                | Error::NotBound(_)
                | Error::MultipleMatches { .. }
                | Error::ListenerNotRegistered(_)
        )
    }
}
