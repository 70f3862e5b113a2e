use thiserror::Error;

use crate::cache::QueryKey;
use crate::remote::RemoteError;

/// Errors surfaced by the engine to its callers.
///
/// `NotAuthenticated`, `Validation` and `NotFound` are raised before any
/// cache write, so nothing is rolled back for them. `RemoteWrite` is raised
/// after the optimistic state has already been restored from its snapshot.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No user is signed in")]
    NotAuthenticated,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Failed to {action}")]
    RemoteWrite {
        action: &'static str,
        #[source]
        source: RemoteError,
    },

    #[error("Failed to read {key}")]
    RemoteRead {
        key: QueryKey,
        #[source]
        source: RemoteError,
    },
}

impl EngineError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
