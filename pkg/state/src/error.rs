//! Error types for the store boundary and the lease coordinator.

use thiserror::Error;

/// Errors reported by a `DocumentStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document {id} not found")]
    NotFound { id: String },

    /// CAS mismatch: the supplied revision is stale, or a create hit an
    /// existing document.
    #[error("revision conflict on document {id}")]
    Conflict { id: String },

    /// The document exists but is not shaped the way the reader expects.
    #[error("malformed document {id}: {source}")]
    Codec {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The stored fence token is at its maximum and cannot advance.
    #[error("fence token of document {id} is exhausted at {fence}")]
    FenceExhausted { id: String, fence: u64 },

    /// The store rejected a body that is not a JSON object.
    #[error("document {id} body must be a JSON object")]
    InvalidBody { id: String },

    /// Network or server failure.
    #[error("store transport error: {message}")]
    Transport { message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            message: e.to_string(),
        }
    }
}

/// Errors surfaced to callers of `LeaseCoordinator`.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The write was refused because another session holds a valid lease.
    #[error("session {session_id} does not hold the control lease (held by {owner})")]
    NotOwner { session_id: String, owner: String },

    /// The device document is missing; the device is presumed offline.
    #[error("device document not found; is the device offline?")]
    DeviceUnavailable(#[source] StoreError),

    /// The payload tried to overwrite a lease field.
    #[error("payload field '{0}' is reserved by the control lease")]
    ReservedField(&'static str),

    /// The coordinator timings cannot drive a renewal cycle.
    #[error("invalid coordinator config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn is_not_owner(&self) -> bool {
        matches!(self, Self::NotOwner { .. })
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
