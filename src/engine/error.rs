use ulid::Ulid;

use crate::model::ResourceId;

use super::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing fields, or `start >= end`.
    InvalidInput(String),
    LimitExceeded(&'static str),
    /// The requested interval overlaps this committed reservation.
    SlotConflict(Ulid),
    NotFound(Ulid),
    ResourceNotFound(ResourceId),
    /// The resource guard could not be acquired in time. Safe to retry.
    Busy(ResourceId),
    Unauthorized,
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::SlotConflict(id) => write!(f, "slot conflicts with reservation {id}"),
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::Busy(id) => write!(f, "resource {id} is busy, retry later"),
            EngineError::Unauthorized => write!(f, "unauthorized"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Conflict(id) => EngineError::SlotConflict(id),
            StoreError::Invalid(msg) => EngineError::InvalidInput(msg.into()),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Busy(rid) => EngineError::Busy(rid),
            StoreError::Wal(e) => EngineError::WalError(e),
        }
    }
}
