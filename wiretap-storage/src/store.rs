use thiserror::Error;

use crate::capture::{CaptureRecord, ParsedRequest, ParsedResponse};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("capture {0} not found")]
    NotFound(u64),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("capture serialization error: {0}")]
    Serialization(String),
}

/// Persistence for captured exchanges. Ids are allocated by the store and
/// stay stable for the lifetime of the record.
pub trait CaptureStore: Send + Sync {
    fn save(&self, request: &ParsedRequest, response: &ParsedResponse) -> Result<u64, StoreError>;
    fn get(&self, id: u64) -> Result<CaptureRecord, StoreError>;
    fn list(&self) -> Result<Vec<CaptureRecord>, StoreError>;
}
