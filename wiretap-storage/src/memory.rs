use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::capture::{CaptureRecord, ParsedRequest, ParsedResponse};
use crate::store::{CaptureStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<CaptureRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Vec<CaptureRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureStore for MemoryStore {
    fn save(&self, request: &ParsedRequest, response: &ParsedResponse) -> Result<u64, StoreError> {
        let mut records = self.records();
        let id = records.len() as u64 + 1;
        records.push(CaptureRecord::new(
            id,
            request.clone(),
            response.clone(),
            chrono::Utc::now().timestamp(),
        ));
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<CaptureRecord, StoreError> {
        self.records()
            .iter()
            .find(|record| record.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn list(&self) -> Result<Vec<CaptureRecord>, StoreError> {
        Ok(self.records().clone())
    }
}
