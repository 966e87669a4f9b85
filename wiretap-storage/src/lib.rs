mod capture;
mod memory;
mod sqlite;
mod store;

pub use capture::{CaptureRecord, ParamValue, ParsedRequest, ParsedResponse};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{CaptureStore, StoreError};
