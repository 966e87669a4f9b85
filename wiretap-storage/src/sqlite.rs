use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::capture::{CaptureRecord, ParsedRequest, ParsedResponse};
use crate::store::{CaptureStore, StoreError};

const CREATE_CAPTURES: &str = "CREATE TABLE IF NOT EXISTS captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    request_json TEXT NOT NULL,
    response_json TEXT NOT NULL,
    captured_at INTEGER NOT NULL
)";

const CREATE_HOST_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_captures_host ON captures(host)";

const SELECT_COLUMNS: &str =
    "SELECT id, request_json, response_json, captured_at FROM captures";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize(true)?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize(false)?;
        Ok(store)
    }

    fn initialize(&self, on_disk: bool) -> Result<(), StoreError> {
        let conn = self.conn();
        if on_disk {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(backend)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(backend)?;
        }
        conn.execute(CREATE_CAPTURES, []).map_err(backend)?;
        conn.execute(CREATE_HOST_INDEX, []).map_err(backend)?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CaptureStore for SqliteStore {
    fn save(&self, request: &ParsedRequest, response: &ParsedResponse) -> Result<u64, StoreError> {
        let request_json = serde_json::to_string(request).map_err(serialization)?;
        let response_json = serde_json::to_string(response).map_err(serialization)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO captures (host, method, path, request_json, response_json, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.host,
                request.method,
                request.path,
                request_json,
                response_json,
                chrono::Utc::now().timestamp(),
            ],
        )
        .map_err(backend)?;
        Ok(conn.last_insert_rowid() as u64)
    }

    fn get(&self, id: u64) -> Result<CaptureRecord, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .map_err(backend)?;
        let row = stmt
            .query_row([id as i64], read_row)
            .optional()
            .map_err(backend)?;
        match row {
            Some(row) => row.into_record(),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn list(&self) -> Result<Vec<CaptureRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .map_err(backend)?;
        let rows = stmt.query_map([], read_row).map_err(backend)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(backend)?.into_record()?);
        }
        Ok(records)
    }
}

struct StoredRow {
    id: i64,
    request_json: String,
    response_json: String,
    captured_at: i64,
}

impl StoredRow {
    fn into_record(self) -> Result<CaptureRecord, StoreError> {
        let request: ParsedRequest =
            serde_json::from_str(&self.request_json).map_err(serialization)?;
        let response: ParsedResponse =
            serde_json::from_str(&self.response_json).map_err(serialization)?;
        Ok(CaptureRecord::new(
            self.id as u64,
            request,
            response,
            self.captured_at,
        ))
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        request_json: row.get(1)?,
        response_json: row.get(2)?,
        captured_at: row.get(3)?,
    })
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn serialization(err: serde_json::Error) -> StoreError {
    StoreError::Serialization(err.to_string())
}
