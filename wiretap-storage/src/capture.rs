use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A query or form parameter: a scalar when it occurred once, otherwise the
/// values in the order they appeared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ParamValue {
    Single(String),
    Multiple(Vec<String>),
}

impl ParamValue {
    pub fn from_values(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            ParamValue::Single(values.remove(0))
        } else {
            ParamValue::Multiple(values)
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Single(value.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub get_params: BTreeMap<String, ParamValue>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub post_params: BTreeMap<String, ParamValue>,
    pub body: String,
    pub host: String,
    pub raw_request: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status_code: u16,
    pub status_line: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// One persisted exchange as handed back by a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureRecord {
    pub id: u64,
    pub host: String,
    pub method: String,
    pub path: String,
    pub request: ParsedRequest,
    pub response: ParsedResponse,
    /// Unix seconds.
    pub captured_at: i64,
}

impl CaptureRecord {
    pub fn new(id: u64, request: ParsedRequest, response: ParsedResponse, captured_at: i64) -> Self {
        Self {
            id,
            host: request.host.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            request,
            response,
            captured_at,
        }
    }
}
