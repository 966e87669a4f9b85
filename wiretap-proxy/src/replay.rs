use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use wiretap_net::{Limits, ParseStatus, RequestParser, find_header};
use wiretap_storage::{CaptureRecord, ParsedResponse, StoreError};

use crate::capture::{decode_body, normalize_request, normalize_response};
use crate::error::ProxyError;
use crate::forward::{ForwardRequest, persist};
use crate::proxy::ProxyState;

/// Result of re-sending a stored request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub source_id: u64,
    /// Id of the capture recorded for the replayed exchange, when saving it
    /// succeeded.
    pub capture_id: Option<u64>,
    pub response: ParsedResponse,
    /// Origin response bytes as received.
    pub raw: Vec<u8>,
}

/// Rebuilds the outbound request from a capture's `raw_request` text. Headers
/// are sent exactly as recorded; the origin comes from the Host header.
pub fn request_from_record(record: &CaptureRecord, limits: Limits) -> Result<ForwardRequest, ProxyError> {
    let raw = &record.request.raw_request;
    let parsed = match RequestParser::with_limits(limits).push(raw.as_bytes()) {
        ParseStatus::Complete { message, .. } => message,
        ParseStatus::NeedMore { .. } => {
            return Err(ProxyError::Parse(format!("capture {} holds a truncated request", record.id)));
        }
        ParseStatus::Error { error, .. } => {
            return Err(ProxyError::Parse(format!("capture {}: {error}", record.id)));
        }
    };

    let host = find_header(&parsed.headers, "Host")
        .map(|header| header.value.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| record.host.clone());
    if host.is_empty() {
        return Err(ProxyError::Parse(format!("capture {} has no host", record.id)));
    }
    let target = &parsed.line.target;
    let url = if target.starts_with('/') {
        Url::parse(&format!("http://{host}{target}"))
    } else {
        Url::parse(target)
    }
    .map_err(|err| ProxyError::Parse(format!("capture {} target {target:?}: {err}", record.id)))?;

    Ok(ForwardRequest {
        method: parsed.line.method,
        url,
        version: parsed.line.version,
        headers: parsed.headers,
        body: parsed.body,
        host,
    })
}

pub(crate) async fn replay(state: &Arc<ProxyState>, id: u64) -> Result<ReplayOutcome, ProxyError> {
    let store = Arc::clone(&state.store);
    let record = match tokio::task::spawn_blocking(move || store.get(id)).await {
        Ok(Ok(record)) => record,
        Ok(Err(StoreError::NotFound(id))) => return Err(ProxyError::UnknownCapture(id)),
        Ok(Err(err)) => return Err(ProxyError::Persistence(err.to_string())),
        Err(err) => return Err(ProxyError::Persistence(err.to_string())),
    };

    let request = request_from_record(&record, state.config.limits.parser_limits())?;
    info!(id, method = %request.method, url = %request.url, "replaying capture");
    let exchange = state.transport.round_trip(&request).await.inspect_err(|err| {
        warn!(id, url = %request.url, error = %err, "replay round trip failed");
    })?;

    let body = decode_body(&exchange.response);
    let response = normalize_response(&exchange.response, &body);
    let capture_id = persist(state, normalize_request(&request), response.clone()).await;
    Ok(ReplayOutcome {
        source_id: id,
        capture_id,
        response,
        raw: exchange.raw,
    })
}
