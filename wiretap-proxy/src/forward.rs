use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use wiretap_net::{
    Header, HttpVersion, Limits, ParseStatus, Request, RequestParser, Response, find_header,
};
use wiretap_storage::{ParsedRequest, ParsedResponse};

use crate::capture::{decode_body, normalize_request, normalize_response};
use crate::dispatch::BAD_REQUEST;
use crate::error::ProxyError;
use crate::proxy::ProxyState;

const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "Proxy-Connection",
    "Proxy-Authorization",
    "Transfer-Encoding",
    "Content-Length",
    "Expect",
];

/// A client request rewritten for direct dispatch to its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub method: String,
    pub url: Url,
    /// Protocol version the client spoke.
    pub version: HttpVersion,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
    pub host: String,
}

impl ForwardRequest {
    /// Resolves the destination and sanitizes headers. Absolute-form targets
    /// name their origin directly; origin-form targets need a Host header.
    pub fn from_parsed(request: Request, client: SocketAddr) -> Result<Self, ProxyError> {
        let Request {
            line,
            headers,
            body,
        } = request;

        let target = line.target.as_str();
        let (url, host) = if has_http_scheme(target) {
            let url = Url::parse(target)
                .map_err(|err| ProxyError::Parse(format!("invalid target {target:?}: {err}")))?;
            let host = url_authority(&url);
            (url, host)
        } else if target.starts_with('/') {
            let host = find_header(&headers, "Host")
                .map(|header| header.value.trim().to_string())
                .unwrap_or_default();
            if host.is_empty() {
                return Err(ProxyError::Parse("request has no host".to_string()));
            }
            let url = Url::parse(&format!("http://{host}{target}"))
                .map_err(|err| ProxyError::Parse(format!("invalid target {target:?}: {err}")))?;
            (url, host)
        } else {
            return Err(ProxyError::Parse(format!("unsupported request target {target:?}")));
        };
        if host.is_empty() {
            return Err(ProxyError::Parse("request has no host".to_string()));
        }

        let mut prior_forwarded = Vec::new();
        let mut kept = vec![Header::new("Host", host.clone())];
        for header in headers {
            if header.is("Host") || STRIPPED_REQUEST_HEADERS.iter().any(|name| header.is(name)) {
                continue;
            }
            if header.is("X-Forwarded-For") {
                prior_forwarded.push(header.value.trim().to_string());
                continue;
            }
            kept.push(header);
        }

        let client = client.to_string();
        let forwarded_for = if prior_forwarded.is_empty() {
            client
        } else {
            format!("{}, {client}", prior_forwarded.join(", "))
        };
        kept.push(Header::new("X-Forwarded-For", forwarded_for));

        if !body.is_empty() || matches!(line.method.as_str(), "POST" | "PUT" | "PATCH") {
            kept.push(Header::new("Content-Length", body.len().to_string()));
        }

        Ok(Self {
            method: line.method,
            url,
            version: line.version,
            headers: kept,
            body,
            host,
        })
    }

    /// Origin-form target: path plus query.
    pub fn request_uri(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        }
    }

    pub fn wants_close(&self) -> bool {
        find_header(&self.headers, "Connection")
            .is_some_and(|header| header.value.to_ascii_lowercase().contains("close"))
    }

    /// Serializes the request as sent upstream. The origin always sees HTTP/1.1.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.request_uri()).as_bytes());
        for header in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", header.raw_name, header.value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn has_http_scheme(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

pub(crate) async fn handle_plain(
    state: Arc<ProxyState>,
    mut client: BufReader<TcpStream>,
    peer: SocketAddr,
    request_line: String,
) -> Result<(), ProxyError> {
    let limits = state.config.limits.parser_limits();
    let request = match read_request(&mut client, &request_line, limits).await? {
        Some(request) => request,
        None => {
            client.write_all(BAD_REQUEST).await?;
            client.shutdown().await?;
            return Ok(());
        }
    };

    let request = match ForwardRequest::from_parsed(request, peer) {
        Ok(request) => request,
        Err(err) => {
            warn!(%peer, error = %err, "rejecting request");
            client.write_all(BAD_REQUEST).await?;
            client.shutdown().await?;
            return Ok(());
        }
    };
    info!(%peer, method = %request.method, url = %request.url, "forwarding request");

    let exchange = match state.transport.round_trip(&request).await {
        Ok(exchange) => exchange,
        Err(err) => {
            warn!(%peer, url = %request.url, error = %err, "origin round trip failed");
            client.write_all(bad_gateway(&err).as_bytes()).await?;
            client.shutdown().await?;
            return Ok(());
        }
    };
    let response = &exchange.response;
    info!(
        %peer,
        url = %request.url,
        status = response.line.status_code,
        "received origin response"
    );

    let body = decode_body(response);
    let parsed_request = normalize_request(&request);
    let parsed_response = normalize_response(response, &body);
    persist(&state, parsed_request, parsed_response).await;

    let reply = match &body {
        Cow::Owned(decoded) => rewrite_decoded(response, decoded),
        Cow::Borrowed(_) => exchange.raw.clone(),
    };
    if let Err(err) = client.write_all(&reply).await {
        debug!(%peer, error = %err, "client went away before the response was written");
        return Ok(());
    }
    client.flush().await?;
    client.shutdown().await?;
    Ok(())
}

/// Reads the remainder of a request whose first line was already consumed.
/// `None` means the bytes did not form a request.
async fn read_request<R>(
    client: &mut R,
    request_line: &str,
    limits: Limits,
) -> Result<Option<Request>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut parser = RequestParser::with_limits(limits);
    let mut status = parser.push(format!("{request_line}\r\n").as_bytes());
    let mut buffer = vec![0u8; 8192];
    loop {
        match status {
            ParseStatus::Complete { message, .. } => return Ok(Some(message)),
            ParseStatus::Error { error, .. } => {
                debug!(error = %error, "request parse failed");
                return Ok(None);
            }
            ParseStatus::NeedMore { .. } => {
                let read = client.read(&mut buffer).await?;
                if read == 0 {
                    debug!("client closed mid-request");
                    return Ok(None);
                }
                status = parser.push(&buffer[..read]);
            }
        }
    }
}

fn bad_gateway(err: &ProxyError) -> String {
    format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nProxy failed to connect to target server: {err}\r\n"
    )
}

/// Re-frames a response whose gzip body was decoded for the client.
fn rewrite_decoded(response: &Response, body: &[u8]) -> Vec<u8> {
    let line = &response.line;
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", line.version.as_str(), line.status_code, line.reason).as_bytes(),
    );
    for header in &response.headers {
        if header.is("Content-Encoding") || header.is("Content-Length") || header.is("Transfer-Encoding") {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", header.raw_name, header.value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

/// Saves a capture off the async runtime. Failures are logged and never
/// reach the client.
pub(crate) async fn persist(state: &ProxyState, request: ParsedRequest, response: ParsedResponse) -> Option<u64> {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.save(&request, &response)).await {
        Ok(Ok(id)) => {
            info!(id, "capture saved");
            Some(id)
        }
        Ok(Err(err)) => {
            warn!(error = %ProxyError::Persistence(err.to_string()), "capture not saved");
            None
        }
        Err(err) => {
            warn!(error = %ProxyError::Persistence(err.to_string()), "capture not saved");
            None
        }
    }
}
