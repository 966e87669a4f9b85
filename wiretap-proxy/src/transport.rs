use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use openssl::ssl::SslConnector;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;
use url::{Host, Url};

use wiretap_net::{BodyFraming, HttpVersion, Limits, ParseStatus, Response, ResponseParser, find_header};

use crate::config::TransportConfig;
use crate::error::ProxyError;
use crate::forward::ForwardRequest;

/// A completed origin exchange: the parsed response plus its exact wire bytes.
#[derive(Debug)]
pub(crate) struct OriginExchange {
    pub(crate) response: Response,
    pub(crate) raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolKey {
    tls: bool,
    host: String,
    port: u16,
}

impl PoolKey {
    fn for_url(url: &Url) -> Result<Self, ProxyError> {
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::OriginUnreachable(format!(
                    "unsupported protocol scheme {other:?}"
                )));
            }
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(ProxyError::OriginUnreachable(format!("no host in {url}"))),
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if tls { 443 } else { 80 });
        Ok(Self { tls, host, port })
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

enum OriginStream {
    Plain(TcpStream),
    Tls(Box<SslStream<TcpStream>>),
}

impl AsyncRead for OriginStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

struct IdleConnection {
    key: PoolKey,
    stream: OriginStream,
    since: Instant,
}

/// Outbound HTTP/1.1 client with a small keep-alive pool, shared by every
/// forwarded request.
pub(crate) struct OriginTransport {
    config: TransportConfig,
    connector: SslConnector,
    limits: Limits,
    idle: Mutex<Vec<IdleConnection>>,
}

impl OriginTransport {
    pub(crate) fn new(config: TransportConfig, connector: SslConnector, limits: Limits) -> Self {
        Self {
            config,
            connector,
            limits,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn round_trip(&self, request: &ForwardRequest) -> Result<OriginExchange, ProxyError> {
        let key = PoolKey::for_url(&request.url)?;
        let wire = request.to_bytes();

        // A pooled connection may have been closed by the origin while idle.
        // Only requests that are safe to send twice get a second attempt.
        if is_replayable(&request.method) {
            if let Some(stream) = self.checkout(&key) {
                match self.exchange(stream, &key, request, &wire).await {
                    Ok(exchange) => return Ok(exchange),
                    Err(err) => debug!(origin = %key, error = %err, "pooled connection failed, redialing"),
                }
            }
        }

        let stream = self.connect(&key).await?;
        self.exchange(stream, &key, request, &wire).await
    }

    async fn exchange(
        &self,
        mut stream: OriginStream,
        key: &PoolKey,
        request: &ForwardRequest,
        wire: &[u8],
    ) -> Result<OriginExchange, ProxyError> {
        stream
            .write_all(wire)
            .await
            .map_err(|err| ProxyError::OriginUnreachable(format!("write to {key}: {err}")))?;
        stream
            .flush()
            .await
            .map_err(|err| ProxyError::OriginUnreachable(format!("write to {key}: {err}")))?;

        let (response, raw, drained) = read_response(&mut stream, key, &request.method, self.limits).await?;
        if !drained {
            debug!(origin = %key, "origin sent bytes past the response, discarding connection");
        } else if keeps_alive(request, &response) {
            self.checkin(key.clone(), stream);
        }
        Ok(OriginExchange { response, raw })
    }

    async fn connect(&self, key: &PoolKey) -> Result<OriginStream, ProxyError> {
        let connect_timeout = self.config.connect_timeout();
        let tcp = match tokio::time::timeout(connect_timeout, TcpStream::connect((key.host.as_str(), key.port))).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(err)) => return Err(ProxyError::OriginUnreachable(format!("dial tcp {key}: {err}"))),
            Err(_) => {
                return Err(ProxyError::OriginUnreachable(format!(
                    "dial tcp {key}: timed out after {connect_timeout:?}"
                )));
            }
        };
        let keepalive = TcpKeepalive::new().with_time(self.config.keep_alive());
        if let Err(err) = SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            debug!(origin = %key, error = %err, "could not enable tcp keepalive");
        }
        if !key.tls {
            return Ok(OriginStream::Plain(tcp));
        }

        let ssl = self
            .connector
            .configure()
            .and_then(|config| config.into_ssl(&key.host))
            .map_err(|err| ProxyError::OriginUnreachable(format!("tls setup for {key}: {err}")))?;
        let mut tls = SslStream::new(ssl, tcp)
            .map_err(|err| ProxyError::OriginUnreachable(format!("tls setup for {key}: {err}")))?;
        let handshake_timeout = self.config.tls_handshake_timeout();
        match tokio::time::timeout(handshake_timeout, Pin::new(&mut tls).connect()).await {
            Ok(Ok(())) => Ok(OriginStream::Tls(Box::new(tls))),
            Ok(Err(err)) => Err(ProxyError::OriginUnreachable(format!("tls handshake with {key}: {err}"))),
            Err(_) => Err(ProxyError::OriginUnreachable(format!(
                "tls handshake with {key}: timed out after {handshake_timeout:?}"
            ))),
        }
    }

    fn checkout(&self, key: &PoolKey) -> Option<OriginStream> {
        let mut idle = self.lock_idle();
        self.evict_stale(&mut idle);
        let index = idle.iter().rposition(|entry| &entry.key == key)?;
        Some(idle.swap_remove(index).stream)
    }

    fn checkin(&self, key: PoolKey, stream: OriginStream) {
        if self.config.max_idle == 0 {
            return;
        }
        let mut idle = self.lock_idle();
        self.evict_stale(&mut idle);
        if idle.len() >= self.config.max_idle {
            idle.remove(0);
        }
        idle.push(IdleConnection {
            key,
            stream,
            since: Instant::now(),
        });
    }

    fn evict_stale(&self, idle: &mut Vec<IdleConnection>) {
        let timeout = self.config.idle_timeout();
        idle.retain(|entry| entry.since.elapsed() < timeout);
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<IdleConnection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }
}

/// Reads one final response, skipping interim 1xx responses other than 101.
/// The flag is false when the origin sent bytes past the end of the response,
/// which leaves the connection unfit for reuse.
async fn read_response<S>(
    stream: &mut S,
    key: &PoolKey,
    method: &str,
    limits: Limits,
) -> Result<(Response, Vec<u8>, bool), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ResponseParser::for_request_method(method, limits);
    let mut raw = Vec::new();
    let mut buffer = vec![0u8; 8192];
    let mut status: ParseStatus<Response> = ParseStatus::NeedMore { warnings: Vec::new() };
    let mut at_eof = false;

    loop {
        match status {
            ParseStatus::Complete { message, .. } => {
                let leftover = parser.buffered().len();
                if (100..200).contains(&message.line.status_code) && message.line.status_code != 101 {
                    raw = parser.buffered().to_vec();
                    status = if at_eof { parser.finish() } else { parser.push(&[]) };
                    continue;
                }
                raw.truncate(raw.len() - leftover);
                return Ok((message, raw, leftover == 0));
            }
            ParseStatus::Error { error, .. } => {
                return Err(ProxyError::OriginUnreachable(format!(
                    "malformed response from {key}: {error}"
                )));
            }
            ParseStatus::NeedMore { .. } if at_eof => {
                return Err(ProxyError::OriginUnreachable(format!(
                    "{key} closed the connection mid-response"
                )));
            }
            ParseStatus::NeedMore { .. } => {
                let read = stream
                    .read(&mut buffer)
                    .await
                    .map_err(|err| ProxyError::OriginUnreachable(format!("read from {key}: {err}")))?;
                if read == 0 {
                    if raw.is_empty() {
                        return Err(ProxyError::OriginUnreachable(format!(
                            "empty response from {key}"
                        )));
                    }
                    at_eof = true;
                    status = parser.finish();
                    continue;
                }
                raw.extend_from_slice(&buffer[..read]);
                status = parser.push(&buffer[..read]);
            }
        }
    }
}

fn is_replayable(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS" | "TRACE" | "PUT" | "DELETE")
}

fn keeps_alive(request: &ForwardRequest, response: &Response) -> bool {
    let close = find_header(&response.headers, "Connection")
        .is_some_and(|header| header.value.to_ascii_lowercase().contains("close"));
    response.line.version == HttpVersion::Http11
        && response.line.status_code != 101
        && matches!(
            response.framing,
            BodyFraming::Empty | BodyFraming::ContentLength | BodyFraming::Chunked
        )
        && !close
        && !request.wants_close()
}
