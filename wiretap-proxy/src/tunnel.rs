use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use openssl::ssl::Ssl;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use wiretap_net::build_acceptor;

use crate::dispatch::BAD_REQUEST;
use crate::error::ProxyError;
use crate::proxy::ProxyState;

pub const CONNECTION_ESTABLISHED: &[u8] =
    b"HTTP/1.0 200 Connection established\r\nProxy-agent: GoProxy/1.0\r\n\r\n";

const CERTIFICATE_FAILURE: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n";
const DEFAULT_TLS_PORT: u16 = 443;
const RELAY_BUFFER: usize = 16 * 1024;

/// Lifecycle of one CONNECT tunnel. Every failure moves straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStage {
    AwaitTarget,
    ResolvePort,
    ObtainCert,
    AckClient,
    HandshakeClient,
    DialOrigin,
    HandshakeOrigin,
    Relay,
    Closed,
}

struct Tunnel {
    authority: String,
    stage: TunnelStage,
}

impl Tunnel {
    fn new(authority: &str) -> Self {
        Self {
            authority: authority.to_string(),
            stage: TunnelStage::AwaitTarget,
        }
    }

    fn enter(&mut self, stage: TunnelStage) {
        debug!(authority = %self.authority, from = ?self.stage, to = ?stage, "tunnel stage");
        self.stage = stage;
    }

    fn abort(&mut self, err: ProxyError) -> ProxyError {
        warn!(authority = %self.authority, stage = ?self.stage, error = %err, "tunnel aborted");
        self.stage = TunnelStage::Closed;
        err
    }
}

/// Splits a CONNECT target into host and port, defaulting to 443. Bracketed
/// IPv6 literals lose their brackets.
pub fn split_connect_target(target: &str) -> Result<(String, u16), ProxyError> {
    let invalid = || ProxyError::Parse(format!("invalid CONNECT target {target:?}"));

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (target, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_TLS_PORT,
    };
    Ok((host.to_string(), port))
}

pub(crate) async fn handle_connect<S>(
    state: Arc<ProxyState>,
    mut client: S,
    target: String,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut tunnel = Tunnel::new(&target);

    tunnel.enter(TunnelStage::ResolvePort);
    let (host, port) = match split_connect_target(&target) {
        Ok(resolved) => resolved,
        Err(err) => {
            let _ = client.write_all(BAD_REQUEST).await;
            return Err(tunnel.abort(err));
        }
    };

    tunnel.enter(TunnelStage::ObtainCert);
    let certs = Arc::clone(&state.certs);
    let lookup_host = host.clone();
    let leaf = match tokio::task::spawn_blocking(move || certs.obtain(&lookup_host)).await {
        Ok(Ok(leaf)) => Ok(leaf),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    let acceptor = match leaf.and_then(|leaf| build_acceptor(&leaf).map_err(|err| err.to_string())) {
        Ok(acceptor) => acceptor,
        Err(message) => {
            let _ = client.write_all(CERTIFICATE_FAILURE).await;
            let _ = client.shutdown().await;
            return Err(tunnel.abort(ProxyError::Certificate(message)));
        }
    };

    tunnel.enter(TunnelStage::AckClient);
    if let Err(err) = client.write_all(CONNECTION_ESTABLISHED).await {
        debug!(authority = %target, error = %err, "client left before the tunnel ack");
        return Ok(());
    }
    client.flush().await?;

    tunnel.enter(TunnelStage::HandshakeClient);
    let ssl = Ssl::new(acceptor.context())
        .map_err(|err| tunnel.abort(ProxyError::ClientHandshake(err.to_string())))?;
    let mut client_tls = SslStream::new(ssl, client)
        .map_err(|err| tunnel.abort(ProxyError::ClientHandshake(err.to_string())))?;
    if let Err(err) = Pin::new(&mut client_tls).accept().await {
        return Err(tunnel.abort(ProxyError::ClientHandshake(err.to_string())));
    }

    tunnel.enter(TunnelStage::DialOrigin);
    let dial_timeout = Duration::from_secs(state.config.upstream.connect_timeout_secs);
    let origin = match tokio::time::timeout(dial_timeout, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(origin)) => origin,
        Ok(Err(err)) => {
            let _ = client_tls.shutdown().await;
            return Err(tunnel.abort(ProxyError::OriginUnreachable(format!(
                "dial tcp {target}: {err}"
            ))));
        }
        Err(_) => {
            let _ = client_tls.shutdown().await;
            return Err(tunnel.abort(ProxyError::OriginUnreachable(format!(
                "dial tcp {target}: timed out after {dial_timeout:?}"
            ))));
        }
    };

    tunnel.enter(TunnelStage::HandshakeOrigin);
    let ssl = state
        .connector
        .configure()
        .and_then(|config| config.into_ssl(&host))
        .map_err(|err| tunnel.abort(ProxyError::OriginUnreachable(err.to_string())))?;
    let mut origin_tls = SslStream::new(ssl, origin)
        .map_err(|err| tunnel.abort(ProxyError::OriginUnreachable(err.to_string())))?;
    if let Err(err) = Pin::new(&mut origin_tls).connect().await {
        let _ = client_tls.shutdown().await;
        return Err(tunnel.abort(ProxyError::OriginUnreachable(format!(
            "tls handshake with {target}: {err}"
        ))));
    }

    tunnel.enter(TunnelStage::Relay);
    let (client_read, client_write) = tokio::io::split(client_tls);
    let (origin_read, origin_write) = tokio::io::split(origin_tls);
    let upstream = tokio::spawn(relay(client_read, origin_write, "client->origin", target.clone()));
    let downstream = tokio::spawn(relay(origin_read, client_write, "origin->client", target.clone()));
    let (sent, received) = tokio::join!(upstream, downstream);

    tunnel.enter(TunnelStage::Closed);
    info!(
        authority = %target,
        bytes_sent = sent.unwrap_or_default(),
        bytes_received = received.unwrap_or_default(),
        "tunnel closed"
    );
    Ok(())
}

/// Copies one direction until EOF or error, then half-closes the writer so
/// the peer sees the end of stream.
async fn relay<R, W>(mut reader: R, mut writer: W, direction: &'static str, authority: String) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER];
    let mut copied = 0u64;
    let outcome = loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(err) => break Err(err),
        };
        if let Err(err) = writer.write_all(&buffer[..read]).await {
            break Err(err);
        }
        if let Err(err) = writer.flush().await {
            break Err(err);
        }
        copied += read as u64;
    };

    if let Err(err) = outcome {
        if is_peer_close(&err) {
            debug!(%authority, direction, error = %err, "relay ended by peer");
        } else {
            warn!(%authority, direction, error = %ProxyError::Relay(err.to_string()), "relay failed");
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(%authority, direction, error = %err, "half-close failed");
    }
    copied
}

fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    ) || err.to_string().contains("closed")
}
