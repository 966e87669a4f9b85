use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::proxy::ProxyState;
use crate::{forward, tunnel};

pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestLineError {
    #[error("empty request line")]
    Empty,
    #[error("expected 3 request line tokens, found {0}")]
    TokenCount(usize),
}

/// Splits a request line into method, target and version. Tokens are
/// separated by single spaces; anything other than exactly three is rejected.
pub fn split_request_line(line: &str) -> Result<(&str, &str, &str), RequestLineError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(RequestLineError::Empty);
    }
    let parts: Vec<&str> = line.split(' ').collect();
    match parts.as_slice() {
        [method, target, version] => Ok((method, target, version)),
        _ => Err(RequestLineError::TokenCount(parts.len())),
    }
}

pub(crate) async fn dispatch(
    state: Arc<ProxyState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let line_limit = state.config.limits.max_header_bytes as u64;
    let mut client = BufReader::new(stream);

    let line = match read_bounded_line(&mut client, line_limit).await? {
        BoundedLine::Line(line) => line,
        BoundedLine::Closed => {
            debug!(%peer, "client closed before sending a request line");
            return Ok(());
        }
        BoundedLine::TooLong => {
            warn!(%peer, limit = line_limit, "request line exceeds header limit");
            client.write_all(BAD_REQUEST).await?;
            client.shutdown().await?;
            return Ok(());
        }
    };

    let (method, target) = match split_request_line(&line) {
        Ok((method, target, _)) => (method.to_string(), target.to_string()),
        Err(RequestLineError::Empty) => {
            debug!(%peer, "empty request line");
            return Ok(());
        }
        Err(err) => {
            warn!(%peer, error = %err, "rejecting request line");
            client.write_all(BAD_REQUEST).await?;
            client.shutdown().await?;
            return Ok(());
        }
    };
    info!(%peer, %method, %target, "accepted request");

    if method == "CONNECT" {
        match skip_headers(&mut client, line_limit).await? {
            BoundedLine::Line(_) => return tunnel::handle_connect(state, client, target).await,
            BoundedLine::Closed => {
                debug!(%peer, "client closed during CONNECT headers");
                return Ok(());
            }
            BoundedLine::TooLong => {
                warn!(%peer, limit = line_limit, "CONNECT header line exceeds header limit");
                client.write_all(BAD_REQUEST).await?;
                client.shutdown().await?;
                return Ok(());
            }
        }
    }

    forward::handle_plain(state, client, peer, line.trim().to_string()).await
}

#[derive(Debug, PartialEq, Eq)]
enum BoundedLine {
    Line(String),
    Closed,
    TooLong,
}

/// Reads one line of at most `limit` bytes. Bytes that are not UTF-8 are
/// replaced rather than rejected so the caller can still answer 400.
async fn read_bounded_line<R>(reader: &mut R, limit: u64) -> Result<BoundedLine, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = Vec::new();
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut bytes).await?;
    if read == 0 {
        return Ok(BoundedLine::Closed);
    }
    if !bytes.ends_with(b"\n") && read as u64 >= limit {
        return Ok(BoundedLine::TooLong);
    }
    Ok(BoundedLine::Line(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Drains header lines up to the blank terminator, yielding the terminator
/// itself on success.
async fn skip_headers(client: &mut BufReader<TcpStream>, line_limit: u64) -> Result<BoundedLine, ProxyError> {
    loop {
        match read_bounded_line(client, line_limit).await? {
            BoundedLine::Line(line) if !line.trim().is_empty() => continue,
            other => return Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{BoundedLine, RequestLineError, read_bounded_line, split_request_line};

    #[test]
    fn splits_three_tokens() {
        let (method, target, version) =
            split_request_line("GET http://example.com/ HTTP/1.1\r\n").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(target, "http://example.com/");
        assert_eq!(version, "HTTP/1.1");
    }

    #[test]
    fn rejects_wrong_token_count() {
        assert_matches!(
            split_request_line("GARBAGE\r\n"),
            Err(RequestLineError::TokenCount(1))
        );
        assert_matches!(
            split_request_line("GET  / HTTP/1.1"),
            Err(RequestLineError::TokenCount(4))
        );
    }

    #[test]
    fn blank_line_is_empty() {
        assert_matches!(split_request_line("\r\n"), Err(RequestLineError::Empty));
    }

    #[tokio::test]
    async fn bounded_line_replaces_invalid_utf8() {
        let mut input = &b"GET /\xff HTTP/1.1\r\nHost: a\r\n"[..];
        assert_matches!(
            read_bounded_line(&mut input, 64).await.unwrap(),
            BoundedLine::Line(line) if line == "GET /\u{fffd} HTTP/1.1\r\n"
        );
    }

    #[tokio::test]
    async fn bounded_line_reports_overflow() {
        let mut input = &b"GET /aaaaaaaaaaaaaaaa HTTP/1.1\r\n"[..];
        assert_eq!(read_bounded_line(&mut input, 8).await.unwrap(), BoundedLine::TooLong);
    }

    #[tokio::test]
    async fn bounded_line_at_eof() {
        let mut input = &b""[..];
        assert_eq!(read_bounded_line(&mut input, 8).await.unwrap(), BoundedLine::Closed);
        let mut input = &b"GARBAGE"[..];
        assert_eq!(
            read_bounded_line(&mut input, 64).await.unwrap(),
            BoundedLine::Line("GARBAGE".to_string())
        );
    }
}
