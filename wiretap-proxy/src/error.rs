use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed request: {0}")]
    Parse(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("client handshake failed: {0}")]
    ClientHandshake(String),
    #[error("{0}")]
    OriginUnreachable(String),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("capture {0} not found")]
    UnknownCapture(u64),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}
