mod capture;
mod config;
mod dispatch;
mod error;
mod forward;
mod proxy;
mod replay;
mod transport;
mod tunnel;

pub use capture::{decode_body, normalize_request, normalize_response};
pub use config::{
    LimitsConfig, ListenConfig, ProxyConfig, StorageConfig, TlsMitmConfig, TransportConfig,
    UpstreamConfig,
};
pub use dispatch::{BAD_REQUEST, RequestLineError, split_request_line};
pub use error::ProxyError;
pub use forward::ForwardRequest;
pub use proxy::Proxy;
pub use replay::{ReplayOutcome, request_from_record};
pub use tunnel::{CONNECTION_ESTABLISHED, TunnelStage, split_connect_target};
