use std::time::Duration;

use serde::{Deserialize, Serialize};
use wiretap_net::Limits;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub tls: TlsMitmConfig,
    pub upstream: UpstreamConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl ListenConfig {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMitmConfig {
    pub ca_cert_path: String,
    pub ca_key_path: String,
    /// PEM files trusted for origin verification in addition to the system store.
    pub upstream_roots: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Dial timeout for tunnel origins.
    pub connect_timeout_secs: u64,
    pub transport: TransportConfig,
}

/// Outbound transport used by the plain forwarder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub tls_handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_idle: usize,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    /// Ceiling on concurrently served connections. `None` leaves spawning unbounded.
    pub max_connections: Option<usize>,
}

impl LimitsConfig {
    pub fn parser_limits(&self) -> Limits {
        Limits {
            max_header_bytes: self.max_header_bytes,
            max_body_bytes: self.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            listen: ListenConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            tls: TlsMitmConfig {
                ca_cert_path: "ca.crt".to_string(),
                ca_key_path: "ca.key".to_string(),
                upstream_roots: Vec::new(),
            },
            upstream: UpstreamConfig {
                connect_timeout_secs: 15,
                transport: TransportConfig {
                    connect_timeout_secs: 30,
                    keep_alive_secs: 30,
                    tls_handshake_timeout_secs: 10,
                    idle_timeout_secs: 90,
                    max_idle: 100,
                },
            },
            limits: LimitsConfig {
                max_header_bytes: limits.max_header_bytes,
                max_body_bytes: limits.max_body_bytes,
                max_connections: None,
            },
            storage: StorageConfig {
                database_path: "wiretap.db".to_string(),
            },
        }
    }
}
