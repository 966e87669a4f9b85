use std::fs;
use std::sync::Arc;

use openssl::ssl::SslConnector;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use wiretap_net::{CertCache, CertificateStore, RootAuthority, TlsConfig, build_connector};
use wiretap_storage::CaptureStore;

use crate::config::ProxyConfig;
use crate::dispatch::dispatch;
use crate::error::ProxyError;
use crate::replay::{ReplayOutcome, replay};
use crate::transport::OriginTransport;

pub struct Proxy {
    state: Arc<ProxyState>,
}

pub(crate) struct ProxyState {
    pub(crate) config: ProxyConfig,
    pub(crate) certs: Arc<dyn CertificateStore>,
    pub(crate) connector: SslConnector,
    pub(crate) transport: OriginTransport,
    pub(crate) store: Arc<dyn CaptureStore>,
    limiter: Option<Arc<Semaphore>>,
}

impl Proxy {
    pub fn new(
        config: ProxyConfig,
        authority: RootAuthority,
        store: Arc<dyn CaptureStore>,
    ) -> Result<Self, ProxyError> {
        Self::with_cert_store(config, Arc::new(CertCache::new(authority)), store)
    }

    pub fn with_cert_store(
        config: ProxyConfig,
        certs: Arc<dyn CertificateStore>,
        store: Arc<dyn CaptureStore>,
    ) -> Result<Self, ProxyError> {
        let tls = TlsConfig {
            upstream_roots: load_roots(&config.tls.upstream_roots)?,
        };
        let connector = build_connector(&tls).map_err(|err| ProxyError::Config(err.to_string()))?;
        let transport = OriginTransport::new(
            config.upstream.transport.clone(),
            connector.clone(),
            config.limits.parser_limits(),
        );
        let limiter = match config.limits.max_connections {
            Some(0) => {
                return Err(ProxyError::Config(
                    "max_connections must be greater than zero".to_string(),
                ));
            }
            Some(max) => Some(Arc::new(Semaphore::new(max))),
            None => None,
        };

        Ok(Self {
            state: Arc::new(ProxyState {
                config,
                certs,
                connector,
                transport,
                store,
                limiter,
            }),
        })
    }

    pub async fn run(&self) -> Result<(), ProxyError> {
        let addr = self.state.config.listen.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| ProxyError::Config(format!("listen {addr}: {err}")))?;
        info!(%addr, "proxy listening");
        self.serve(listener).await
    }

    /// Re-sends the request stored under `id` to its origin and records the
    /// new exchange as its own capture.
    pub async fn replay(&self, id: u64) -> Result<ReplayOutcome, ProxyError> {
        replay(&self.state, id).await
    }

    /// Accepts connections until the listener fails to yield a permit. Each
    /// connection runs on its own task; its failures are logged, never
    /// propagated.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let permit = match &self.state.limiter {
                Some(limiter) => Some(
                    Arc::clone(limiter)
                        .acquire_owned()
                        .await
                        .map_err(|err| ProxyError::Config(err.to_string()))?,
                ),
                None => None,
            };

            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = dispatch(state, stream, peer).await {
                    warn!(%peer, error = %err, "connection closed with error");
                }
            });
        }
    }
}

fn load_roots(paths: &[String]) -> Result<Vec<Vec<u8>>, ProxyError> {
    paths
        .iter()
        .map(|path| {
            fs::read(path).map_err(|err| ProxyError::Config(format!("upstream root {path}: {err}")))
        })
        .collect()
}
