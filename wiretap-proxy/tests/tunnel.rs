use std::io::Write;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use openssl::nid::Nid;
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::X509;
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;

use wiretap_net::{
    CertCache, CertLookup, CertificateStore, ForgedCertificate, TlsError, TlsErrorKind,
    build_acceptor, forge_leaf, generate_ca,
};
use wiretap_proxy::{CONNECTION_ESTABLISHED, Proxy, ProxyConfig};
use wiretap_storage::{CaptureStore, MemoryStore};

struct Harness {
    proxy: SocketAddr,
    origin: SocketAddr,
    proxy_ca_pem: Vec<u8>,
    certs: Arc<CertCache>,
    store: Arc<MemoryStore>,
    _roots: NamedTempFile,
}

async fn harness() -> Harness {
    harness_trusting(true).await
}

/// TLS echo origin whose leaf is signed by its own CA. The proxy's upstream
/// roots hold that CA only when `trust_origin` is set, otherwise an
/// unrelated one.
async fn harness_trusting(trust_origin: bool) -> Harness {
    let origin_ca = generate_ca("origin test CA").unwrap();
    let leaf = forge_leaf("127.0.0.1", &origin_ca, OffsetDateTime::now_utc()).unwrap();
    let acceptor = build_acceptor(&leaf).unwrap();

    let origin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = origin_listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = origin_listener.accept().await else {
                return;
            };
            let ssl = openssl::ssl::Ssl::new(acceptor.context()).unwrap();
            tokio::spawn(async move {
                let mut tls = SslStream::new(ssl, tcp).unwrap();
                if Pin::new(&mut tls).accept().await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            if tls.write_all(&buf[..read]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = tls.shutdown().await;
            });
        }
    });

    let mut roots = NamedTempFile::new().unwrap();
    if trust_origin {
        roots.write_all(&origin_ca.cert_pem).unwrap();
    } else {
        roots
            .write_all(&generate_ca("unrelated test CA").unwrap().cert_pem)
            .unwrap();
    }

    let mut config = ProxyConfig::default();
    config.tls.upstream_roots = vec![roots.path().to_string_lossy().into_owned()];

    let proxy_ca = generate_ca("proxy test CA").unwrap();
    let proxy_ca_pem = proxy_ca.cert_pem.clone();
    let certs = Arc::new(CertCache::new(proxy_ca));
    let store = Arc::new(MemoryStore::new());
    let proxy = Proxy::with_cert_store(config, certs.clone(), store.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    Harness {
        proxy: proxy_addr,
        origin,
        proxy_ca_pem,
        certs,
        store,
        _roots: roots,
    }
}

async fn open_tunnel(proxy: SocketAddr, target: &str) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut ack = vec![0u8; CONNECTION_ESTABLISHED.len()];
    client.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack, CONNECTION_ESTABLISHED);
    client
}

async fn client_handshake(tcp: TcpStream, ca_pem: &[u8]) -> SslStream<TcpStream> {
    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder
        .cert_store_mut()
        .add_cert(X509::from_pem(ca_pem).unwrap())
        .unwrap();
    let connector = builder.build();
    let ssl = connector.configure().unwrap().into_ssl("127.0.0.1").unwrap();
    let mut tls = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    tls
}

#[tokio::test]
async fn tunnel_relays_through_both_handshakes() {
    let harness = harness().await;
    let session = async {
        let tcp = open_tunnel(harness.proxy, &harness.origin.to_string()).await;
        let mut tls = client_handshake(tcp, &harness.proxy_ca_pem).await;

        let peer = tls.ssl().peer_certificate().unwrap();
        let entry = peer.subject_name().entries_by_nid(Nid::COMMONNAME).next().unwrap();
        let common_name = String::from_utf8(entry.data().as_slice().to_vec()).unwrap();
        assert_eq!(common_name, "127.0.0.1");

        tls.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        tls.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        tls.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    };
    tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .expect("tunnel session timed out");

    assert!(matches!(harness.certs.lookup("127.0.0.1"), CertLookup::Found(_)));
    assert_eq!(harness.certs.len(), 1);
    assert!(harness.store.list().unwrap().is_empty());
}

#[tokio::test]
async fn repeated_tunnels_reuse_the_forged_leaf() {
    let harness = harness().await;
    let mut serials = Vec::new();
    for _ in 0..2 {
        let tcp = open_tunnel(harness.proxy, &harness.origin.to_string()).await;
        let tls = client_handshake(tcp, &harness.proxy_ca_pem).await;
        let serial = tls
            .ssl()
            .peer_certificate()
            .unwrap()
            .serial_number()
            .to_bn()
            .unwrap()
            .to_vec();
        serials.push(serial);
    }
    assert_eq!(serials[0], serials[1]);
    assert_eq!(harness.certs.len(), 1);
}

#[tokio::test]
async fn unreachable_origin_closes_the_client_session() {
    let harness = harness().await;
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap().to_string();
    drop(closed);

    let session = async {
        let tcp = open_tunnel(harness.proxy, &target).await;
        let mut tls = client_handshake(tcp, &harness.proxy_ca_pem).await;
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    };
    tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .expect("proxy kept the tunnel open");
}

#[tokio::test]
async fn untrusted_origin_certificate_closes_the_client_session() {
    let harness = harness_trusting(false).await;
    let session = async {
        let tcp = open_tunnel(harness.proxy, &harness.origin.to_string()).await;
        let mut tls = client_handshake(tcp, &harness.proxy_ca_pem).await;
        let _ = tls.write_all(b"ping").await;
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    };
    tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .expect("proxy relayed to an unverified origin");
    assert!(harness.store.list().unwrap().is_empty());
}

struct FailingStore;

impl CertificateStore for FailingStore {
    fn lookup(&self, _host: &str) -> CertLookup {
        CertLookup::NotFound
    }

    fn forge(&self, _host: &str) -> Result<ForgedCertificate, TlsError> {
        Err(TlsError::new(TlsErrorKind::Rcgen, "signing failed"))
    }
}

#[tokio::test]
async fn certificate_failure_answers_bad_gateway() {
    let store = Arc::new(MemoryStore::new());
    let proxy = Proxy::with_cert_store(ProxyConfig::default(), Arc::new(FailingStore), store).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n");
}
