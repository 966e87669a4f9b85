use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;

use super::types::{ForgedCertificate, TlsError};

/// Trust settings for the client-role handshake toward origins.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Extra PEM trust anchors added on top of the system store.
    pub upstream_roots: Vec<Vec<u8>>,
}

/// Server-role context presenting the forged leaf to the client.
pub fn build_acceptor(leaf: &ForgedCertificate) -> Result<SslAcceptor, TlsError> {
    let mut builder =
        SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).map_err(TlsError::openssl)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(TlsError::openssl)?;

    let cert = X509::from_pem(&leaf.cert_pem).map_err(TlsError::openssl)?;
    let key = PKey::private_key_from_pem(&leaf.key_pem).map_err(TlsError::openssl)?;

    builder.set_certificate(&cert).map_err(TlsError::openssl)?;
    builder.set_private_key(&key).map_err(TlsError::openssl)?;
    builder.check_private_key().map_err(TlsError::openssl)?;

    builder.set_verify(SslVerifyMode::NONE);

    Ok(builder.build())
}

/// Client-role context that verifies origins against the system store plus
/// any configured extra roots.
pub fn build_connector(config: &TlsConfig) -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(TlsError::openssl)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(TlsError::openssl)?;

    for pem in &config.upstream_roots {
        for cert in X509::stack_from_pem(pem).map_err(TlsError::openssl)? {
            builder
                .cert_store_mut()
                .add_cert(cert)
                .map_err(TlsError::openssl)?;
        }
    }

    builder.set_verify(SslVerifyMode::PEER);

    Ok(builder.build())
}
