use time::OffsetDateTime;

/// The signing authority every forged leaf chains up to. Built once at
/// startup and never mutated afterwards.
pub struct RootAuthority {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: Vec<u8>,
    pub subject: String,
    pub not_before: String,
    pub not_after: String,
    pub(crate) signer: rcgen::Certificate,
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("subject", &self.subject)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ForgedCertificate {
    pub host: String,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: Vec<u8>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub serial: Vec<u8>,
}

impl ForgedCertificate {
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.not_after
    }
}

/// Outcome of a cache lookup. Both misses lead the caller to forge.
#[derive(Debug, Clone)]
pub enum CertLookup {
    Found(ForgedCertificate),
    NotFound,
    Expired,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    Rcgen,
    Io,
    OpenSsl,
    InvalidAuthority,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn rcgen(err: impl std::fmt::Display) -> Self {
        Self::new(TlsErrorKind::Rcgen, err.to_string())
    }

    pub(crate) fn openssl(err: openssl::error::ErrorStack) -> Self {
        Self::new(TlsErrorKind::OpenSsl, err.to_string())
    }
}
