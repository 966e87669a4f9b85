mod ca;
mod cache;
mod cert;
mod openssl;
mod types;

pub use cache::{CertCache, CertificateStore};
pub use ca::generate_ca;
pub use cert::{LEAF_ORGANIZATION, forge_leaf};
pub use self::openssl::{TlsConfig, build_acceptor, build_connector};
pub use types::{CertLookup, ForgedCertificate, RootAuthority, TlsError, TlsErrorKind};
