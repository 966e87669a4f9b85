use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;

use super::cert::forge_leaf;
use super::types::{CertLookup, ForgedCertificate, RootAuthority, TlsError};

/// Source of forged certificates for the tunnel.
pub trait CertificateStore: Send + Sync {
    fn lookup(&self, host: &str) -> CertLookup;

    fn forge(&self, host: &str) -> Result<ForgedCertificate, TlsError>;

    /// Cached certificate for `host`, forging a new one on a miss or expiry.
    fn obtain(&self, host: &str) -> Result<ForgedCertificate, TlsError> {
        match self.lookup(host) {
            CertLookup::Found(cert) => Ok(cert),
            CertLookup::NotFound | CertLookup::Expired => self.forge(host),
        }
    }
}

/// Host-keyed cache of forged leaves behind a single lock.
///
/// Entries are never updated in place: an expired entry is removed on lookup
/// and a later forge inserts its replacement.
#[derive(Debug)]
pub struct CertCache {
    authority: RootAuthority,
    entries: Mutex<HashMap<String, ForgedCertificate>>,
}

impl CertCache {
    pub fn new(authority: RootAuthority) -> Self {
        Self {
            authority,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn authority(&self) -> &RootAuthority {
        &self.authority
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn lookup_at(&self, host: &str, now: OffsetDateTime) -> CertLookup {
        lookup_locked(&mut self.lock(), host, now)
    }

    pub fn forge_at(&self, host: &str, now: OffsetDateTime) -> Result<ForgedCertificate, TlsError> {
        let mut entries = self.lock();
        self.forge_locked(&mut entries, host, now)
    }

    /// Lookup and forge under one acquisition of the lock, so concurrent
    /// first requests for a host serialize instead of forging twice.
    pub fn obtain_at(
        &self,
        host: &str,
        now: OffsetDateTime,
    ) -> Result<ForgedCertificate, TlsError> {
        let mut entries = self.lock();
        match lookup_locked(&mut entries, host, now) {
            CertLookup::Found(cert) => Ok(cert),
            CertLookup::NotFound | CertLookup::Expired => {
                self.forge_locked(&mut entries, host, now)
            }
        }
    }

    fn forge_locked(
        &self,
        entries: &mut HashMap<String, ForgedCertificate>,
        host: &str,
        now: OffsetDateTime,
    ) -> Result<ForgedCertificate, TlsError> {
        let cert = forge_leaf(host, &self.authority, now)?;
        tracing::debug!(host, not_after = %cert.not_after, "forged leaf certificate");
        entries.insert(host.to_string(), cert.clone());
        Ok(cert)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ForgedCertificate>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lookup_locked(
    entries: &mut HashMap<String, ForgedCertificate>,
    host: &str,
    now: OffsetDateTime,
) -> CertLookup {
    let Some(cert) = entries.get(host) else {
        return CertLookup::NotFound;
    };
    if cert.is_valid_at(now) {
        tracing::debug!(host, "using cached certificate");
        return CertLookup::Found(cert.clone());
    }
    tracing::info!(host, not_after = %cert.not_after, "cached certificate expired");
    entries.remove(host);
    CertLookup::Expired
}

impl CertificateStore for CertCache {
    fn lookup(&self, host: &str) -> CertLookup {
        self.lookup_at(host, OffsetDateTime::now_utc())
    }

    fn forge(&self, host: &str) -> Result<ForgedCertificate, TlsError> {
        self.forge_at(host, OffsetDateTime::now_utc())
    }

    fn obtain(&self, host: &str) -> Result<ForgedCertificate, TlsError> {
        self.obtain_at(host, OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use time::{Duration, OffsetDateTime};

    use super::{CertCache, CertificateStore};
    use crate::tls::ca::generate_ca;
    use crate::tls::types::CertLookup;

    fn cache() -> CertCache {
        CertCache::new(generate_ca("Wiretap Test Root").unwrap())
    }

    #[test]
    fn missing_host_is_not_found() {
        let cache = cache();
        assert_matches!(cache.lookup("example.com"), CertLookup::NotFound);
    }

    #[test]
    fn lookup_returns_same_serial_while_valid() {
        let cache = cache();
        let now = OffsetDateTime::now_utc();
        let forged = cache.forge_at("example.com", now).unwrap();

        for offset in [Duration::ZERO, Duration::hours(1), Duration::hours(8759)] {
            match cache.lookup_at("example.com", now + offset) {
                CertLookup::Found(cert) => assert_eq!(cert.serial, forged.serial),
                other => panic!("unexpected lookup {other:?}"),
            }
        }
    }

    #[test]
    fn expired_entry_is_evicted_and_reforged() {
        let cache = cache();
        let now = OffsetDateTime::now_utc();
        let forged = cache.forge_at("example.com", now).unwrap();

        let later = forged.not_after + Duration::seconds(1);
        assert_matches!(cache.lookup_at("example.com", later), CertLookup::Expired);
        assert!(cache.is_empty());
        assert_matches!(cache.lookup_at("example.com", later), CertLookup::NotFound);

        let reforged = cache.forge_at("example.com", later).unwrap();
        assert_ne!(reforged.serial, forged.serial);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn forge_replaces_prior_entry() {
        let cache = cache();
        let first = cache.forge("example.com").unwrap();
        let second = cache.forge("example.com").unwrap();

        assert_ne!(first.serial, second.serial);
        match cache.lookup("example.com") {
            CertLookup::Found(cert) => assert_eq!(cert.serial, second.serial),
            other => panic!("unexpected lookup {other:?}"),
        }
    }

    #[test]
    fn hosts_are_cached_independently() {
        let cache = cache();
        let a = cache.obtain("a.example").unwrap();
        let b = cache.obtain("b.example").unwrap();

        assert_eq!(cache.len(), 2);
        assert_ne!(a.serial, b.serial);
        assert_eq!(cache.obtain("a.example").unwrap().serial, a.serial);
    }

    #[test]
    fn concurrent_first_requests_share_one_certificate() {
        let cache = Arc::new(cache());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.obtain("example.com").unwrap().serial)
            })
            .collect();

        let serials: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(serials.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(cache.len(), 1);
    }
}
