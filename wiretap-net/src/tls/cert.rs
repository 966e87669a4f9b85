use std::net::IpAddr;

use openssl::x509::X509;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};

use super::types::{ForgedCertificate, RootAuthority, TlsError};

pub const LEAF_ORGANIZATION: &str = "wiretap";

const LEAF_BACKDATE: Duration = Duration::hours(1);
const LEAF_VALIDITY: Duration = Duration::hours(8760);

/// Forges a server certificate for `host` signed by the root authority.
///
/// The validity window is `[now - 1h, now + 8760h]`. IP literals land in the
/// IP-address SAN, everything else in the DNS-name SAN.
pub fn forge_leaf(
    host: &str,
    ca: &RootAuthority,
    now: OffsetDateTime,
) -> Result<ForgedCertificate, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::NoCa;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(host.to_string()));
    }

    let serial = random_serial();
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let not_before = now - LEAF_BACKDATE;
    let not_after = now + LEAF_VALIDITY;
    params.not_before = not_before;
    params.not_after = not_after;

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = Certificate::from_params(params).map_err(TlsError::rcgen)?;
    let cert_der = cert
        .serialize_der_with_signer(&ca.signer)
        .map_err(TlsError::rcgen)?;
    let cert_pem = X509::from_der(&cert_der)
        .and_then(|x509| x509.to_pem())
        .map_err(TlsError::openssl)?;
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(ForgedCertificate {
        host: host.to_string(),
        cert_pem,
        key_pem,
        cert_der,
        not_before,
        not_after,
        serial,
    })
}

fn random_serial() -> Vec<u8> {
    let mut serial: [u8; 16] = rand::random();
    // Keep the DER integer positive.
    serial[0] &= 0x7f;
    serial.to_vec()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use openssl::nid::Nid;
    use openssl::x509::X509;
    use time::{Duration, OffsetDateTime};

    use super::forge_leaf;
    use crate::tls::ca::{format_name, generate_ca};

    fn common_name(cert: &X509) -> String {
        let entry = cert.subject_name().entries_by_nid(Nid::COMMONNAME).next().unwrap();
        String::from_utf8(entry.data().as_slice().to_vec()).unwrap()
    }

    #[test]
    fn dns_host_goes_into_dns_san() {
        let ca = generate_ca("Wiretap Test Root").unwrap();
        let leaf = forge_leaf("example.com", &ca, OffsetDateTime::now_utc()).unwrap();
        let cert = X509::from_pem(&leaf.cert_pem).unwrap();

        assert_eq!(common_name(&cert), "example.com");
        let sans = cert.subject_alt_names().unwrap();
        assert!(sans.iter().any(|name| name.dnsname() == Some("example.com")));
        assert!(sans.iter().all(|name| name.ipaddress().is_none()));
    }

    #[test]
    fn ip_host_goes_into_ip_san() {
        let ca = generate_ca("Wiretap Test Root").unwrap();
        let leaf = forge_leaf("127.0.0.1", &ca, OffsetDateTime::now_utc()).unwrap();
        let cert = X509::from_pem(&leaf.cert_pem).unwrap();

        assert_eq!(common_name(&cert), "127.0.0.1");
        let sans = cert.subject_alt_names().unwrap();
        let expected = Ipv4Addr::LOCALHOST.octets();
        assert!(sans.iter().any(|name| name.ipaddress() == Some(&expected[..])));
        assert!(sans.iter().all(|name| name.dnsname().is_none()));
    }

    #[test]
    fn leaf_is_issued_and_signed_by_root() {
        let ca = generate_ca("Wiretap Test Root").unwrap();
        let leaf = forge_leaf("example.com", &ca, OffsetDateTime::now_utc()).unwrap();
        let cert = X509::from_pem(&leaf.cert_pem).unwrap();
        let root = X509::from_pem(&ca.cert_pem).unwrap();

        assert_eq!(format_name(cert.issuer_name()), ca.subject);
        assert!(cert.verify(&root.public_key().unwrap()).unwrap());
    }

    #[test]
    fn validity_window_is_backdated_one_hour() {
        let ca = generate_ca("Wiretap Test Root").unwrap();
        let now = OffsetDateTime::now_utc();
        let leaf = forge_leaf("example.com", &ca, now).unwrap();

        assert_eq!(leaf.not_before, now - Duration::hours(1));
        assert_eq!(leaf.not_after, now + Duration::hours(8760));
        assert!(leaf.is_valid_at(now));
        assert!(!leaf.is_valid_at(leaf.not_after));
    }

    #[test]
    fn serials_are_random_per_forge() {
        let ca = generate_ca("Wiretap Test Root").unwrap();
        let now = OffsetDateTime::now_utc();
        let first = forge_leaf("example.com", &ca, now).unwrap();
        let second = forge_leaf("example.com", &ca, now).unwrap();

        assert_eq!(first.serial.len(), 16);
        assert_ne!(first.serial, second.serial);
    }
}
