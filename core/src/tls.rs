//! Self-signed TLS material for the VLESS inbound

use crate::store::write_secret_file;
use crate::{Error, Result};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use std::net::IpAddr;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use url::Host;

/// Validity of a generated certificate
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Generate a self-signed certificate and key unless both already exist.
///
/// Returns true when new material was written.
pub fn ensure_tls_material(cert_path: &Path, key_path: &Path, common_name: &str) -> Result<bool> {
    if cert_path.is_file() && key_path.is_file() {
        return Ok(false);
    }

    let (cert_pem, key_pem) = generate_self_signed(common_name)?;
    write_secret_file(cert_path, cert_pem.as_bytes())?;
    write_secret_file(key_path, key_pem.as_bytes())?;
    log::info!(
        "generated self-signed TLS certificate for {} at {}",
        common_name,
        cert_path.display()
    );
    Ok(true)
}

/// ASCII form of a certificate name: IP literals as-is, domains as punycode
pub fn certificate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    match Host::parse(name) {
        Ok(Host::Domain(domain)) => Ok(domain),
        Ok(Host::Ipv4(v4)) => Ok(v4.to_string()),
        Ok(Host::Ipv6(v6)) => Ok(v6.to_string()),
        Err(e) => Err(Error::tls(format!("Invalid certificate name '{}': {}", name, e))),
    }
}

/// Issue a self-signed server certificate, returning `(cert_pem, key_pem)`
pub fn generate_self_signed(common_name: &str) -> Result<(String, String)> {
    let common_name = certificate_name(common_name)?;
    let common_name = common_name.as_str();
    let mut names = vec![common_name.to_string()];
    for extra in ["localhost", "127.0.0.1"] {
        if !names.iter().any(|n| n == extra) {
            names.push(extra.to_string());
        }
    }

    let mut params = CertificateParams::new(names)
        .map_err(|e| Error::tls(format!("Invalid certificate name '{}': {}", common_name, e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = params.not_before + Duration::days(CERT_VALIDITY_DAYS);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key = KeyPair::generate().map_err(|e| Error::tls(format!("Key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::tls(format!("Certificate signing failed: {}", e)))?;

    Ok((cert.pem(), key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_generates_pem_pair() {
        let (cert, key) = generate_self_signed("vpn.example.com").unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY-----"));
    }

    #[test]
    fn test_ip_common_name() {
        assert!(generate_self_signed("111.88.141.226").is_ok());
    }

    #[test]
    fn test_internationalized_name_is_punycoded() {
        assert_eq!(
            certificate_name("vpn.bücher.de").unwrap(),
            "vpn.xn--bcher-kva.de"
        );
        assert_eq!(certificate_name("VPN.Example.com").unwrap(), "vpn.example.com");
        assert_eq!(certificate_name("2001:db8::7").unwrap(), "2001:db8::7");
        assert!(generate_self_signed("vpn.bücher.de").is_ok());
    }

    #[test]
    fn test_unusable_name_is_tls_error() {
        assert!(matches!(
            generate_self_signed("bad host/name"),
            Err(Error::Tls(_))
        ));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("tls").join("server.crt");
        let key = dir.path().join("tls").join("server.key");

        assert!(ensure_tls_material(&cert, &key, "localhost").unwrap());
        let first = fs::read_to_string(&cert).unwrap();

        assert!(!ensure_tls_material(&cert, &key, "localhost").unwrap());
        assert_eq!(fs::read_to_string(&cert).unwrap(), first);
    }

    #[test]
    fn test_missing_key_regenerates_pair() {
        let dir = tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");

        ensure_tls_material(&cert, &key, "localhost").unwrap();
        fs::remove_file(&key).unwrap();

        assert!(ensure_tls_material(&cert, &key, "localhost").unwrap());
        assert!(key.is_file());
    }
}
