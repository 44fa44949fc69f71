//! Self-signed certificate generation for serving without operator material

use super::store::{self, CertKey};
use crate::error::ServingError;
use crate::random::RandomSource;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, SerialNumber};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Generated certificates are valid for one year.
const VALIDITY_DAYS: i64 = 365;
const SERIAL_LEN: usize = 16;

/// Errors that can occur during self-signed cert generation
#[derive(Debug, Error)]
pub enum SelfSignedError {
    #[error("Failed to generate certificate: {0}")]
    GenerationError(String),

    #[error("Random source failed: {0}")]
    Random(String),
}

impl From<SelfSignedError> for ServingError {
    fn from(e: SelfSignedError) -> Self {
        ServingError::Generation(e.to_string())
    }
}

/// PEM output of a generation run.
#[derive(Debug, Clone)]
pub struct SelfSignedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

impl SelfSignedCert {
    /// SHA-256 over the DER of the certificate, hex encoded.
    pub fn fingerprint(&self) -> Option<String> {
        let der = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .next()?
            .ok()?;
        Some(hex::encode(Sha256::digest(der.as_ref())))
    }
}

/// Generate a certificate for `host`, adding the extra IP and DNS names as
/// subject alternative names. `host` itself lands in the IP or DNS set
/// depending on whether it parses as an address.
pub fn generate(
    host: &str,
    alternate_ips: &[IpAddr],
    alternate_dns: &[String],
    rng: &dyn RandomSource,
) -> Result<SelfSignedCert, SelfSignedError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(SelfSignedError::GenerationError(
            "host must not be empty".to_string(),
        ));
    }

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, "Tako");
    params.distinguished_name = dn;

    let mut ips: Vec<IpAddr> = Vec::new();
    let mut dns: Vec<&str> = Vec::new();
    match host.parse::<IpAddr>() {
        Ok(ip) => ips.push(ip),
        Err(_) => dns.push(host),
    }
    for ip in alternate_ips {
        if !ips.contains(ip) {
            ips.push(*ip);
        }
    }
    for name in alternate_dns {
        if !dns.contains(&name.as_str()) {
            dns.push(name);
        }
    }

    for name in dns {
        let dns_name = name.try_into().map_err(|e| {
            SelfSignedError::GenerationError(format!("Invalid DNS name '{}': {}", name, e))
        })?;
        params.subject_alt_names.push(SanType::DnsName(dns_name));
    }
    params
        .subject_alt_names
        .extend(ips.into_iter().map(SanType::IpAddress));

    let mut serial = [0u8; SERIAL_LEN];
    rng.fill(&mut serial).map_err(SelfSignedError::Random)?;
    // Keep the DER integer positive.
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| {
        SelfSignedError::GenerationError(format!("Failed to generate key pair: {}", e))
    })?;

    let cert = params.self_signed(&key_pair).map_err(|e| {
        SelfSignedError::GenerationError(format!("Failed to generate certificate: {}", e))
    })?;

    Ok(SelfSignedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Generator for the fallback serving certificate kept under `cert_dir`.
pub struct SelfSignedGenerator {
    /// Directory to store certificates
    cert_dir: PathBuf,
    /// Stem of `<pair_name>.crt` / `<pair_name>.key`
    pair_name: String,
}

impl SelfSignedGenerator {
    pub fn new(cert_dir: impl Into<PathBuf>, pair_name: impl Into<String>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            pair_name: pair_name.into(),
        }
    }

    /// Target certificate and key paths.
    pub fn paths(&self) -> CertKey {
        CertKey::new(
            self.cert_dir.join(format!("{}.crt", self.pair_name)),
            self.cert_dir.join(format!("{}.key", self.pair_name)),
        )
    }

    /// Reuse the pair at the target paths when it loads, otherwise generate and
    /// persist a new one for `host`.
    ///
    /// When `bind_address` is the unspecified address `localhost` is added to
    /// the DNS names, otherwise the bind address is added to the IP names.
    pub fn get_or_create(
        &self,
        host: &str,
        bind_address: IpAddr,
        alternate_ips: &[IpAddr],
        alternate_dns: &[String],
        rng: &dyn RandomSource,
    ) -> crate::Result<CertKey> {
        let paths = self.paths();
        if store::can_read_cert_and_key(&paths.cert_file, &paths.key_file) {
            tracing::info!(
                cert_path = %paths.cert_file.display(),
                key_path = %paths.key_file.display(),
                "Using existing self-signed certificate"
            );
            return Ok(paths);
        }
        if paths.cert_file.exists() || paths.key_file.exists() {
            tracing::warn!(
                cert_path = %paths.cert_file.display(),
                key_path = %paths.key_file.display(),
                "Existing certificate material is incomplete or unreadable, regenerating"
            );
        }

        let mut alternate_ips = alternate_ips.to_vec();
        let mut alternate_dns = alternate_dns.to_vec();
        if bind_address.is_unspecified() {
            alternate_dns.push("localhost".to_string());
        } else {
            alternate_ips.push(bind_address);
        }

        let cert = generate(host, &alternate_ips, &alternate_dns, rng)?;
        store::write_pair(
            &paths.cert_file,
            &cert.cert_pem,
            &paths.key_file,
            &cert.key_pem,
        )?;

        tracing::info!(
            cert_path = %paths.cert_file.display(),
            key_path = %paths.key_file.display(),
            host = %host,
            fingerprint = cert.fingerprint().unwrap_or_default(),
            "Generated self-signed certificate"
        );

        Ok(paths)
    }
}
