//! Validated secure serving options handed to assembly.

use crate::listener::Network;
use crate::tls::CertKey;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SECURE_PORT: u16 = 443;
pub const DEFAULT_CERT_DIR: &str = "serving.local.config/certificates";
pub const DEFAULT_PAIR_NAME: &str = "serving";

/// Serving certificate paths plus where to keep a generated fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratableKeyCert {
    /// Explicit certificate and key. Both empty means generate.
    pub cert_key: CertKey,
    /// Optional CA certificate for `cert_key`.
    pub ca_cert_file: Option<PathBuf>,
    /// Directory holding `<pair_name>.crt` and `<pair_name>.key` when generated.
    pub cert_directory: PathBuf,
    pub pair_name: String,
}

impl Default for GeneratableKeyCert {
    fn default() -> Self {
        Self {
            cert_key: CertKey::default(),
            ca_cert_file: None,
            cert_directory: PathBuf::from(DEFAULT_CERT_DIR),
            pair_name: DEFAULT_PAIR_NAME.to_string(),
        }
    }
}

/// A certificate/key pair served for SNI names.
///
/// Parsed from `cert,key` or `cert,key:name1,name2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedCertKey {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub names: Vec<String>,
}

impl FromStr for NamedCertKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (key_cert, names) = match value.split_once(':') {
            Some((key_cert, names)) => {
                let names = names.trim();
                if names.is_empty() {
                    return Err("empty names list is not allowed".to_string());
                }
                (
                    key_cert.trim(),
                    names.split(',').map(|n| n.trim().to_string()).collect(),
                )
            }
            None => (value.trim(), Vec::new()),
        };

        let paths: Vec<&str> = key_cert.split(',').map(str::trim).collect();
        let [cert_file, key_file] = paths.as_slice() else {
            return Err("expected comma separated certificate and key file paths".to_string());
        };

        Ok(Self {
            cert_file: PathBuf::from(cert_file),
            key_file: PathBuf::from(key_file),
            names,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureServingOptions {
    pub bind_address: IpAddr,
    /// 0 turns secure serving off.
    pub bind_port: u16,
    pub bind_network: Network,
    pub server_cert: GeneratableKeyCert,
    pub sni_cert_keys: Vec<NamedCertKey>,
    pub cipher_suites: Vec<String>,
    /// Host the generated certificate is issued for.
    pub external_hostname: Option<String>,
    /// Extra names for a generated certificate.
    pub alternate_dns: Vec<String>,
    pub alternate_ips: Vec<IpAddr>,
}

impl Default for SecureServingOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_SECURE_PORT,
            bind_network: Network::Tcp,
            server_cert: GeneratableKeyCert::default(),
            sni_cert_keys: Vec::new(),
            cipher_suites: Vec::new(),
            external_hostname: None,
            alternate_dns: Vec::new(),
            alternate_ips: Vec::new(),
        }
    }
}

impl SecureServingOptions {
    /// Every problem with the options, empty when they are usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let cert_key = &self.server_cert.cert_key;
        if cert_key.is_partial() {
            errors.push(format!(
                "--tls-cert-file ({}) and --tls-private-key-file ({}) must be set together",
                cert_key.cert_file.display(),
                cert_key.key_file.display()
            ));
        }

        if cert_key.is_empty() && self.bind_port != 0 {
            if self.server_cert.cert_directory.as_os_str().is_empty() {
                errors.push("--cert-dir is required when no certificate is given".to_string());
            }
            if !is_valid_pair_name(&self.server_cert.pair_name) {
                errors.push(format!(
                    "--pair-name '{}' must be a plain file stem",
                    self.server_cert.pair_name
                ));
            }
        }

        for (i, sni) in self.sni_cert_keys.iter().enumerate() {
            if sni.cert_file.as_os_str().is_empty() || sni.key_file.as_os_str().is_empty() {
                errors.push(format!(
                    "--tls-sni-cert-key entry {} needs both a certificate and a key",
                    i + 1
                ));
            }
            if sni.names.iter().any(|n| n.is_empty()) {
                errors.push(format!(
                    "--tls-sni-cert-key entry {} has an empty name",
                    i + 1
                ));
            }
        }

        errors
    }

    /// Host a generated certificate is issued for: the configured external
    /// hostname, else a specific bind address, else this machine's hostname.
    pub fn external_host(&self) -> String {
        if let Some(host) = self
            .external_hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            return host.to_string();
        }
        if !self.bind_address.is_unspecified() {
            return self.bind_address.to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

fn is_valid_pair_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}
