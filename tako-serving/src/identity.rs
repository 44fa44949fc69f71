//! Serving identity assembly.
//!
//! Runs once at startup: primary certificate (explicit or self-signed), CA
//! certificate, cipher suites, SNI certificates, loopback trust, listener.
//! The first failing step aborts the whole assembly; nothing is published
//! half built.

use crate::cipher::{CipherSuiteResolver, RustlsCipherSuites};
use crate::error::{Result, ServingError};
use crate::listener::{self, BoundListener, ListenerBinding};
use crate::options::SecureServingOptions;
use crate::random::{OsRandom, RandomSource};
use crate::tls::{
    AlternateClientTrust, CaCertificate, CertKeyPair, LoopbackClientConfig, LoopbackOutcome,
    NamedCertificate, SelfSignedGenerator, SniRegistry, bootstrap_loopback, crypto_provider,
    load_ca_certificate, load_cert_key, load_key_pair,
};
use rustls::{ServerConfig, SupportedCipherSuite};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

/// Where the secure listener comes from.
#[derive(Debug, Default)]
pub enum ListenerSource {
    /// Bind the address, port and network from the options.
    #[default]
    Options,
    /// Bind the options' address on a port picked by the OS.
    Ephemeral,
    /// Use a listener bound by the caller.
    Provided(TcpListener),
}

/// Everything the handshake path needs, fixed after startup.
pub struct ServingIdentity {
    primary: Option<CertKeyPair>,
    ca_certificate: Option<CaCertificate>,
    cipher_suites: Vec<SupportedCipherSuite>,
    registry: Arc<SniRegistry>,
    loopback: LoopbackOutcome,
    tls_config: Arc<ServerConfig>,
    listener: BoundListener,
}

impl ServingIdentity {
    pub fn builder(options: SecureServingOptions) -> ServingIdentityBuilder {
        ServingIdentityBuilder::new(options)
    }

    /// Default certificate, `None` when only SNI certificates are served.
    pub fn primary(&self) -> Option<&CertKeyPair> {
        self.primary.as_ref()
    }

    pub fn ca_certificate(&self) -> Option<&CaCertificate> {
        self.ca_certificate.as_ref()
    }

    /// Configured suites; empty means the provider defaults.
    pub fn cipher_suites(&self) -> &[SupportedCipherSuite] {
        &self.cipher_suites
    }

    pub fn registry(&self) -> &Arc<SniRegistry> {
        &self.registry
    }

    pub fn loopback(&self) -> &LoopbackOutcome {
        &self.loopback
    }

    /// Client trust for the in-process client, unless bootstrap degraded.
    pub fn loopback_client(&self) -> Option<&LoopbackClientConfig> {
        self.loopback.secure()
    }

    /// rustls server config answering handshakes from the SNI registry.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.tls_config.clone()
    }

    pub fn listener(&self) -> &BoundListener {
        &self.listener
    }

    pub fn port(&self) -> u16 {
        self.listener.port
    }

    pub fn into_parts(self) -> (Arc<ServerConfig>, BoundListener) {
        (self.tls_config, self.listener)
    }
}

impl std::fmt::Debug for ServingIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingIdentity")
            .field("primary", &self.primary.as_ref().map(|p| &p.source))
            .field("ca_certificate", &self.ca_certificate.as_ref().map(|c| &c.path))
            .field("cipher_suites", &self.cipher_suites.len())
            .field("registry", &self.registry)
            .field("loopback", &self.loopback)
            .field("listener", &self.listener.address)
            .finish()
    }
}

/// Staged construction of a [`ServingIdentity`].
pub struct ServingIdentityBuilder {
    options: SecureServingOptions,
    rng: Box<dyn RandomSource>,
    cipher_resolver: Box<dyn CipherSuiteResolver>,
    listener: ListenerSource,
    alternate_trust: Option<AlternateClientTrust>,
    self_signed_fallback: bool,
}

impl ServingIdentityBuilder {
    pub fn new(options: SecureServingOptions) -> Self {
        Self {
            options,
            rng: Box::new(OsRandom),
            cipher_resolver: Box::new(RustlsCipherSuites),
            listener: ListenerSource::Options,
            alternate_trust: None,
            self_signed_fallback: true,
        }
    }

    pub fn random_source(mut self, rng: impl RandomSource + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn cipher_resolver(mut self, resolver: impl CipherSuiteResolver + 'static) -> Self {
        self.cipher_resolver = Box::new(resolver);
        self
    }

    pub fn listener(mut self, source: ListenerSource) -> Self {
        self.listener = source;
        self
    }

    /// Client trust to keep if loopback trust cannot be derived.
    pub fn alternate_trust(mut self, trust: AlternateClientTrust) -> Self {
        self.alternate_trust = Some(trust);
        self
    }

    /// Generate a self-signed certificate when none is configured (default on).
    pub fn self_signed_fallback(mut self, enabled: bool) -> Self {
        self.self_signed_fallback = enabled;
        self
    }

    /// Assemble the identity. `Ok(None)` means secure serving is disabled
    /// (port 0 and no provided listener).
    pub fn assemble(self) -> Result<Option<ServingIdentity>> {
        let errors = self.options.validate();
        if !errors.is_empty() {
            return Err(ServingError::InvalidOptions(errors.join("; ")));
        }

        let disabled = self.options.bind_port == 0
            && matches!(self.listener, ListenerSource::Options);
        if disabled {
            tracing::info!("Secure serving disabled");
            return Ok(None);
        }

        let primary = self.resolve_primary()?;

        let ca_certificate = match &self.options.server_cert.ca_cert_file {
            Some(path) if !path.as_os_str().is_empty() => Some(load_ca_certificate(path)?),
            _ => None,
        };

        let cipher_suites = if self.options.cipher_suites.is_empty() {
            Vec::new()
        } else {
            self.cipher_resolver.resolve(&self.options.cipher_suites)?
        };

        let mut registry = SniRegistry::builder().default_cert(primary.as_ref());
        for named in &self.options.sni_cert_keys {
            let pair = load_key_pair(&named.cert_file, &named.key_file)?;
            registry = registry.add(NamedCertificate::new(pair, named.names.clone()));
        }

        let loopback = bootstrap_loopback(
            &mut registry,
            self.alternate_trust,
            self.rng.as_ref(),
        )?;
        let registry = Arc::new(registry.build()?);

        let tls_config = build_server_config(&cipher_suites, registry.clone())?;

        let network = self.options.bind_network;
        let address = self.options.bind_address;
        let listener = match self.listener {
            ListenerSource::Options => {
                match listener::bind(network, address, self.options.bind_port)? {
                    ListenerBinding::Bound(bound) => bound,
                    ListenerBinding::Disabled => return Ok(None),
                }
            }
            ListenerSource::Ephemeral => listener::bind_ephemeral(network, address)?,
            ListenerSource::Provided(provided) => listener::adopt(provided)?,
        };

        tracing::info!(
            address = %listener.address,
            primary = primary.is_some(),
            sni_certs = self.options.sni_cert_keys.len(),
            "Secure serving identity assembled"
        );

        Ok(Some(ServingIdentity {
            primary,
            ca_certificate,
            cipher_suites,
            registry,
            loopback,
            tls_config,
            listener,
        }))
    }

    fn resolve_primary(&self) -> Result<Option<CertKeyPair>> {
        let server_cert = &self.options.server_cert;
        if !server_cert.cert_key.is_empty() {
            return load_cert_key(&server_cert.cert_key);
        }
        if !self.self_signed_fallback {
            return Ok(None);
        }

        let generator =
            SelfSignedGenerator::new(&server_cert.cert_directory, server_cert.pair_name.clone());
        let cert_key = generator.get_or_create(
            &self.options.external_host(),
            self.options.bind_address,
            &self.options.alternate_ips,
            &self.options.alternate_dns,
            self.rng.as_ref(),
        )?;
        load_cert_key(&cert_key)
    }
}

fn build_server_config(
    cipher_suites: &[SupportedCipherSuite],
    registry: Arc<SniRegistry>,
) -> Result<Arc<ServerConfig>> {
    let mut provider = (*crypto_provider()).clone();
    if !cipher_suites.is_empty() {
        provider.cipher_suites = cipher_suites.to_vec();
    }

    let config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(registry);
    Ok(Arc::new(config))
}

/// Convenience for callers that only have options: default random source,
/// cipher resolver and listener.
pub fn assemble(options: SecureServingOptions) -> Result<Option<ServingIdentity>> {
    ServingIdentityBuilder::new(options).assemble()
}

/// Address the secure port listens on for the given options, for logging.
pub fn describe_bind(options: &SecureServingOptions) -> String {
    SocketAddr::new(options.bind_address, options.bind_port).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::NamedCertKey;
    use crate::random::FixedRandom;
    use crate::tls::{CertKey, LOOPBACK_SERVER_NAME};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn local_options(dir: &TempDir) -> SecureServingOptions {
        let mut options = SecureServingOptions {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        };
        options.server_cert.cert_directory = dir.path().to_path_buf();
        options.server_cert.pair_name = "svc".to_string();
        options
    }

    #[test]
    fn test_port_zero_disables_without_touching_disk() {
        let temp = TempDir::new().unwrap();
        let mut options = local_options(&temp);
        options.bind_port = 0;

        assert!(assemble(options).unwrap().is_none());
        assert!(!temp.path().join("svc.crt").exists());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let temp = TempDir::new().unwrap();
        let mut options = local_options(&temp);
        options.server_cert.cert_key = CertKey::new("only.crt", "");

        let err = assemble(options).unwrap_err();
        assert!(matches!(err, ServingError::InvalidOptions(_)));
    }

    #[test]
    fn test_self_signed_identity_on_ephemeral_port() {
        let temp = TempDir::new().unwrap();
        let identity = ServingIdentity::builder(local_options(&temp))
            .listener(ListenerSource::Ephemeral)
            .assemble()
            .unwrap()
            .unwrap();

        assert!(identity.port() > 0);
        assert!(identity.primary().is_some());
        assert!(temp.path().join("svc.crt").exists());
        assert!(temp.path().join("svc.key").exists());
        assert!(identity.registry().has_exact(LOOPBACK_SERVER_NAME));
        assert!(identity.loopback_client().is_some());
        assert!(identity.cipher_suites().is_empty());
    }

    #[test]
    fn test_no_fallback_leaves_primary_absent() {
        let temp = TempDir::new().unwrap();
        let identity = ServingIdentity::builder(local_options(&temp))
            .listener(ListenerSource::Ephemeral)
            .self_signed_fallback(false)
            .assemble()
            .unwrap()
            .unwrap();

        assert!(identity.primary().is_none());
        assert!(!identity.registry().has_default());
        assert!(!temp.path().join("svc.crt").exists());
    }

    #[test]
    fn test_bad_cipher_suite_aborts() {
        let temp = TempDir::new().unwrap();
        let mut options = local_options(&temp);
        options.cipher_suites = vec!["TLS_NOT_A_SUITE".to_string()];

        let err = ServingIdentity::builder(options)
            .listener(ListenerSource::Ephemeral)
            .assemble()
            .unwrap_err();
        assert!(matches!(err, ServingError::CipherSuiteParse(_)));
    }

    #[test]
    fn test_missing_sni_file_aborts() {
        let temp = TempDir::new().unwrap();
        let mut options = local_options(&temp);
        options.sni_cert_keys = vec![NamedCertKey {
            cert_file: temp.path().join("absent.crt"),
            key_file: temp.path().join("absent.key"),
            names: vec!["a.example.com".to_string()],
        }];

        let err = ServingIdentity::builder(options)
            .listener(ListenerSource::Ephemeral)
            .assemble()
            .unwrap_err();
        assert!(matches!(err, ServingError::ReadFile(..)));
        assert!(err.to_string().contains("absent.crt"));
    }

    #[test]
    fn test_loopback_generation_failure_aborts() {
        let temp = TempDir::new().unwrap();
        let err = ServingIdentity::builder(local_options(&temp))
            .listener(ListenerSource::Ephemeral)
            .self_signed_fallback(false)
            .random_source(FixedRandom::new(Vec::new()))
            .assemble()
            .unwrap_err();
        assert!(matches!(err, ServingError::Generation(_)));
    }

    #[test]
    fn test_describe_bind() {
        let mut options = SecureServingOptions::default();
        assert_eq!(describe_bind(&options), "0.0.0.0:443");
        options.bind_address = "::1".parse().unwrap();
        assert_eq!(describe_bind(&options), "[::1]:443");
    }
}
