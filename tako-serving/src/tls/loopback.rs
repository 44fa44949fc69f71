//! Loopback trust for the in-process client.
//!
//! A private self-signed certificate is registered under a reserved server
//! name, and a client config trusting exactly that certificate is handed to
//! the internal client. The internal client can then reach the secure port no
//! matter what the operator configured.

use super::self_signed;
use super::sni::SniRegistryBuilder;
use super::store::certified_key_from_pem;
use super::crypto_provider;
use crate::error::{Result, ServingError};
use crate::random::{RandomSource, hex_token};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::fmt;
use std::sync::Arc;

/// Server name presented by the internal client. Never advertised.
pub const LOOPBACK_SERVER_NAME: &str = "tako-loopback-client";

const TOKEN_BYTES: usize = 16;

/// Client-side trust for reaching this process over TLS.
#[derive(Clone)]
pub struct LoopbackClientConfig {
    pub server_name: ServerName<'static>,
    pub trusted_cert: CertificateDer<'static>,
    /// Bearer token identifying the internal client.
    pub token: String,
    pub tls: Arc<ClientConfig>,
}

impl LoopbackClientConfig {
    /// Start a client session aimed at the loopback identity.
    pub fn connect(&self) -> std::result::Result<ClientConnection, rustls::Error> {
        ClientConnection::new(self.tls.clone(), self.server_name.clone())
    }

    /// Whether `presented` is this instance's token. A trailing line ending
    /// is ignored.
    pub fn authenticates(&self, presented: &str) -> bool {
        let presented = presented.trim_end_matches(['\r', '\n']).as_bytes();
        let expected = self.token.as_bytes();
        expected.len() == presented.len()
            && expected
                .iter()
                .zip(presented)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl fmt::Debug for LoopbackClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackClientConfig")
            .field("server_name", &self.server_name)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Client trust the caller already had before bootstrap, for example a
/// plaintext side channel (`tls: None`).
#[derive(Clone)]
pub struct AlternateClientTrust {
    pub description: String,
    pub tls: Option<Arc<ClientConfig>>,
}

impl fmt::Debug for AlternateClientTrust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlternateClientTrust")
            .field("description", &self.description)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Result of a bootstrap that did not abort startup.
#[derive(Debug)]
pub enum LoopbackOutcome {
    /// The internal client trusts the loopback certificate.
    Secure(LoopbackClientConfig),
    /// Deriving the client trust failed; the previously held trust stays.
    Degraded {
        retained: AlternateClientTrust,
        cause: ServingError,
    },
}

impl LoopbackOutcome {
    pub fn secure(&self) -> Option<&LoopbackClientConfig> {
        match self {
            LoopbackOutcome::Secure(config) => Some(config),
            LoopbackOutcome::Degraded { .. } => None,
        }
    }
}

/// Generate the loopback certificate, reserve it in `registry` and derive the
/// internal client's trust.
///
/// Generation failure is always fatal. A failure while deriving the client
/// trust is fatal only when no `alternate` is held.
pub fn bootstrap_loopback(
    registry: &mut SniRegistryBuilder,
    alternate: Option<AlternateClientTrust>,
    rng: &dyn RandomSource,
) -> Result<LoopbackOutcome> {
    let generated = self_signed::generate(LOOPBACK_SERVER_NAME, &[], &[], rng)?;
    let certified = certified_key_from_pem(
        generated.cert_pem.as_bytes(),
        generated.key_pem.as_bytes(),
    )
    .map_err(|e| {
        ServingError::Generation(format!("loopback certificate is unusable: {e}"))
    })?;
    let certified = Arc::new(certified);
    let trusted_cert = certified.cert[0].clone();

    registry.reserve(LOOPBACK_SERVER_NAME, certified);

    match derive_client_trust(trusted_cert, rng) {
        Ok(config) => {
            tracing::info!(server_name = LOOPBACK_SERVER_NAME, "Loopback client trust established");
            Ok(LoopbackOutcome::Secure(config))
        }
        Err(cause) => match alternate {
            Some(retained) => {
                tracing::warn!(
                    error = %cause,
                    retained = %retained.description,
                    "Loopback client trust unavailable, keeping existing client trust"
                );
                Ok(LoopbackOutcome::Degraded { retained, cause })
            }
            None => Err(cause),
        },
    }
}

fn derive_client_trust(
    trusted_cert: CertificateDer<'static>,
    rng: &dyn RandomSource,
) -> Result<LoopbackClientConfig> {
    let token = hex_token(rng, TOKEN_BYTES).map_err(ServingError::LoopbackTrust)?;

    let mut roots = RootCertStore::empty();
    roots
        .add(trusted_cert.clone())
        .map_err(|e| ServingError::LoopbackTrust(format!("cannot trust loopback certificate: {e}")))?;

    let tls = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ServingError::LoopbackTrust(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(LOOPBACK_SERVER_NAME)
        .map_err(|e| ServingError::LoopbackTrust(e.to_string()))?;

    Ok(LoopbackClientConfig {
        server_name,
        trusted_cert,
        token,
        tls: Arc::new(tls),
    })
}
