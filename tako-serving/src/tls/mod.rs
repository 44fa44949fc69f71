//! TLS/Certificate management
//!
//! Handles:
//! - Loading PEM certificate/key pairs and CA files
//! - Self-signed certificates when no operator material is configured
//! - SNI-based certificate selection
//! - Loopback trust for the in-process client

mod loopback;
mod self_signed;
mod sni;
mod store;

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

pub use loopback::{
    AlternateClientTrust, LOOPBACK_SERVER_NAME, LoopbackClientConfig, LoopbackOutcome,
    bootstrap_loopback,
};
pub use self_signed::{SelfSignedCert, SelfSignedError, SelfSignedGenerator, generate};
pub use sni::{NamePattern, NamedCertificate, SniRegistry, SniRegistryBuilder};
pub use store::{
    CaCertificate, CertKey, CertKeyPair, can_read_cert_and_key, load_ca_certificate,
    load_cert_key, load_key_pair, write_pair,
};

/// The process-wide rustls provider, or aws-lc-rs when none was installed.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Install aws-lc-rs as the process default unless a provider is already set.
pub fn install_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
