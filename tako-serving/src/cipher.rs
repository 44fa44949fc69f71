//! Cipher suite names to rustls suites.

use crate::error::{Result, ServingError};
use rustls::SupportedCipherSuite;
use rustls::crypto::aws_lc_rs::cipher_suite;

/// Turns operator supplied cipher suite names into suites the TLS stack
/// understands.
pub trait CipherSuiteResolver {
    fn resolve(&self, names: &[String]) -> Result<Vec<SupportedCipherSuite>>;
}

/// Resolves IANA names against the aws-lc-rs suites shipped with rustls.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustlsCipherSuites;

fn known() -> [(&'static str, SupportedCipherSuite); 9] {
    [
        // TLS 1.3
        ("TLS_AES_256_GCM_SHA384", cipher_suite::TLS13_AES_256_GCM_SHA384),
        ("TLS_AES_128_GCM_SHA256", cipher_suite::TLS13_AES_128_GCM_SHA256),
        (
            "TLS_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ),
        // TLS 1.2
        (
            "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ),
        (
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ),
        (
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ),
    ]
}

impl CipherSuiteResolver for RustlsCipherSuites {
    fn resolve(&self, names: &[String]) -> Result<Vec<SupportedCipherSuite>> {
        let known = known();
        let mut suites = Vec::with_capacity(names.len());
        for name in names {
            let normalized = name.trim().to_uppercase().replace('-', "_");
            match known.iter().find(|(n, _)| *n == normalized) {
                Some((_, suite)) => {
                    if !suites.contains(suite) {
                        suites.push(*suite);
                    }
                }
                None => {
                    let available: Vec<&str> = known.iter().map(|(n, _)| *n).collect();
                    return Err(ServingError::CipherSuiteParse(format!(
                        "unknown cipher suite '{}', available: {}",
                        name,
                        available.join(", ")
                    )));
                }
            }
        }
        Ok(suites)
    }
}
