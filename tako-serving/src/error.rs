use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while assembling the secure serving identity.
///
/// Every variant carries the file or address involved so an operator can fix
/// permissions, paths or port conflicts from the message alone.
#[derive(Debug, Error)]
pub enum ServingError {
    #[error("Failed to read file {0}: {1}")]
    ReadFile(PathBuf, std::io::Error),

    #[error("No certificate found in {0}")]
    MissingCertificate(PathBuf),

    #[error("Expected CERTIFICATE block in certificate authority file {path}, found: {found}")]
    UnexpectedPemBlockType { path: PathBuf, found: String },

    #[error("Unable to load key pair (cert {cert}, key {key}): {reason}")]
    MalformedKeyPair {
        cert: PathBuf,
        key: PathBuf,
        reason: String,
    },

    #[error("Failed to generate self-signed certificate: {0}")]
    Generation(String),

    #[error("Failed to persist generated material to {0}: {1}")]
    Persist(PathBuf, std::io::Error),

    #[error("Invalid cipher suite configuration: {0}")]
    CipherSuiteParse(String),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid listen address: {0}")]
    InvalidListenerAddress(String),

    #[error("Failed to derive loopback client trust: {0}")]
    LoopbackTrust(String),

    #[error("Failed to build TLS server config: {0}")]
    ServerConfig(#[from] rustls::Error),

    #[error("Invalid serving options: {0}")]
    InvalidOptions(String),
}

impl ServingError {
    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServingError>;
