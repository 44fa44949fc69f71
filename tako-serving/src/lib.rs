//! Secure serving identity for Tako services.
//!
//! Resolves the certificate a service presents (operator supplied or a
//! generated self-signed fallback), selects certificates by SNI, bootstraps
//! loopback trust for the in-process client and acquires the secure listener.

pub mod cipher;
pub mod error;
pub mod identity;
pub mod listener;
pub mod options;
pub mod random;
pub mod tls;

pub use error::{Result, ServingError};
pub use identity::{ListenerSource, ServingIdentity, ServingIdentityBuilder, assemble};
pub use options::{GeneratableKeyCert, NamedCertKey, SecureServingOptions};
