//! PEM certificate and key material on disk.
//!
//! Nothing is cached: every load re-reads the files.

use super::crypto_provider;
use crate::error::{Result, ServingError};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use x509_parser::pem::Pem;

/// Paths of a certificate file and its private key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertKey {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl CertKey {
    pub fn new(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }

    /// Neither path was supplied.
    pub fn is_empty(&self) -> bool {
        self.cert_file.as_os_str().is_empty() && self.key_file.as_os_str().is_empty()
    }

    /// Exactly one of the two paths was supplied.
    pub fn is_partial(&self) -> bool {
        self.cert_file.as_os_str().is_empty() != self.key_file.as_os_str().is_empty()
    }
}

/// A certificate chain with its signing key, loaded and checked for consistency.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    pub source: CertKey,
    pub key: Arc<CertifiedKey>,
}

impl CertKeyPair {
    /// DER of the leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.key.cert[0]
    }
}

/// The first CERTIFICATE block of a CA file.
#[derive(Debug, Clone)]
pub struct CaCertificate {
    pub path: PathBuf,
    pub der: CertificateDer<'static>,
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| ServingError::ReadFile(path.to_path_buf(), e))
}

/// Load the pair named by `cert_key`, or `None` when neither path is set.
pub fn load_cert_key(cert_key: &CertKey) -> Result<Option<CertKeyPair>> {
    if cert_key.is_empty() {
        return Ok(None);
    }
    load_key_pair(&cert_key.cert_file, &cert_key.key_file).map(Some)
}

/// Load a certificate chain and the private key that signs for it.
pub fn load_key_pair(cert_path: &Path, key_path: &Path) -> Result<CertKeyPair> {
    let cert_pem = read_file(cert_path)?;
    let key_pem = read_file(key_path)?;

    let certified = certified_key_from_pem(&cert_pem, &key_pem).map_err(|e| match e {
        PairError::NoCertificate => ServingError::MissingCertificate(cert_path.to_path_buf()),
        PairError::Invalid(reason) => ServingError::MalformedKeyPair {
            cert: cert_path.to_path_buf(),
            key: key_path.to_path_buf(),
            reason,
        },
    })?;

    Ok(CertKeyPair {
        source: CertKey::new(cert_path, key_path),
        key: Arc::new(certified),
    })
}

#[derive(Debug)]
pub(crate) enum PairError {
    NoCertificate,
    Invalid(String),
}

impl std::fmt::Display for PairError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PairError::NoCertificate => write!(f, "no certificate PEM block found"),
            PairError::Invalid(reason) => write!(f, "{reason}"),
        }
    }
}

/// Build a rustls `CertifiedKey` from in-memory PEM, rejecting mismatched keys.
pub(crate) fn certified_key_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> std::result::Result<CertifiedKey, PairError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PairError::Invalid(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(PairError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| PairError::Invalid(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| PairError::Invalid("no private key PEM block found".to_string()))?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| PairError::Invalid(format!("unsupported private key: {e}")))?;

    let certified = CertifiedKey::new(certs, signing_key);
    certified
        .keys_match()
        .map_err(|e| PairError::Invalid(format!("private key does not match certificate: {e}")))?;
    Ok(certified)
}

/// Whether both files exist, are readable and hold a matching pair.
///
/// Half a pair (or a pair that does not parse) counts as absent.
pub fn can_read_cert_and_key(cert_path: &Path, key_path: &Path) -> bool {
    let (Ok(cert_pem), Ok(key_pem)) = (fs::read(cert_path), fs::read(key_path)) else {
        return false;
    };
    certified_key_from_pem(&cert_pem, &key_pem).is_ok()
}

/// Load the first PEM block of a CA file, which must be a certificate.
pub fn load_ca_certificate(path: &Path) -> Result<CaCertificate> {
    let data = read_file(path)?;

    let block = match Pem::iter_from_buffer(&data).next() {
        Some(Ok(block)) => block,
        Some(Err(_)) | None => return Err(ServingError::MissingCertificate(path.to_path_buf())),
    };

    if block.label != "CERTIFICATE" {
        return Err(ServingError::UnexpectedPemBlockType {
            path: path.to_path_buf(),
            found: block.label,
        });
    }

    Ok(CaCertificate {
        path: path.to_path_buf(),
        der: CertificateDer::from(block.contents),
    })
}

/// Write a certificate and its key as one unit.
///
/// Both files are staged next to their targets and renamed into place only
/// after both writes succeed. Existing targets are moved aside to `.bak`
/// first; if any rename fails, every target is put back the way it was and
/// only files created by this call are removed.
pub fn write_pair(cert_path: &Path, cert_pem: &str, key_path: &Path, key_pem: &str) -> Result<()> {
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ServingError::Persist(parent.to_path_buf(), e))?;
        }
    }

    let cert_tmp = sibling_path(cert_path, ".tmp");
    let key_tmp = sibling_path(key_path, ".tmp");

    let staged = write_staged(&cert_tmp, cert_pem.as_bytes(), false)
        .and_then(|()| write_staged(&key_tmp, key_pem.as_bytes(), true));
    if let Err(e) = staged {
        let _ = fs::remove_file(&cert_tmp);
        let _ = fs::remove_file(&key_tmp);
        return Err(e);
    }

    let mut placed: Vec<(&Path, Option<PathBuf>)> = Vec::with_capacity(2);
    for (tmp, target) in [(&key_tmp, key_path), (&cert_tmp, cert_path)] {
        match place(tmp, target) {
            Ok(backup) => placed.push((target, backup)),
            Err(e) => {
                let _ = fs::remove_file(&cert_tmp);
                let _ = fs::remove_file(&key_tmp);
                roll_back(&placed);
                return Err(e);
            }
        }
    }

    for backup in placed.into_iter().filter_map(|(_, backup)| backup) {
        let _ = fs::remove_file(backup);
    }
    Ok(())
}

/// Move an existing regular file at `target` aside, then rename `tmp` onto
/// it. On failure the original is restored before returning.
fn place(tmp: &Path, target: &Path) -> Result<Option<PathBuf>> {
    let persist = |e| ServingError::Persist(target.to_path_buf(), e);

    let backup = match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_file() => {
            let backup = sibling_path(target, ".bak");
            fs::rename(target, &backup).map_err(persist)?;
            Some(backup)
        }
        _ => None,
    };

    if let Err(e) = fs::rename(tmp, target) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, target);
        }
        return Err(persist(e));
    }
    Ok(backup)
}

fn roll_back(placed: &[(&Path, Option<PathBuf>)]) {
    for (target, backup) in placed.iter().rev() {
        let restored = match backup {
            Some(backup) => fs::rename(backup, target),
            None => fs::remove_file(target),
        };
        if let Err(e) = restored {
            tracing::warn!(path = %target.display(), error = %e, "Failed to roll back certificate write");
        }
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_staged(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    let persist = |e| ServingError::Persist(path.to_path_buf(), e);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = options.open(path).map_err(persist)?;
    file.write_all(contents).map_err(persist)?;
    file.sync_all().map_err(persist)?;
    Ok(())
}
