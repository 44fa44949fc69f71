//! SNI-based certificate selection for TLS
//!
//! Picks the certificate for a handshake from the server name the client
//! sent. Literal names beat wildcards, longer wildcard suffixes beat shorter
//! ones, and among equals the earliest declared entry wins. Reserved entries
//! (the loopback certificate) outrank everything for their name.

use super::store::CertKeyPair;
use crate::error::{Result, ServingError};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use x509_parser::prelude::*;

/// A literal host name or a `*.<suffix>` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NamePattern {
    Exact(String),
    Wildcard(String),
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().to_ascii_lowercase();
        match pattern.strip_prefix("*.") {
            Some(suffix) => NamePattern::Wildcard(suffix.to_string()),
            None => NamePattern::Exact(pattern),
        }
    }

    /// Whether `host` (already lowercased) is selected by this pattern.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            NamePattern::Exact(name) => name == host,
            NamePattern::Wildcard(suffix) => host
                .strip_suffix(suffix.as_str())
                .and_then(|prefix| prefix.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty()),
        }
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamePattern::Exact(name) => write!(f, "{name}"),
            NamePattern::Wildcard(suffix) => write!(f, "*.{suffix}"),
        }
    }
}

/// A certificate offered for the given name patterns.
///
/// With no patterns the names are read from the certificate itself.
#[derive(Debug, Clone)]
pub struct NamedCertificate {
    pub pair: CertKeyPair,
    pub names: Vec<String>,
}

impl NamedCertificate {
    pub fn new(pair: CertKeyPair, names: Vec<String>) -> Self {
        Self { pair, names }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Origin {
    Extracted,
    Explicit,
    Reserved,
}

#[derive(Clone)]
struct Candidate {
    origin: Origin,
    order: usize,
    key: Arc<CertifiedKey>,
}

impl Candidate {
    /// Higher origin wins, then earlier declaration.
    fn outranks(&self, other: &Candidate) -> bool {
        (self.origin, Reverse(self.order)) > (other.origin, Reverse(other.order))
    }
}

/// Staged construction of an [`SniRegistry`].
#[derive(Default)]
pub struct SniRegistryBuilder {
    default_cert: Option<Arc<CertifiedKey>>,
    entries: Vec<NamedCertificate>,
    reserved: Vec<(String, Arc<CertifiedKey>)>,
}

impl SniRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Certificate used when no entry matches the requested name.
    pub fn default_cert(mut self, pair: Option<&CertKeyPair>) -> Self {
        self.default_cert = pair.map(|p| p.key.clone());
        self
    }

    pub fn add(mut self, entry: NamedCertificate) -> Self {
        self.entries.push(entry);
        self
    }

    /// Register a certificate for a name that no configured entry may shadow.
    pub(crate) fn reserve(&mut self, name: &str, key: Arc<CertifiedKey>) {
        self.reserved.push((name.to_ascii_lowercase(), key));
    }

    pub fn build(self) -> Result<SniRegistry> {
        let mut by_pattern: HashMap<NamePattern, Candidate> = HashMap::new();
        let mut offer = |pattern: NamePattern, candidate: Candidate| {
            let wins = by_pattern
                .get(&pattern)
                .is_none_or(|current| candidate.outranks(current));
            if wins {
                by_pattern.insert(pattern, candidate);
            }
        };

        for (order, entry) in self.entries.iter().enumerate() {
            let (origin, names) = if entry.names.is_empty() {
                (Origin::Extracted, extract_names(&entry.pair)?)
            } else {
                (Origin::Explicit, entry.names.clone())
            };

            tracing::info!(
                cert_path = %entry.pair.source.cert_file.display(),
                names = ?names,
                explicit = origin == Origin::Explicit,
                "Registered SNI certificate"
            );

            for name in names {
                offer(
                    NamePattern::parse(&name),
                    Candidate {
                        origin,
                        order,
                        key: entry.pair.key.clone(),
                    },
                );
            }
        }

        for (order, (name, key)) in self.reserved.into_iter().enumerate() {
            offer(
                NamePattern::Exact(name),
                Candidate {
                    origin: Origin::Reserved,
                    order,
                    key,
                },
            );
        }

        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        for (pattern, candidate) in by_pattern {
            match pattern {
                NamePattern::Exact(name) => {
                    exact.insert(name, candidate.key);
                }
                NamePattern::Wildcard(suffix) => wildcards.push((suffix, candidate)),
            }
        }
        // Longest suffix first; origin and declaration order settle the rest.
        wildcards.sort_by(|(a_suffix, a), (b_suffix, b)| {
            b_suffix
                .len()
                .cmp(&a_suffix.len())
                .then(b.origin.cmp(&a.origin))
                .then(a.order.cmp(&b.order))
        });

        Ok(SniRegistry {
            default_cert: self.default_cert,
            exact,
            wildcards: wildcards
                .into_iter()
                .map(|(suffix, candidate)| (NamePattern::Wildcard(suffix), candidate.key))
                .collect(),
        })
    }
}

/// Read-only name to certificate lookup used during handshakes.
pub struct SniRegistry {
    default_cert: Option<Arc<CertifiedKey>>,
    exact: HashMap<String, Arc<CertifiedKey>>,
    wildcards: Vec<(NamePattern, Arc<CertifiedKey>)>,
}

impl SniRegistry {
    pub fn builder() -> SniRegistryBuilder {
        SniRegistryBuilder::new()
    }

    /// Certificate for `server_name`, falling back to the default certificate.
    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            return self.default_cert.clone();
        };
        let host = name.trim_end_matches('.').to_ascii_lowercase();

        if let Some(key) = self.exact.get(&host) {
            tracing::debug!(hostname = %host, "SNI exact match");
            return Some(key.clone());
        }

        if let Some((pattern, key)) = self.wildcards.iter().find(|(p, _)| p.matches(&host)) {
            tracing::debug!(hostname = %host, pattern = %pattern, "SNI wildcard match");
            return Some(key.clone());
        }

        if self.default_cert.is_none() {
            tracing::warn!(hostname = %host, "No certificate found for hostname");
        }
        self.default_cert.clone()
    }

    /// Whether a literal entry exists for `name`.
    pub fn has_exact(&self, name: &str) -> bool {
        self.exact.contains_key(&name.to_ascii_lowercase())
    }

    pub fn has_default(&self) -> bool {
        self.default_cert.is_some()
    }

    /// Every registered pattern, literals first.
    pub fn patterns(&self) -> Vec<NamePattern> {
        let mut exact: Vec<NamePattern> = self
            .exact
            .keys()
            .map(|name| NamePattern::Exact(name.clone()))
            .collect();
        exact.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
        exact.extend(self.wildcards.iter().map(|(p, _)| p.clone()));
        exact
    }
}

impl fmt::Debug for SniRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniRegistry")
            .field("default", &self.default_cert.is_some())
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl ResolvesServerCert for SniRegistry {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// Names a certificate answers for: its subject common name when that looks
/// like a host name or is a bare `*`, plus its DNS alternative names. IP addresses are skipped
/// since SNI never carries them.
fn extract_names(pair: &CertKeyPair) -> Result<Vec<String>> {
    let malformed = |reason: String| ServingError::MalformedKeyPair {
        cert: pair.source.cert_file.clone(),
        key: pair.source.key_file.clone(),
        reason,
    };

    let (_, cert) = X509Certificate::from_der(pair.leaf().as_ref())
        .map_err(|e| malformed(format!("parse error for SNI certificate: {e}")))?;

    let mut names = Vec::new();
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        && (cn == "*" || is_dns_subdomain(cn.strip_prefix("*.").unwrap_or(cn)))
    {
        names.push(cn.to_string());
    }

    let san = cert
        .subject_alternative_name()
        .map_err(|e| malformed(format!("invalid subject alternative names: {e}")))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name
                && !names.iter().any(|n| n == dns)
            {
                names.push(dns.to_string());
            }
        }
    }

    Ok(names)
}

/// RFC 1123 subdomain: dot separated lowercase alphanumeric labels with
/// interior hyphens, at most 253 characters.
fn is_dns_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::store::{CertKey, certified_key_from_pem};
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn pair(cn: &str, sans: &[&str]) -> CertKeyPair {
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let key = certified_key_from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
            .unwrap();
        CertKeyPair {
            source: CertKey::new(format!("{cn}.crt"), format!("{cn}.key")),
            key: Arc::new(key),
        }
    }

    fn named(cn: &str, names: &[&str]) -> NamedCertificate {
        NamedCertificate::new(pair(cn, &[]), names.iter().map(|s| s.to_string()).collect())
    }

    fn same(a: &Arc<CertifiedKey>, b: &NamedCertificate) -> bool {
        a.cert[0] == b.pair.key.cert[0]
    }

    #[test]
    fn test_pattern_parse_and_match() {
        let wildcard = NamePattern::parse("*.Example.com");
        assert_eq!(wildcard, NamePattern::Wildcard("example.com".to_string()));
        assert!(wildcard.matches("a.example.com"));
        assert!(wildcard.matches("x.corp.example.com"));
        assert!(!wildcard.matches("example.com"));
        assert!(!wildcard.matches(".example.com"));
        assert!(!wildcard.matches("badexample.com"));

        let exact = NamePattern::parse("a.example.com");
        assert!(exact.matches("a.example.com"));
        assert!(!exact.matches("b.example.com"));
        assert_eq!(wildcard.to_string(), "*.example.com");
    }

    #[test]
    fn test_literal_beats_wildcard_registered_first() {
        let wildcard = named("wild", &["*.example.com"]);
        let literal = named("literal", &["a.example.com"]);
        let registry = SniRegistry::builder()
            .add(wildcard.clone())
            .add(literal.clone())
            .build()
            .unwrap();

        let resolved = registry.resolve_name(Some("a.example.com")).unwrap();
        assert!(same(&resolved, &literal));
        let resolved = registry.resolve_name(Some("b.example.com")).unwrap();
        assert!(same(&resolved, &wildcard));
    }

    #[test]
    fn test_longest_wildcard_suffix_wins() {
        let broad = named("broad", &["*.example.com"]);
        let narrow = named("narrow", &["*.corp.example.com"]);
        let registry = SniRegistry::builder()
            .add(broad.clone())
            .add(narrow.clone())
            .build()
            .unwrap();

        let resolved = registry.resolve_name(Some("x.corp.example.com")).unwrap();
        assert!(same(&resolved, &narrow));
        let resolved = registry.resolve_name(Some("x.example.com")).unwrap();
        assert!(same(&resolved, &broad));
    }

    #[test]
    fn test_identical_patterns_earliest_declared_wins() {
        let first = named("first", &["api.example.com", "*.example.com"]);
        let second = named("second", &["api.example.com", "*.example.com"]);
        let registry = SniRegistry::builder()
            .add(first.clone())
            .add(second.clone())
            .build()
            .unwrap();

        assert!(same(&registry.resolve_name(Some("api.example.com")).unwrap(), &first));
        assert!(same(&registry.resolve_name(Some("www.example.com")).unwrap(), &first));
    }

    #[test]
    fn test_names_extracted_when_none_given() {
        let entry = NamedCertificate::new(pair("svc.example.com", &["alt.example.com"]), vec![]);
        let registry = SniRegistry::builder().add(entry.clone()).build().unwrap();

        assert!(registry.has_exact("svc.example.com"));
        assert!(registry.has_exact("alt.example.com"));
        assert!(same(&registry.resolve_name(Some("alt.example.com")).unwrap(), &entry));
    }

    #[test]
    fn test_non_host_common_name_is_not_extracted() {
        let entry = NamedCertificate::new(pair("My Service", &["svc.example.com"]), vec![]);
        let registry = SniRegistry::builder().add(entry).build().unwrap();

        assert!(!registry.has_exact("my service"));
        assert!(registry.has_exact("svc.example.com"));
    }

    #[test]
    fn test_bare_star_common_name_is_extracted() {
        let entry = NamedCertificate::new(pair("*", &[]), vec![]);
        let names = extract_names(&entry.pair).unwrap();
        assert_eq!(names, vec!["*"]);

        let registry = SniRegistry::builder().add(entry).build().unwrap();
        assert!(registry.has_exact("*"));
    }

    #[test]
    fn test_explicit_names_outrank_extracted() {
        let extracted = NamedCertificate::new(pair("svc.example.com", &[]), vec![]);
        let explicit = named("other", &["svc.example.com"]);
        let registry = SniRegistry::builder()
            .add(extracted)
            .add(explicit.clone())
            .build()
            .unwrap();

        assert!(same(&registry.resolve_name(Some("svc.example.com")).unwrap(), &explicit));
    }

    #[test]
    fn test_reserved_name_cannot_be_shadowed() {
        let squatter = named("squatter", &["loopback.internal"]);
        let reserved = pair("loopback.internal", &[]);
        let mut builder = SniRegistry::builder().add(squatter);
        builder.reserve("loopback.internal", reserved.key.clone());
        let registry = builder.build().unwrap();

        let resolved = registry.resolve_name(Some("loopback.internal")).unwrap();
        assert_eq!(resolved.cert[0], reserved.key.cert[0]);
    }

    #[test]
    fn test_unknown_name_falls_back_to_default() {
        let primary = pair("primary", &[]);
        let registry = SniRegistry::builder()
            .default_cert(Some(&primary))
            .add(named("a", &["a.example.com"]))
            .build()
            .unwrap();

        let resolved = registry.resolve_name(Some("other.test")).unwrap();
        assert_eq!(resolved.cert[0], primary.key.cert[0]);
        let resolved = registry.resolve_name(None).unwrap();
        assert_eq!(resolved.cert[0], primary.key.cert[0]);
    }

    #[test]
    fn test_unknown_name_without_default_fails() {
        let registry = SniRegistry::builder()
            .add(named("a", &["a.example.com"]))
            .build()
            .unwrap();

        assert!(!registry.has_default());
        assert!(registry.resolve_name(Some("other.test")).is_none());
        assert!(registry.resolve_name(None).is_none());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let entry = named("a", &["A.Example.com"]);
        let registry = SniRegistry::builder().add(entry.clone()).build().unwrap();
        assert!(same(&registry.resolve_name(Some("a.EXAMPLE.com.")).unwrap(), &entry));
    }

    #[test]
    fn test_dns_subdomain_validation() {
        assert!(is_dns_subdomain("a.example.com"));
        assert!(is_dns_subdomain("svc-1"));
        assert!(!is_dns_subdomain("My Service"));
        assert!(!is_dns_subdomain("-bad.example.com"));
        assert!(!is_dns_subdomain("a..b"));
        assert!(!is_dns_subdomain(""));
    }
}
