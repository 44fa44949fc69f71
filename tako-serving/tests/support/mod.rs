use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::{ClientConnection, ConnectionCommon, ServerConnection};
use std::fs;
use std::path::{Path, PathBuf};

/// Write a self-signed pair for `names` and return (cert path, key path, cert PEM).
pub fn write_cert(dir: &Path, stem: &str, names: &[&str]) -> (PathBuf, PathBuf, String) {
    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .expect("valid names");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, names.first().copied().unwrap_or(stem));
    params.distinguished_name = dn;
    let key_pair = KeyPair::generate().expect("key pair");
    let cert = params.self_signed(&key_pair).expect("self-signed");

    let cert_path = dir.join(format!("{stem}.crt"));
    let key_path = dir.join(format!("{stem}.key"));
    fs::write(&cert_path, cert.pem()).expect("write cert");
    fs::write(&key_path, key_pair.serialize_pem()).expect("write key");
    (cert_path, key_path, cert.pem())
}

pub fn leaf_der(cert_pem: &str) -> Vec<u8> {
    rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .expect("certificate block")
        .expect("valid certificate")
        .as_ref()
        .to_vec()
}

fn pump<A, B>(
    from: &mut ConnectionCommon<A>,
    to: &mut ConnectionCommon<B>,
) -> Result<bool, rustls::Error> {
    let mut buf = Vec::new();
    while from.wants_write() {
        from.write_tls(&mut buf).expect("buffer write");
    }
    if buf.is_empty() {
        return Ok(false);
    }
    let mut rd = buf.as_slice();
    while !rd.is_empty() {
        to.read_tls(&mut rd).expect("buffer read");
        to.process_new_packets()?;
    }
    Ok(true)
}

/// Drive both ends of an in-memory handshake to completion.
pub fn handshake(
    client: &mut ClientConnection,
    server: &mut ServerConnection,
) -> Result<(), rustls::Error> {
    for _ in 0..32 {
        let sent = pump(&mut **client, &mut **server)?;
        let received = pump(&mut **server, &mut **client)?;
        if !client.is_handshaking() && !server.is_handshaking() {
            return Ok(());
        }
        if !sent && !received {
            break;
        }
    }
    Err(rustls::Error::General("handshake stalled".to_string()))
}
