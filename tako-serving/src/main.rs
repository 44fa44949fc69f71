use clap::Parser;
use rustls::{ClientConnection, ServerConfig, ServerConnection};
use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tako_serving::listener::Network;
use tako_serving::options::{DEFAULT_CERT_DIR, DEFAULT_PAIR_NAME, DEFAULT_SECURE_PORT};
use tako_serving::tls::{
    CertKey, LOOPBACK_SERVER_NAME, LoopbackClientConfig, install_crypto_provider,
};
use tako_serving::{GeneratableKeyCert, NamedCertKey, SecureServingOptions, ServingIdentity};
use tracing_subscriber::EnvFilter;

const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tako Serving - secure endpoint with SNI and loopback trust
#[derive(Parser)]
#[command(name = "tako-serving")]
#[command(version)]
#[command(about = "Tako Serving - secure endpoint with SNI and loopback trust")]
pub struct Args {
    /// IP address to listen on for the secure port (0.0.0.0 for all interfaces)
    #[arg(long, env = "TAKO_BIND_ADDRESS", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind_address: IpAddr,

    /// Port to serve HTTPS on. 0 disables secure serving
    #[arg(long, env = "TAKO_SECURE_PORT", default_value_t = DEFAULT_SECURE_PORT)]
    pub secure_port: u16,

    /// Network to listen on: tcp, tcp4 or tcp6
    #[arg(long, default_value = "tcp")]
    pub bind_network: Network,

    /// Directory for the generated certificate when no certificate is given
    #[arg(long, default_value = DEFAULT_CERT_DIR)]
    pub cert_dir: PathBuf,

    /// File stem of the generated certificate and key inside --cert-dir
    #[arg(long, default_value = DEFAULT_PAIR_NAME)]
    pub pair_name: String,

    /// Default x509 certificate for HTTPS (CA cert, if any, concatenated after it)
    #[arg(long)]
    pub tls_cert_file: Option<PathBuf>,

    /// Private key matching --tls-cert-file
    #[arg(long)]
    pub tls_private_key_file: Option<PathBuf>,

    /// PEM-encoded certificate authority for the serving certificate
    #[arg(long)]
    pub tls_ca_file: Option<PathBuf>,

    /// Comma-separated cipher suites, e.g. TLS_AES_128_GCM_SHA256
    #[arg(long, value_delimiter = ',')]
    pub tls_cipher_suites: Vec<String>,

    /// Certificate and key for SNI, optionally with name patterns:
    /// "foo.crt,foo.key" or "foo.crt,foo.key:*.foo.com,foo.com". Repeatable
    #[arg(long = "tls-sni-cert-key")]
    pub tls_sni_cert_keys: Vec<NamedCertKey>,

    /// Host name the generated certificate is issued for
    #[arg(long)]
    pub external_hostname: Option<String>,
}

impl Args {
    fn into_options(self) -> SecureServingOptions {
        SecureServingOptions {
            bind_address: self.bind_address,
            bind_port: self.secure_port,
            bind_network: self.bind_network,
            server_cert: GeneratableKeyCert {
                cert_key: CertKey::new(
                    self.tls_cert_file.unwrap_or_default(),
                    self.tls_private_key_file.unwrap_or_default(),
                ),
                ca_cert_file: self.tls_ca_file,
                cert_directory: self.cert_dir,
                pair_name: self.pair_name,
            },
            sni_cert_keys: self.tls_sni_cert_keys,
            cipher_suites: self.tls_cipher_suites,
            external_hostname: self.external_hostname,
            ..Default::default()
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let options = Args::parse().into_options();

    tracing::info!("Tako Serving v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Secure bind: {}", tako_serving::identity::describe_bind(&options));

    let Some(identity) = ServingIdentity::builder(options).assemble().inspect_err(|e| {
        tracing::error!("Failed to assemble secure serving: {}", e);
    })?
    else {
        tracing::info!("Nothing to serve, exiting");
        return Ok(());
    };

    let loopback = identity.loopback_client().cloned().map(Arc::new);
    let (tls_config, bound) = identity.into_parts();
    let address = bound.address;
    let listener = bound.listener;

    let server = {
        let loopback = loopback.clone();
        std::thread::spawn(move || accept_loop(listener, tls_config, loopback))
    };

    if let Some(loopback) = loopback {
        match loopback_self_check(&loopback, address) {
            Ok(()) => tracing::info!("Loopback self-check passed"),
            Err(e) => tracing::warn!("Loopback self-check failed: {}", e),
        }
    }

    server
        .join()
        .map_err(|_| "accept loop panicked".to_string())?;
    Ok(())
}

fn accept_loop(
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    loopback: Option<Arc<LoopbackClientConfig>>,
) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let tls_config = tls_config.clone();
                let loopback = loopback.clone();
                std::thread::spawn(move || {
                    if let Err(e) =
                        serve_handshake(stream, tls_config, loopback.as_deref(), CLIENT_IDLE_TIMEOUT)
                    {
                        tracing::debug!("TLS handshake failed: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {}", e);
            }
        }
    }
}

/// Complete one handshake. A client reaching the loopback name must then
/// send the instance token on a single line and is answered `ok` or `denied`.
fn serve_handshake(
    mut stream: TcpStream,
    tls_config: Arc<ServerConfig>,
    loopback: Option<&LoopbackClientConfig>,
    idle_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    stream.set_read_timeout(Some(idle_timeout))?;
    let peer = stream.peer_addr().ok();
    let mut conn = ServerConnection::new(tls_config)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream)?;
    }

    tracing::info!(
        peer = ?peer,
        server_name = conn.server_name().unwrap_or("<none>"),
        "TLS session established"
    );

    if let Some(loopback) = loopback
        && conn.server_name() == Some(LOOPBACK_SERVER_NAME)
    {
        let mut tls = rustls::Stream::new(&mut conn, &mut stream);
        let mut presented = String::new();
        BufReader::new(&mut tls).read_line(&mut presented)?;
        let accepted = loopback.authenticates(&presented);
        let reply: &[u8] = if accepted { b"ok\n" } else { b"denied\n" };
        tls.write_all(reply)?;
        tls.flush()?;
        if accepted {
            tracing::debug!(peer = ?peer, "Loopback client authenticated");
        } else {
            tracing::warn!(peer = ?peer, "Loopback client presented a wrong token");
        }
    }

    conn.send_close_notify();
    conn.complete_io(&mut stream)?;
    stream.flush()?;
    Ok(())
}

fn loopback_self_check(
    loopback: &LoopbackClientConfig,
    address: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = match address.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), address.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), address.port())
        }
        _ => address,
    };

    let mut stream = TcpStream::connect_timeout(&target, SELF_CHECK_TIMEOUT)?;
    stream.set_read_timeout(Some(SELF_CHECK_TIMEOUT))?;
    let mut conn: ClientConnection = loopback.connect()?;
    while conn.is_handshaking() {
        conn.complete_io(&mut stream)?;
    }

    {
        let mut tls = rustls::Stream::new(&mut conn, &mut stream);
        tls.write_all(format!("{}\n", loopback.token).as_bytes())?;
        tls.flush()?;
        let mut reply = String::new();
        BufReader::new(&mut tls).read_line(&mut reply)?;
        if reply.trim_end() != "ok" {
            return Err("loopback token rejected".into());
        }
    }

    conn.send_close_notify();
    let _ = conn.complete_io(&mut stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tako_serving::ListenerSource;
    use tempfile::TempDir;

    fn local_identity(dir: &TempDir) -> ServingIdentity {
        let mut options = SecureServingOptions {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Default::default()
        };
        options.server_cert.cert_directory = dir.path().to_path_buf();
        ServingIdentity::builder(options)
            .listener(ListenerSource::Ephemeral)
            .assemble()
            .unwrap()
            .unwrap()
    }

    /// Serve exactly one connection on a background thread.
    fn serve_one(
        identity: ServingIdentity,
        loopback: Option<Arc<LoopbackClientConfig>>,
    ) -> (SocketAddr, std::thread::JoinHandle<Result<(), String>>) {
        let (tls_config, bound) = identity.into_parts();
        let address = bound.address;
        let server = std::thread::spawn(move || {
            let (stream, _) = bound.listener.accept().map_err(|e| e.to_string())?;
            serve_handshake(stream, tls_config, loopback.as_deref(), SELF_CHECK_TIMEOUT)
                .map_err(|e| e.to_string())
        });
        (address, server)
    }

    #[test]
    fn loopback_self_check_presents_token() {
        let temp = TempDir::new().unwrap();
        let identity = local_identity(&temp);
        let loopback = Arc::new(identity.loopback_client().cloned().unwrap());
        let (address, server) = serve_one(identity, Some(loopback.clone()));

        loopback_self_check(&loopback, address).unwrap();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn loopback_self_check_fails_with_wrong_token() {
        let temp = TempDir::new().unwrap();
        let identity = local_identity(&temp);
        let loopback = Arc::new(identity.loopback_client().cloned().unwrap());
        let (address, server) = serve_one(identity, Some(loopback.clone()));

        let mut impostor = (*loopback).clone();
        impostor.token = "0".repeat(loopback.token.len());
        assert!(loopback_self_check(&impostor, address).is_err());
        server.join().unwrap().unwrap();
    }

    #[test]
    fn idle_client_is_dropped_after_timeout() {
        let temp = TempDir::new().unwrap();
        let (tls_config, bound) = local_identity(&temp).into_parts();
        let _idle = TcpStream::connect(bound.address).unwrap();
        let (stream, _) = bound.listener.accept().unwrap();

        let started = std::time::Instant::now();
        let result = serve_handshake(stream, tls_config, None, Duration::from_millis(200));
        assert!(result.is_err());
        assert!(started.elapsed() < SELF_CHECK_TIMEOUT);
    }

    #[test]
    fn args_map_onto_options() {
        let args = Args::parse_from([
            "tako-serving",
            "--secure-port",
            "8443",
            "--cert-dir",
            "/tmp/certs",
            "--pair-name",
            "svc",
            "--tls-cipher-suites",
            "TLS_AES_128_GCM_SHA256,TLS_AES_256_GCM_SHA384",
            "--tls-sni-cert-key",
            "a.crt,a.key:*.a.test",
            "--tls-sni-cert-key",
            "b.crt,b.key",
        ]);
        let options = args.into_options();

        assert_eq!(options.bind_port, 8443);
        assert!(options.server_cert.cert_key.is_empty());
        assert_eq!(options.server_cert.cert_directory, PathBuf::from("/tmp/certs"));
        assert_eq!(options.server_cert.pair_name, "svc");
        assert_eq!(options.cipher_suites.len(), 2);
        assert_eq!(options.sni_cert_keys.len(), 2);
        assert_eq!(options.sni_cert_keys[0].names, vec!["*.a.test"]);
        assert_eq!(options.bind_network, Network::Tcp);
        assert!(options.validate().is_empty());
    }

    #[test]
    fn invalid_network_is_rejected() {
        assert!(Args::try_parse_from(["tako-serving", "--bind-network", "udp"]).is_err());
    }
}
