//! Secure port listener acquisition.

use crate::error::{Result, ServingError};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::str::FromStr;

/// Network family to listen on. `tcp` accepts either address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    fn admits(self, address: IpAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => address.is_ipv4(),
            Network::Tcp6 => address.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "" | "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(format!(
                "unsupported network '{other}', expected tcp, tcp4 or tcp6"
            )),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        })
    }
}

/// A bound listener and the port it actually holds.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    pub address: SocketAddr,
    pub port: u16,
}

/// Outcome of a bind request.
#[derive(Debug)]
pub enum ListenerBinding {
    /// Port 0 was requested: secure serving is off.
    Disabled,
    Bound(BoundListener),
}

impl ListenerBinding {
    pub fn bound(&self) -> Option<&BoundListener> {
        match self {
            ListenerBinding::Disabled => None,
            ListenerBinding::Bound(bound) => Some(bound),
        }
    }

    pub fn into_bound(self) -> Option<BoundListener> {
        match self {
            ListenerBinding::Disabled => None,
            ListenerBinding::Bound(bound) => Some(bound),
        }
    }
}

/// Bind `address:port`. Port 0 means disabled and binds nothing.
pub fn bind(network: Network, address: IpAddr, port: u16) -> Result<ListenerBinding> {
    if port == 0 {
        tracing::info!("Secure port is 0, secure serving disabled");
        return Ok(ListenerBinding::Disabled);
    }
    bind_socket(network, SocketAddr::new(address, port)).map(ListenerBinding::Bound)
}

/// Bind `address` on a port chosen by the operating system.
pub fn bind_ephemeral(network: Network, address: IpAddr) -> Result<BoundListener> {
    bind_socket(network, SocketAddr::new(address, 0))
}

/// Take over a listener bound elsewhere, reading back its port.
pub fn adopt(listener: TcpListener) -> Result<BoundListener> {
    let (address, port) = bound_endpoint(&listener)?;
    tracing::info!(address = %address, "Using provided secure listener");
    Ok(BoundListener {
        listener,
        address,
        port,
    })
}

fn bind_socket(network: Network, addr: SocketAddr) -> Result<BoundListener> {
    if !network.admits(addr.ip()) {
        return Err(ServingError::bind(
            addr,
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address family does not match network {network}"),
            ),
        ));
    }

    let listener = TcpListener::bind(addr).map_err(|e| ServingError::bind(addr, e))?;
    let (address, port) = bound_endpoint(&listener)?;

    tracing::info!(network = %network, address = %address, "Secure listener bound");
    Ok(BoundListener {
        listener,
        address,
        port,
    })
}

fn bound_endpoint(listener: &TcpListener) -> Result<(SocketAddr, u16)> {
    let address = listener
        .local_addr()
        .map_err(|e| ServingError::InvalidListenerAddress(e.to_string()))?;
    if address.port() == 0 {
        return Err(ServingError::InvalidListenerAddress(format!(
            "{address} has no port"
        )));
    }
    Ok((address, address.port()))
}
