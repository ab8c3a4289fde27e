//! Destination descriptors produced by the protocol decoders.

use std::fmt;
use std::net::SocketAddr;

/// Where a client wants to be connected.
///
/// Decoders produce an `Endpoint`; only a [`Connector`](super::Connector)
/// ever consumes one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A host name (or textual address) that still needs resolving.
    DomainPort { host: String, port: u16 },
    /// An already resolved socket address.
    Resolved(SocketAddr),
}

impl Endpoint {
    /// Build a `DomainPort` endpoint.
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Endpoint::DomainPort {
            host: host.into(),
            port,
        }
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::DomainPort { port, .. } => *port,
            Endpoint::Resolved(addr) => addr.port(),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Resolved(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::DomainPort { host, port } if host.contains(':') => {
                write!(f, "[{}]:{}", host, port)
            }
            Endpoint::DomainPort { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Resolved(addr) => write!(f, "{}", addr),
        }
    }
}

/// Envelope for handlers that announce a destination and then stream
/// payload frames for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest<T> {
    /// Always the first item on a connection.
    Endpoint(Endpoint),
    /// Raw payload, in arrival order.
    Data(T),
}
