//! Outbound connection establishment.
//!
//! # Data Flow
//! ```text
//! protocol decoder
//!     → Endpoint (domain:port or resolved address)
//!     → Connector::connect (runs on its own task)
//!     → result posted back to the connection's task
//!     → spliced with the client connection
//! ```
//!
//! # Design Decisions
//! - The core never dials sockets itself; transports are swappable
//! - Connectors own any retry or timeout policy

pub mod endpoint;
#[cfg(test)]
pub(crate) mod mock;
pub mod tcp;

use std::io;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

pub use endpoint::{Endpoint, ProxyRequest};
pub use tcp::TcpConnector;

/// A live, bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection returned by connectors.
pub type BoxedConnection = Box<dyn Connection>;

/// Asynchronously turns an [`Endpoint`] into an established connection.
///
/// Implementations must be callable from any task; the returned future is
/// driven on a task of its own, so it must be `'static`.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, io::Result<BoxedConnection>>;
}
