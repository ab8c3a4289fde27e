//! Protocol-translating TCP proxy core.
//!
//! Accepts SOCKS5 and HTTP proxy clients, decodes the target they ask for,
//! connects to it through a pluggable [`Connector`](connector::Connector)
//! and splices the two connections together with bounded buffering.

pub mod config;
pub mod connector;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod server;
pub mod socks5;

pub use config::schema::ProxyConfig;
pub use connector::{Connector, Endpoint, TcpConnector};
pub use error::ProxyError;
pub use lifecycle::Shutdown;
pub use server::{Protocol, ProxyServer};
