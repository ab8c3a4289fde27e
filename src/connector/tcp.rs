//! Plain TCP connector.

use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use super::{BoxedConnection, Connector, Endpoint};
use crate::config::ConnectorConfig;

/// Dials endpoints with `TcpStream::connect`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Upper bound on a single dial; `None` waits for the OS.
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: None,
            nodelay: true,
        }
    }

    /// Build a connector from the `[connector]` config section.
    pub fn from_config(config: &ConnectorConfig) -> Self {
        let connect_timeout = match config.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            connect_timeout,
            nodelay: config.nodelay,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, io::Result<BoxedConnection>> {
        let connect_timeout = self.connect_timeout;
        let nodelay = self.nodelay;

        Box::pin(async move {
            let dial = async {
                match &endpoint {
                    Endpoint::Resolved(addr) => TcpStream::connect(addr).await,
                    Endpoint::DomainPort { host, port } => {
                        TcpStream::connect((host.as_str(), *port)).await
                    }
                }
            };

            let stream = match connect_timeout {
                Some(limit) => tokio::time::timeout(limit, dial).await.map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {} timed out after {:?}", endpoint, limit),
                    )
                })??,
                None => dial.await?,
            };
            stream.set_nodelay(nodelay)?;

            tracing::debug!(
                endpoint = %endpoint,
                local_addr = ?stream.local_addr().ok(),
                "Upstream connected"
            );
            Ok(Box::new(stream) as BoxedConnection)
        })
    }
}
