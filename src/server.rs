//! Front listeners: accept client connections and hand each one to its
//! protocol handler on a task of its own.
//!
//! # Data Flow
//! ```text
//! socks5 listener ─┐
//!                  ├─ accept (bounded) → ConnectionTracker → spawn
//! http listener ───┘        → Socks5Handler::serve | HttpProxyHandler::serve
//! ```
//!
//! # Design Decisions
//! - One task per client connection; it owns every state machine for that
//!   connection
//! - Handler errors end the connection and are logged, never propagated

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::error::ProxyError;
use crate::http::HttpProxyHandler;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::observability::metrics;
use crate::pipeline::Splice;
use crate::socks5::Socks5Handler;

/// Client-facing protocol spoken on a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Socks5,
    Http,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Socks5 => "socks5",
            Protocol::Http => "http",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
enum Frontend {
    Socks5(Socks5Handler),
    Http(HttpProxyHandler),
}

impl Frontend {
    fn protocol(&self) -> Protocol {
        match self {
            Frontend::Socks5(_) => Protocol::Socks5,
            Frontend::Http(_) => Protocol::Http,
        }
    }

    async fn serve(&self, client: TcpStream) -> Result<(), ProxyError> {
        match self {
            Frontend::Socks5(handler) => handler.serve(client).await,
            Frontend::Http(handler) => handler.serve(client).await,
        }
    }
}

/// Bound front listeners, ready to serve.
pub struct ProxyServer {
    fronts: Vec<(Listener, Frontend)>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    /// Bind every enabled front end. The config is expected to be validated.
    pub async fn bind(
        config: &ProxyConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ListenerError> {
        let splice = Splice::from_config(&config.splice);
        let max_connections = config.listener.max_connections;
        let mut fronts = Vec::new();

        if config.socks5.enabled {
            let addr = parse_bind_address(&config.socks5.bind_address)?;
            let handler = Socks5Handler::new(Arc::clone(&connector), splice.clone());
            fronts.push((
                Listener::bind(addr, max_connections).await?,
                Frontend::Socks5(handler),
            ));
        }

        if config.http.enabled {
            let addr = parse_bind_address(&config.http.bind_address)?;
            let handler = HttpProxyHandler::new(
                Arc::clone(&connector),
                splice.clone(),
                config.http.check_endpoint_match,
            );
            fronts.push((
                Listener::bind(addr, max_connections).await?,
                Frontend::Http(handler),
            ));
        }

        Ok(Self {
            fronts,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Address the given front end is bound to, if it is enabled.
    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.fronts
            .iter()
            .find(|(_, front)| front.protocol() == protocol)
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` is triggered.
    ///
    /// Connections already being served keep running; use the tracker to
    /// wait for them.
    pub async fn run(self, shutdown: &Shutdown) {
        let tracker = self.tracker;
        let loops = self
            .fronts
            .into_iter()
            .map(|(listener, front)| accept_loop(listener, front, tracker.clone(), shutdown));
        join_all(loops).await;
    }
}

async fn accept_loop(
    listener: Listener,
    front: Frontend,
    tracker: ConnectionTracker,
    shutdown: &Shutdown,
) {
    let protocol = front.protocol();
    let mut stop = shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.wait() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Accept(e)) => {
                tracing::warn!(protocol = %protocol, error = %e, "Accept failed");
                continue;
            }
            Err(e) => {
                tracing::error!(protocol = %protocol, error = %e, "Listener stopped");
                break;
            }
        };

        let guard = tracker.track(protocol.as_str());
        let span = tracing::info_span!(
            "connection",
            id = %guard.id(),
            protocol = %protocol,
            peer = %peer_addr
        );
        let front = front.clone();

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                let result = front.serve(stream).await;
                report(protocol, result);
            }
            .instrument(span),
        );
    }

    tracing::info!(protocol = %protocol, "Stopped accepting connections");
}

fn report(protocol: Protocol, result: Result<(), ProxyError>) {
    match result {
        Ok(()) => tracing::debug!("Connection finished"),
        Err(e) if e.is_framing() => {
            metrics::record_protocol_error(protocol.as_str());
            tracing::debug!(error = %e, "Protocol error");
        }
        Err(e) if e.is_connect_failure() => {
            metrics::record_connect_failure(protocol.as_str());
            tracing::warn!(error = %e, "Upstream connect failed");
        }
        Err(e) => tracing::debug!(error = %e, "Connection ended with error"),
    }
}

fn parse_bind_address(value: &str) -> Result<SocketAddr, ListenerError> {
    value
        .parse()
        .map_err(|e| ListenerError::Bind(io::Error::new(io::ErrorKind::InvalidInput, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;

    fn loopback_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.socks5.bind_address = "127.0.0.1:0".into();
        config.http.bind_address = "127.0.0.1:0".into();
        config
    }

    #[tokio::test]
    async fn binds_only_enabled_fronts() {
        let mut config = loopback_config();
        config.socks5.enabled = false;

        let server = ProxyServer::bind(&config, Arc::new(MockConnector::refusing()))
            .await
            .unwrap();
        assert!(server.local_addr(Protocol::Socks5).is_none());
        assert!(server.local_addr(Protocol::Http).is_some());
    }

    #[tokio::test]
    async fn run_returns_after_shutdown() {
        let server = ProxyServer::bind(&loopback_config(), Arc::new(MockConnector::refusing()))
            .await
            .unwrap();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(1), server.run(&shutdown))
            .await
            .unwrap();
    }

    #[test]
    fn bad_bind_address_is_a_bind_error() {
        assert!(matches!(
            parse_bind_address("localhost"),
            Err(ListenerError::Bind(_))
        ));
    }
}
