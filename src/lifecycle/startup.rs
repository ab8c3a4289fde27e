//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize logging and metrics
//! - Build the connector and splice settings from config
//! - Bind listeners and begin accepting traffic
//! - On a stop signal, stop accepting and drain open connections
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listeners start last (traffic only when ready)
//! - Drain has a deadline; connections still open after it are abandoned

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::connector::{Connector, TcpConnector};
use crate::lifecycle::{signals, Shutdown};
use crate::observability::{logging, metrics};
use crate::server::{Protocol, ProxyServer};

/// Run the proxy until a stop signal arrives. `config` must be validated.
pub async fn run(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lit-proxy starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let connector: Arc<dyn Connector> = Arc::new(TcpConnector::from_config(&config.connector));
    let server = ProxyServer::bind(&config, connector).await?;
    for protocol in [Protocol::Socks5, Protocol::Http] {
        if let Some(addr) = server.local_addr(protocol) {
            tracing::info!(protocol = %protocol, address = %addr, "Listening for connections");
        }
    }

    let tracker = server.tracker();
    let shutdown = Shutdown::new();

    let serving = server.run(&shutdown);
    tokio::pin!(serving);
    tokio::select! {
        () = &mut serving => {
            tracing::warn!("All listeners stopped");
        }
        signal = signals::wait_for_signal() => {
            tracing::info!(signal = signal?, "Shutdown requested");
            shutdown.trigger();
            serving.await;
        }
    }

    let drain_timeout = Duration::from_secs(config.listener.drain_timeout_secs);
    let open = tracker.active_count();
    if open > 0 {
        tracing::info!(open, ?drain_timeout, "Draining connections");
    }
    if !tracker.wait_idle(drain_timeout).await {
        tracing::warn!(
            remaining = tracker.active_count(),
            "Drain timeout elapsed, exiting with connections open"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
