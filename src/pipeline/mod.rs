//! Per-connection plumbing shared by every protocol handler.
//!
//! # Responsibilities
//! - Ordered buffering of frames while an outbound connect is in flight
//! - Running connector calls off the connection's task
//! - Splicing the client and upstream connections together
//!
//! # Data Flow
//! ```text
//! handler task ──spawn_connect──▶ connector task
//!      │                               │
//!      │ frames → DataBacklog          │ JoinHandle result
//!      ◀───────────────────────────────┘
//!      │
//!      └─▶ Splice::run(client, upstream, relay, backlog)
//! ```

pub mod backlog;
pub mod glue;

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use crate::connector::{BoxedConnection, Connector, Endpoint};
use crate::error::ProxyError;

pub use backlog::{DataBacklog, FrameSink};
pub use glue::{GlueHandle, GlueTable, Passthrough, Relay, Side, Splice};

/// A connector call running on its own task.
///
/// Dropping it detaches the task; the connector's result is then discarded.
pub type PendingConnect = BoxFuture<'static, Result<BoxedConnection, ProxyError>>;

/// Start connecting to `endpoint` without blocking the caller.
pub fn spawn_connect(connector: &Arc<dyn Connector>, endpoint: &Endpoint) -> PendingConnect {
    let connecting = connector.connect(endpoint.clone());
    let target = endpoint.clone();
    let abandoned = endpoint.clone();

    tokio::spawn(async move {
        connecting.await.map_err(|source| ProxyError::Connect {
            endpoint: target,
            source,
        })
    })
    .map(move |joined| joined.unwrap_or_else(|_| Err(ProxyError::ConnectAbandoned(abandoned))))
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;
    use std::io;
    use std::time::Duration;
    use tokio::io::duplex;

    struct PanickingConnector;

    impl Connector for PanickingConnector {
        fn connect(&self, _: Endpoint) -> BoxFuture<'static, io::Result<BoxedConnection>> {
            Box::pin(async { panic!("connector blew up") })
        }
    }

    #[tokio::test]
    async fn connect_result_is_delivered() {
        let (stream, _peer) = duplex(64);
        let connector: Arc<dyn Connector> =
            Arc::new(MockConnector::with_stream(stream).delayed(Duration::from_millis(10)));

        let endpoint = Endpoint::domain("example.com", 80);
        assert!(spawn_connect(&connector, &endpoint).await.is_ok());

        let result = spawn_connect(&connector, &endpoint).await;
        assert!(matches!(
            result,
            Err(ProxyError::Connect { endpoint: ref e, .. }) if *e == endpoint
        ));
    }

    #[tokio::test]
    async fn failed_connector_task_is_abandoned() {
        let connector: Arc<dyn Connector> = Arc::new(PanickingConnector);
        let endpoint = Endpoint::domain("example.com", 443);

        let result = spawn_connect(&connector, &endpoint).await;
        assert!(matches!(
            result,
            Err(ProxyError::ConnectAbandoned(ref e)) if *e == endpoint
        ));
    }
}
