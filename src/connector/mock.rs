//! In-memory connector for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::DuplexStream;

use super::{BoxedConnection, Connector, Endpoint};

/// Hands out queued duplex streams in order; refuses once they run out.
pub(crate) struct MockConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    requested: Mutex<Vec<Endpoint>>,
    delay: Duration,
}

impl MockConnector {
    pub(crate) fn refusing() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            requested: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_stream(stream: DuplexStream) -> Self {
        let connector = Self::refusing();
        connector.streams.lock().unwrap().push_back(stream);
        connector
    }

    /// Hold every connect for `delay` before completing it.
    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn requested(&self) -> Vec<Endpoint> {
        self.requested.lock().unwrap().clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: Endpoint) -> BoxFuture<'static, io::Result<BoxedConnection>> {
        self.requested.lock().unwrap().push(endpoint);
        let stream = self.streams.lock().unwrap().pop_front();
        let delay = self.delay;

        Box::pin(async move {
            tokio::time::sleep(delay).await;
            stream
                .map(|s| Box::new(s) as BoxedConnection)
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "mock refused"))
        })
    }
}
