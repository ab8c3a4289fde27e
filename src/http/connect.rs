//! HTTP CONNECT tunnelling.
//!
//! [`ConnectUpgrade`] is the per-connection state machine; it does no I/O
//! and is generic over the upstream type so it can be driven directly in
//! tests. [`HttpConnectHandler`] drives it from a client socket.
//!
//! ```text
//! Idle ──head──▶ BeganConnecting ──end──▶ AwaitingConnection ──connected──▶ UpgradeComplete
//!                      │                                                          ▲
//!                      └──connected──▶ AwaitingEnd ──end──────────────────────────┘
//! ```
//! A bad head or a failed connect lands in `UpgradeFailed` after a `400`.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::OptionFuture;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::codec::{bad_request, connect_established, RequestDecoder, RequestHead, RequestPart};
use super::HttpProxyError;
use crate::connector::{BoxedConnection, Connection, Connector, Endpoint};
use crate::error::ProxyError;
use crate::pipeline::{spawn_connect, DataBacklog, Passthrough, PendingConnect, Splice};

const DEFAULT_PORT: u16 = 80;

#[derive(Debug)]
enum ConnectState<U> {
    Idle,
    BeganConnecting,
    AwaitingEnd(U),
    /// End of request seen; raw bytes are held until the upstream is ready.
    AwaitingConnection(DataBacklog<Bytes>),
    UpgradeComplete(DataBacklog<Bytes>),
    UpgradeFailed,
}

impl<U> ConnectState<U> {
    fn name(&self) -> &'static str {
        match self {
            ConnectState::Idle => "idle",
            ConnectState::BeganConnecting => "connecting",
            ConnectState::AwaitingEnd(_) => "awaiting end of request",
            ConnectState::AwaitingConnection(_) => "awaiting connection",
            ConnectState::UpgradeComplete(_) => "upgraded",
            ConnectState::UpgradeFailed => "failed",
        }
    }
}

/// What the driver must do after feeding an event to [`ConnectUpgrade`].
#[derive(Debug)]
pub enum ConnectAction<U> {
    None,
    /// Start connecting to this endpoint.
    Connect(Endpoint),
    /// Send `200`, then splice the client with this upstream.
    Upgrade(U),
    /// Logic violation; close without a reply.
    Close {
        frame: &'static str,
        state: &'static str,
    },
}

/// CONNECT upgrade state machine for one client connection.
#[derive(Debug)]
pub struct ConnectUpgrade<U> {
    state: ConnectState<U>,
}

impl<U> ConnectUpgrade<U> {
    pub fn new() -> Self {
        Self {
            state: ConnectState::Idle,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// The end of the CONNECT request has been seen; bytes from here on
    /// are tunnel payload and must not be HTTP-decoded.
    pub fn decoder_removed(&self) -> bool {
        matches!(
            self.state,
            ConnectState::AwaitingConnection(_) | ConnectState::UpgradeComplete(_)
        )
    }

    /// Feed one decoded request part.
    ///
    /// `Err` means the request cannot be served: reply `400` and close.
    pub fn on_part(&mut self, part: RequestPart) -> Result<ConnectAction<U>, HttpProxyError> {
        let state = std::mem::replace(&mut self.state, ConnectState::UpgradeFailed);

        let (next, action) = match (state, part) {
            (ConnectState::Idle, RequestPart::Head(head)) => {
                let endpoint = connect_target(&head)?;
                (ConnectState::BeganConnecting, ConnectAction::Connect(endpoint))
            }
            (ConnectState::BeganConnecting, RequestPart::End(_)) => (
                ConnectState::AwaitingConnection(DataBacklog::new()),
                ConnectAction::None,
            ),
            // A CONNECT body has no meaning.
            (ConnectState::BeganConnecting, _) => (ConnectState::BeganConnecting, ConnectAction::None),
            (ConnectState::AwaitingEnd(upstream), RequestPart::End(_)) => (
                ConnectState::UpgradeComplete(DataBacklog::new()),
                ConnectAction::Upgrade(upstream),
            ),
            (state, part) => (
                ConnectState::UpgradeFailed,
                ConnectAction::Close {
                    frame: part.kind(),
                    state: state.name(),
                },
            ),
        };

        self.state = next;
        Ok(action)
    }

    /// Queue raw bytes read after the end of the request.
    pub fn on_raw(&mut self, bytes: Bytes) -> Result<(), ProxyError> {
        match &mut self.state {
            ConnectState::AwaitingConnection(pending) | ConnectState::UpgradeComplete(pending) => {
                pending.add(bytes);
                Ok(())
            }
            state => Err(ProxyError::UnexpectedFrame {
                frame: "raw bytes",
                state: state.name(),
            }),
        }
    }

    pub fn on_connected(&mut self, upstream: U) -> ConnectAction<U> {
        match std::mem::replace(&mut self.state, ConnectState::UpgradeFailed) {
            ConnectState::BeganConnecting => {
                self.state = ConnectState::AwaitingEnd(upstream);
                ConnectAction::None
            }
            ConnectState::AwaitingConnection(pending) => {
                self.state = ConnectState::UpgradeComplete(pending);
                ConnectAction::Upgrade(upstream)
            }
            state => ConnectAction::Close {
                frame: "connect result",
                state: state.name(),
            },
        }
    }

    /// Returns `true` if the client is still speaking HTTP and should get
    /// a `400` before the connection is closed.
    pub fn on_connect_failed(&mut self) -> bool {
        let replied = matches!(
            self.state,
            ConnectState::BeganConnecting | ConnectState::AwaitingConnection(_)
        );
        self.state = ConnectState::UpgradeFailed;
        replied
    }

    /// Hand over every byte held back during the upgrade, in arrival order.
    ///
    /// Only yields anything once upgraded. Safe to call repeatedly.
    pub fn on_removed(&mut self) -> DataBacklog<Bytes> {
        match &mut self.state {
            ConnectState::UpgradeComplete(pending) => std::mem::take(pending),
            _ => DataBacklog::new(),
        }
    }
}

impl<U> Default for ConnectUpgrade<U> {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a CONNECT request target (`host[:port]` or `[v6]:port`).
fn connect_target(head: &RequestHead) -> Result<Endpoint, HttpProxyError> {
    if head.method != Method::CONNECT {
        return Err(HttpProxyError::InvalidMethod);
    }

    let authority = head.uri.as_str();
    let invalid = || HttpProxyError::InvalidConnectTarget(authority.to_owned());

    let (host, port) = match authority.strip_prefix('[') {
        Some(bracketed) => {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            match after {
                "" => (host, None),
                _ => (host, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
            }
        }
        None => match authority.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        },
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = port
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    Ok(Endpoint::domain(host, port))
}

/// Serves CONNECT requests.
#[derive(Clone)]
pub struct HttpConnectHandler {
    connector: Arc<dyn Connector>,
    splice: Splice,
}

impl HttpConnectHandler {
    pub fn new(connector: Arc<dyn Connector>, splice: Splice) -> Self {
        Self { connector, splice }
    }

    /// Serve `client` until the tunnel closes.
    ///
    /// `replay` holds parts already decoded from the connection; `buf` and
    /// `decoder` carry on from where that decoding stopped.
    pub async fn serve<C: Connection>(
        &self,
        mut client: C,
        mut buf: BytesMut,
        mut decoder: RequestDecoder,
        mut replay: DataBacklog<RequestPart>,
    ) -> Result<(), ProxyError> {
        let mut replayed = Vec::new();
        match replay.flush(&mut replayed) {
            Ok(()) => {}
            Err(never) => match never {},
        }
        let mut queued = VecDeque::from(replayed);

        let mut upgrade = ConnectUpgrade::new();
        let mut pending: Option<PendingConnect> = None;
        let mut client_open = true;

        loop {
            while !upgrade.decoder_removed() {
                let part = match queued.pop_front() {
                    Some(part) => part,
                    None => match decoder.decode(&mut buf) {
                        Ok(Some(part)) => part,
                        Ok(None) => break,
                        Err(e) => return reject(&mut client, e.into()).await,
                    },
                };

                match upgrade.on_part(part) {
                    Ok(ConnectAction::None) => {}
                    Ok(ConnectAction::Connect(endpoint)) => {
                        tracing::debug!(endpoint = %endpoint, "CONNECT requested");
                        pending = Some(spawn_connect(&self.connector, &endpoint));
                    }
                    Ok(ConnectAction::Upgrade(upstream)) => {
                        return self.upgrade(client, upstream, upgrade, buf).await;
                    }
                    Ok(ConnectAction::Close { frame, state }) => {
                        return Err(ProxyError::UnexpectedFrame { frame, state });
                    }
                    Err(e) => return reject(&mut client, e.into()).await,
                }
            }

            if upgrade.decoder_removed() && !buf.is_empty() {
                upgrade.on_raw(buf.split().freeze())?;
            }

            tokio::select! {
                biased;

                Some(result) = OptionFuture::from(pending.as_mut()) => {
                    pending = None;
                    match result {
                        Ok(upstream) => match upgrade.on_connected(upstream) {
                            ConnectAction::Upgrade(upstream) => {
                                return self.upgrade(client, upstream, upgrade, buf).await;
                            }
                            ConnectAction::Close { frame, state } => {
                                return Err(ProxyError::UnexpectedFrame { frame, state });
                            }
                            ConnectAction::None | ConnectAction::Connect(_) => {}
                        },
                        Err(error) => {
                            if upgrade.on_connect_failed() {
                                return reject(&mut client, error).await;
                            }
                            return Err(error);
                        }
                    }
                }

                read = client.read_buf(&mut buf), if client_open => {
                    if read? == 0 {
                        if !upgrade.decoder_removed() {
                            return Err(ProxyError::ClosedDuringHandshake);
                        }
                        client_open = false;
                    }
                }

                else => return Err(ProxyError::ClosedDuringHandshake),
            }
        }
    }

    async fn upgrade<C: Connection>(
        &self,
        mut client: C,
        upstream: BoxedConnection,
        mut upgrade: ConnectUpgrade<BoxedConnection>,
        mut buf: BytesMut,
    ) -> Result<(), ProxyError> {
        if !buf.is_empty() {
            upgrade.on_raw(buf.split().freeze())?;
        }

        client.write_all(&connect_established()).await?;
        client.flush().await?;

        let pending = upgrade.on_removed();
        tracing::debug!(queued = pending.len(), "CONNECT tunnel established");
        self.splice.run(client, upstream, Passthrough, pending).await
    }
}

/// Best-effort `400`, then close our side.
async fn reject<C: Connection>(client: &mut C, error: ProxyError) -> Result<(), ProxyError> {
    let _ = client.write_all(&bad_request()).await;
    let _ = client.shutdown().await;
    Err(error)
}
