//! Plain (non-CONNECT) HTTP proxying.
//!
//! Requests arrive in absolute form (`GET http://host:port/path`). Each head
//! is rewritten to origin form, proxy-only headers are dropped and the
//! request is re-encoded to the upstream. The first request picks the
//! upstream; later requests on the same connection must target it too.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::future::OptionFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::codec::{bad_request, RequestDecoder, RequestEncoder, RequestHead, RequestPart};
use super::{url, HttpProxyError};
use crate::connector::{Connection, Connector, Endpoint};
use crate::error::ProxyError;
use crate::pipeline::{spawn_connect, DataBacklog, PendingConnect, Relay, Splice};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Per-connection request rewriting state.
#[derive(Debug)]
pub struct RequestRewriter {
    check_endpoint_match: bool,
    /// Host and port chosen by the first request.
    target: Option<(String, u16)>,
    connecting: bool,
    backlog: DataBacklog<RequestPart>,
}

impl RequestRewriter {
    pub fn new(check_endpoint_match: bool) -> Self {
        Self {
            check_endpoint_match,
            target: None,
            connecting: false,
            backlog: DataBacklog::new(),
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Rewrite `part` and either push it to `forward` or hold it while
    /// the upstream is being connected.
    ///
    /// Returns the endpoint to connect to when `part` is the first head.
    pub fn on_part(
        &mut self,
        part: RequestPart,
        forward: &mut Vec<RequestPart>,
    ) -> Result<Option<Endpoint>, HttpProxyError> {
        let mut connect_to = None;

        let part = match part {
            RequestPart::Head(mut head) => {
                let (host, port) = parse_and_rewrite(&mut head)?;
                if let Some((expected_host, expected_port)) = &self.target {
                    if self.check_endpoint_match
                        && (*expected_host != host || *expected_port != port)
                    {
                        return Err(HttpProxyError::EndpointMismatch {
                            expected: Endpoint::domain(expected_host.clone(), *expected_port)
                                .to_string(),
                            found: Endpoint::domain(host, port).to_string(),
                        });
                    }
                } else {
                    connect_to = Some(Endpoint::domain(host.clone(), port));
                    self.target = Some((host, port));
                    self.connecting = true;
                }
                RequestPart::Head(head)
            }
            other => other,
        };

        if self.connecting {
            self.backlog.add(part);
        } else {
            forward.push(part);
        }
        Ok(connect_to)
    }

    /// The upstream is ready: release everything held so far, in order.
    pub fn connected(&mut self, forward: &mut Vec<RequestPart>) {
        self.connecting = false;
        match self.backlog.flush(forward) {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }
}

/// Rewrite `head` in place and return the host and port it targets.
pub fn parse_and_rewrite(head: &mut RequestHead) -> Result<(String, u16), HttpProxyError> {
    let parsed = url::parse(&head.uri).ok_or(HttpProxyError::UrlInvalid)?;

    let (host, port) = match parsed.host {
        Some(host) => {
            let default_port = match parsed.scheme.as_deref() {
                Some("https") => HTTPS_PORT,
                _ => HTTP_PORT,
            };
            (host, parsed.port.unwrap_or(default_port))
        }
        None => {
            let value = head
                .headers
                .first("host")
                .ok_or(HttpProxyError::HostMissing)?;
            match value.split_once(':') {
                Some((host, port)) => (host.to_owned(), port.parse().unwrap_or(HTTP_PORT)),
                None => (value.to_owned(), HTTP_PORT),
            }
        }
    };
    if host.is_empty() {
        return Err(HttpProxyError::HostMissing);
    }

    head.uri = parsed.path.unwrap_or_else(|| "/".to_owned());

    if let Some(value) = head.headers.first("proxy-connection").map(str::to_owned) {
        head.headers.remove("proxy-connection");
        head.headers.add("Connection", value);
    }
    head.headers.remove("proxy-authorization");
    head.headers.remove("proxy-authenticate");

    Ok((host, port))
}

/// Client-side relay of a spliced HTTP proxy connection: keeps decoding,
/// rewriting and re-encoding requests after the upstream is attached.
#[derive(Debug)]
pub struct RewriteRelay {
    decoder: RequestDecoder,
    buf: BytesMut,
    rewriter: RequestRewriter,
    encoder: RequestEncoder,
    scratch: Vec<RequestPart>,
}

impl RewriteRelay {
    fn decode_buffered(&mut self) -> Result<(), ProxyError> {
        while let Some(part) = self.decoder.decode(&mut self.buf)? {
            self.rewriter.on_part(part, &mut self.scratch)?;
        }
        Ok(())
    }
}

impl Relay for RewriteRelay {
    fn relay(&mut self, input: Bytes, out: &mut Vec<Bytes>) -> Result<(), ProxyError> {
        self.buf.extend_from_slice(&input);
        let decoded = self.decode_buffered();

        // Requests completed before a failure are still forwarded.
        let mut encoded = BytesMut::new();
        for part in self.scratch.drain(..) {
            self.encoder.encode(part, &mut encoded);
        }
        if !encoded.is_empty() {
            out.push(encoded.freeze());
        }
        decoded
    }

    fn failure_reply(&self, error: &ProxyError) -> Option<Bytes> {
        error.is_framing().then(bad_request)
    }
}

/// Serves non-CONNECT proxy requests.
#[derive(Clone)]
pub struct HttpRewriteHandler {
    connector: Arc<dyn Connector>,
    splice: Splice,
    check_endpoint_match: bool,
}

impl HttpRewriteHandler {
    pub fn new(connector: Arc<dyn Connector>, splice: Splice, check_endpoint_match: bool) -> Self {
        Self {
            connector,
            splice,
            check_endpoint_match,
        }
    }

    /// Serve `client`, starting with the parts in `replay` and continuing
    /// with `decoder` over `buf`.
    ///
    /// Framing errors get a best-effort `400`. A failed connect closes the
    /// client without a reply.
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

        let mut rewriter = RequestRewriter::new(self.check_endpoint_match);
        let mut forward = Vec::new();
        let mut pending: Option<PendingConnect> = None;
        let mut client_open = true;

        let upstream = loop {
            loop {
                let part = match queued.pop_front() {
                    Some(part) => part,
                    None => match decoder.decode(&mut buf) {
                        Ok(Some(part)) => part,
                        Ok(None) => break,
                        Err(e) => return reject(&mut client, e.into()).await,
                    },
                };
                match rewriter.on_part(part, &mut forward) {
                    Ok(Some(endpoint)) => {
                        tracing::debug!(endpoint = %endpoint, "Proxy request upstream selected");
                        pending = Some(spawn_connect(&self.connector, &endpoint));
                    }
                    Ok(None) => {}
                    Err(e) => return reject(&mut client, e.into()).await,
                }
            }

            tokio::select! {
                biased;

                Some(result) = OptionFuture::from(pending.as_mut()) => break result?,

                read = client.read_buf(&mut buf), if client_open => {
                    if read? == 0 {
                        if pending.is_none() {
                            return Err(ProxyError::ClosedDuringHandshake);
                        }
                        client_open = false;
                    }
                }

                else => return Err(ProxyError::ClosedDuringHandshake),
            }
        };

        rewriter.connected(&mut forward);
        let mut encoder = RequestEncoder::new();
        let mut held = BytesMut::new();
        for part in forward.drain(..) {
            encoder.encode(part, &mut held);
        }
        let mut backlog = DataBacklog::new();
        if !held.is_empty() {
            backlog.add(held.freeze());
        }

        let relay = RewriteRelay {
            decoder,
            buf,
            rewriter,
            encoder,
            scratch: forward,
        };
        self.splice.run(client, upstream, relay, backlog).await
    }
}

async fn reject<C: Connection>(client: &mut C, error: ProxyError) -> Result<(), ProxyError> {
    let _ = client.write_all(&bad_request()).await;
    let _ = client.shutdown().await;
    Err(error)
}
