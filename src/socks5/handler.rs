//! SOCKS5 session: handshake, connect, splice.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::codec::{encode, ReplyStatus, Socks5Decoder, Socks5Request, Socks5Response};
use crate::connector::{Connection, Connector, Endpoint};
use crate::error::ProxyError;
use crate::pipeline::{spawn_connect, DataBacklog, Passthrough, Splice};

const HANDSHAKE_BUFFER: usize = 512;

/// Serves one SOCKS5 client connection at a time.
#[derive(Clone)]
pub struct Socks5Handler {
    connector: Arc<dyn Connector>,
    splice: Splice,
}

impl Socks5Handler {
    pub fn new(connector: Arc<dyn Connector>, splice: Splice) -> Self {
        Self { connector, splice }
    }

    /// Run the handshake on `client`, connect upstream and splice the two.
    ///
    /// A failed connect closes the client without a SOCKS5 failure reply.
    pub async fn serve<C: Connection>(&self, mut client: C) -> Result<(), ProxyError> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_BUFFER);
        let mut decoder = Socks5Decoder::new();
        let endpoint = negotiate(&mut client, &mut decoder, &mut buf).await?;
        tracing::debug!(endpoint = %endpoint, "SOCKS5 connect requested");

        // The decoder is done; anything read from here on is tunnel payload.
        let mut backlog = DataBacklog::new();
        let mut pending = spawn_connect(&self.connector, &endpoint);
        let mut client_open = true;

        let connected = loop {
            tokio::select! {
                biased;

                result = &mut pending => break result,

                read = client.read_buf(&mut buf), if client_open => {
                    if read? == 0 {
                        client_open = false;
                    } else {
                        backlog.add(buf.split().freeze());
                    }
                }
            }
        };

        let upstream = connected?;
        write_response(&mut client, Socks5Response::ConnectResult(ReplyStatus::Succeeded)).await?;
        tracing::debug!(endpoint = %endpoint, queued = backlog.len(), "SOCKS5 tunnel established");

        self.splice.run(client, upstream, Passthrough, backlog).await
    }
}

/// Drive `decoder` until the client's connect request arrives, answering
/// the method negotiation on the way.
pub(crate) async fn negotiate<C: Connection>(
    client: &mut C,
    decoder: &mut Socks5Decoder,
    buf: &mut BytesMut,
) -> Result<Endpoint, ProxyError> {
    loop {
        match decoder.decode(buf)? {
            Some(Socks5Request::MethodNegotiation) => {
                write_response(client, Socks5Response::MethodSelected).await?;
                continue;
            }
            Some(Socks5Request::ConnectTo(endpoint)) => return Ok(endpoint),
            None => {}
        }

        if client.read_buf(buf).await? == 0 {
            return Err(ProxyError::ClosedDuringHandshake);
        }
    }
}

pub(crate) async fn write_response<W>(writer: &mut W, response: Socks5Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(10);
    encode(response, &mut out);
    writer.write_all(&out).await?;
    writer.flush().await
}
