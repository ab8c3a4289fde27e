//! SOCKS5 front end that only extracts the destination.
//!
//! The handshake is answered locally, including an immediate success reply.
//! Instead of dialing, the handler emits the destination followed by the
//! client's payload as [`ProxyRequest`] items, so another framed protocol
//! can carry the tunnel.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::codec::{ReplyStatus, Socks5Decoder, Socks5Response};
use super::handler::{negotiate, write_response};
use crate::connector::{Connection, ProxyRequest};
use crate::error::ProxyError;

const READ_BUFFER: usize = 8 * 1024;

/// Serve `client`, forwarding its requests into `requests` and writing
/// everything received on `responses` back to it.
///
/// Client EOF closes `requests`; a closed `responses` channel half-closes
/// the client. The session ends once both directions are done.
pub async fn serve<C: Connection>(
    mut client: C,
    requests: mpsc::Sender<ProxyRequest<Bytes>>,
    mut responses: mpsc::Receiver<Bytes>,
) -> Result<(), ProxyError> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    let mut decoder = Socks5Decoder::new();
    let endpoint = negotiate(&mut client, &mut decoder, &mut buf).await?;

    write_response(&mut client, Socks5Response::ConnectResult(ReplyStatus::Succeeded)).await?;
    tracing::debug!(endpoint = %endpoint, "SOCKS5 destination extracted");

    if requests.send(ProxyRequest::Endpoint(endpoint)).await.is_err() {
        return Ok(());
    }

    let mut requests = Some(requests);
    let (mut reader, mut writer) = tokio::io::split(client);
    let mut write_open = true;

    while requests.is_some() || write_open {
        buf.reserve(READ_BUFFER);

        tokio::select! {
            read = reader.read_buf(&mut buf), if requests.is_some() => {
                if read? == 0 {
                    requests = None;
                    continue;
                }
                let frame = ProxyRequest::Data(buf.split().freeze());
                if let Some(tx) = &requests {
                    if tx.send(frame).await.is_err() {
                        requests = None;
                    }
                }
            }

            response = responses.recv(), if write_open => match response {
                Some(bytes) => {
                    writer.write_all(&bytes).await?;
                    writer.flush().await?;
                }
                None => {
                    write_open = false;
                    writer.shutdown().await?;
                }
            },
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Endpoint;
    use tokio::io::duplex;

    #[tokio::test]
    async fn emits_endpoint_then_payload() {
        let (mut client, served) = duplex(1024);
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let (resp_tx, resp_rx) = mpsc::channel(8);
        let task = tokio::spawn(serve(served, req_tx, resp_rx));

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client
            .write_all(&[5, 1, 0, 3, 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x1f, 0x90])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        assert_eq!(
            req_rx.recv().await,
            Some(ProxyRequest::Endpoint(Endpoint::domain("example", 8080)))
        );

        client.write_all(b"ping").await.unwrap();
        assert_eq!(
            req_rx.recv().await,
            Some(ProxyRequest::Data(Bytes::from_static(b"ping")))
        );

        resp_tx.send(Bytes::from_static(b"pong")).await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        client.shutdown().await.unwrap();
        assert_eq!(req_rx.recv().await, None);

        drop(resp_tx);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap().unwrap();
    }
}
