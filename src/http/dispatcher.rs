//! Entry point for HTTP proxy connections.

use std::sync::Arc;

use bytes::BytesMut;
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::codec::{bad_request, RequestDecoder, RequestPart};
use super::connect::HttpConnectHandler;
use super::rewriter::HttpRewriteHandler;
use crate::connector::{Connection, Connector};
use crate::error::ProxyError;
use crate::pipeline::{DataBacklog, Splice};

const READ_BUFFER: usize = 8 * 1024;

/// Reads the first request head and hands the connection to the CONNECT
/// handler or the request rewriter.
#[derive(Clone)]
pub struct HttpProxyHandler {
    connect: HttpConnectHandler,
    rewrite: HttpRewriteHandler,
}

impl HttpProxyHandler {
    pub fn new(connector: Arc<dyn Connector>, splice: Splice, check_endpoint_match: bool) -> Self {
        Self {
            connect: HttpConnectHandler::new(Arc::clone(&connector), splice.clone()),
            rewrite: HttpRewriteHandler::new(connector, splice, check_endpoint_match),
        }
    }

    pub async fn serve<C: Connection>(&self, mut client: C) -> Result<(), ProxyError> {
        let mut buf = BytesMut::with_capacity(READ_BUFFER);
        let mut decoder = RequestDecoder::new();
        let mut backlog = DataBacklog::new();

        let is_connect = loop {
            match decoder.decode(&mut buf) {
                Ok(Some(part)) => {
                    let is_connect =
                        matches!(&part, RequestPart::Head(head) if head.method == Method::CONNECT);
                    backlog.add(part);
                    break is_connect;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = client.write_all(&bad_request()).await;
                    let _ = client.shutdown().await;
                    return Err(e.into());
                }
            }

            if client.read_buf(&mut buf).await? == 0 {
                return Err(ProxyError::ClosedDuringHandshake);
            }
        };

        if is_connect {
            self.connect.serve(client, buf, decoder, backlog).await
        } else {
            self.rewrite.serve(client, buf, decoder, backlog).await
        }
    }
}
