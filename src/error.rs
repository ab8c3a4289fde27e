//! Connection-level error type.

use std::io;

use thiserror::Error;

use crate::connector::Endpoint;
use crate::http::HttpProxyError;
use crate::socks5::Socks5Error;

/// Why a proxied connection ended abnormally.
///
/// Every variant is fatal for the connection it was raised on; nothing is
/// retried here.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("SOCKS5 framing error: {0}")]
    Socks5(#[from] Socks5Error),

    #[error("HTTP proxy error: {0}")]
    Http(#[from] HttpProxyError),

    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("connect to {0} was abandoned before completing")]
    ConnectAbandoned(Endpoint),

    #[error("client closed the connection before the handshake completed")]
    ClosedDuringHandshake,

    #[error("unexpected {frame} while {state}")]
    UnexpectedFrame {
        frame: &'static str,
        state: &'static str,
    },

    #[error("splice task failed: {0}")]
    Splice(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// The byte stream can no longer be trusted to be framed correctly.
    pub fn is_framing(&self) -> bool {
        matches!(self, ProxyError::Socks5(_) | ProxyError::Http(_))
    }

    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Connect { .. } | ProxyError::ConnectAbandoned(_)
        )
    }
}
