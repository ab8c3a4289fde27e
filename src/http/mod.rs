//! HTTP proxy front end.
//!
//! # Data Flow
//! ```text
//! client bytes
//!     → codec.rs (RequestDecoder: Head / Body / End)
//!     → dispatcher.rs (first head decides)
//!         ├─ CONNECT → connect.rs (200, then raw tunnel)
//!         └─ other   → rewriter.rs (origin-form requests re-encoded upstream)
//!     → pipeline::Splice
//! ```
//!
//! # Design Decisions
//! - Absolute-form URIs go through a tolerant parser (url.rs), not a strict
//!   URI grammar
//! - Header order and name casing are preserved end to end

pub mod codec;
pub mod connect;
pub mod dispatcher;
pub mod rewriter;
pub mod url;

use thiserror::Error;

pub use codec::{Headers, RequestDecoder, RequestEncoder, RequestHead, RequestPart};
pub use connect::HttpConnectHandler;
pub use dispatcher::HttpProxyHandler;
pub use rewriter::{HttpRewriteHandler, RequestRewriter, RewriteRelay};

/// HTTP-side framing and rewrite errors. Fatal for the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpProxyError {
    #[error("request target is not a valid URL")]
    UrlInvalid,

    #[error("request names no host")]
    HostMissing,

    #[error("request for {found} on a connection bound to {expected}")]
    EndpointMismatch { expected: String, found: String },

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("invalid chunked body framing")]
    InvalidChunk,

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("header value is not valid UTF-8")]
    InvalidHeader,

    #[error("unsupported request method")]
    InvalidMethod,

    #[error("invalid CONNECT target {0:?}")]
    InvalidConnectTarget(String),
}
