//! SOCKS5 front end.
//!
//! Only the CONNECT command with the "no authentication" method is
//! supported.
//!
//! # Data Flow
//! ```text
//! client bytes
//!     → Socks5Decoder: MethodNegotiation → reply [5, 0]
//!     → Socks5Decoder: ConnectTo(endpoint)
//!     → Connector (payload read meanwhile goes to a DataBacklog)
//!     → reply success, splice client ↔ upstream, replay backlog
//! ```

pub mod address_only;
pub mod codec;
pub mod handler;

pub use codec::{
    encode, ReplyStatus, Socks5Decoder, Socks5Error, Socks5Request, Socks5Response,
};
pub use handler::Socks5Handler;
