//! SOCKS5 wire format: an incremental request decoder and a stateless
//! reply encoder.
//!
//! The decoder is sans-IO. It is handed the connection's read buffer and
//! only consumes bytes once a whole message is present, so a message split
//! across any number of reads is re-evaluated from its first byte each time.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::connector::Endpoint;

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Version, command, reserved, address type.
const CONNECT_HEADER_LEN: usize = 4;
const PORT_LEN: usize = 2;

/// Framing errors. Each one is fatal for the connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version")]
    UnsupportedVersion,
    #[error("no authentication method specified")]
    NoAuthMethodSpecified,
    #[error("more method bytes than announced")]
    TooManyMethods,
    #[error("client does not offer the no-authentication method")]
    NoSupportedMethod,
    #[error("only the CONNECT command is supported")]
    UnsupportedCommand,
    #[error("SOCKS protocol error")]
    ProtocolError,
    #[error("domain length must be non-zero")]
    InvalidDomainLength,
    #[error("invalid address type")]
    InvalidAddressType,
}

/// One decoded protocol step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Request {
    MethodNegotiation,
    ConnectTo(Endpoint),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Response {
    MethodSelected,
    ConnectResult(ReplyStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ReadingMethods,
    ReadingConnectRequest,
    Done,
}

/// Incremental decoder for the client side of a SOCKS5 handshake.
#[derive(Debug)]
pub struct Socks5Decoder {
    phase: Phase,
}

impl Socks5Decoder {
    pub fn new() -> Self {
        Self {
            phase: Phase::ReadingMethods,
        }
    }

    /// Whether the connect request has been decoded.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Try to decode the next request from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `buf` is left
    /// untouched in that case. On success the message's bytes are consumed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Socks5Request>, Socks5Error> {
        match self.phase {
            Phase::ReadingMethods => self.decode_methods(buf),
            Phase::ReadingConnectRequest => self.decode_connect(buf),
            Phase::Done if buf.is_empty() => Ok(None),
            Phase::Done => Err(Socks5Error::ProtocolError),
        }
    }

    fn decode_methods(&mut self, buf: &mut BytesMut) -> Result<Option<Socks5Request>, Socks5Error> {
        if buf.len() < 3 {
            return Ok(None);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(Socks5Error::UnsupportedVersion);
        }

        let count = buf[1] as usize;
        if count == 0 {
            return Err(Socks5Error::NoAuthMethodSpecified);
        }

        let available = buf.len() - 2;
        if available > count {
            return Err(Socks5Error::TooManyMethods);
        }
        if available < count {
            return Ok(None);
        }

        if !buf[2..].contains(&METHOD_NO_AUTH) {
            return Err(Socks5Error::NoSupportedMethod);
        }

        buf.advance(2 + count);
        self.phase = Phase::ReadingConnectRequest;
        Ok(Some(Socks5Request::MethodNegotiation))
    }

    fn decode_connect(&mut self, buf: &mut BytesMut) -> Result<Option<Socks5Request>, Socks5Error> {
        if buf.len() <= 6 {
            return Ok(None);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(Socks5Error::UnsupportedVersion);
        }
        if buf[1] != CMD_CONNECT {
            return Err(Socks5Error::UnsupportedCommand);
        }
        if buf[2] != 0 {
            return Err(Socks5Error::ProtocolError);
        }

        let body = &buf[CONNECT_HEADER_LEN..];
        let (endpoint, consumed) = match buf[3] {
            ATYP_IPV4 => {
                let Some(body) = exact(body, 4 + PORT_LEN)? else {
                    return Ok(None);
                };
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                (Endpoint::Resolved(SocketAddr::new(ip.into(), port)), 4 + PORT_LEN)
            }
            ATYP_IPV6 => {
                let Some(body) = exact(body, 16 + PORT_LEN)? else {
                    return Ok(None);
                };
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                let ip = Ipv6Addr::from(octets);
                (Endpoint::Resolved(SocketAddr::new(ip.into(), port)), 16 + PORT_LEN)
            }
            ATYP_DOMAIN => {
                let len = body[0] as usize;
                if len == 0 {
                    return Err(Socks5Error::InvalidDomainLength);
                }
                let Some(rest) = exact(&body[1..], len + PORT_LEN)? else {
                    return Ok(None);
                };
                let host = std::str::from_utf8(&rest[..len])
                    .map_err(|_| Socks5Error::ProtocolError)?
                    .to_owned();
                let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
                (Endpoint::domain(host, port), 1 + len + PORT_LEN)
            }
            _ => return Err(Socks5Error::InvalidAddressType),
        };

        buf.advance(CONNECT_HEADER_LEN + consumed);
        self.phase = Phase::Done;
        Ok(Some(Socks5Request::ConnectTo(endpoint)))
    }
}

impl Default for Socks5Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// `body` must be exactly `len` bytes: shorter waits for more input, longer
/// cannot be a single connect request.
fn exact(body: &[u8], len: usize) -> Result<Option<&[u8]>, Socks5Error> {
    match body.len() {
        n if n < len => Ok(None),
        n if n > len => Err(Socks5Error::ProtocolError),
        _ => Ok(Some(body)),
    }
}

/// Append the wire form of `response` to `out`.
///
/// The bound address in connect replies is always `0.0.0.0:0`, and every
/// non-success status is sent as a general failure.
pub fn encode(response: Socks5Response, out: &mut BytesMut) {
    match response {
        Socks5Response::MethodSelected => {
            out.put_slice(&[SOCKS_VERSION, METHOD_NO_AUTH]);
        }
        Socks5Response::ConnectResult(status) => {
            let code = match status {
                ReplyStatus::Succeeded => 0,
                _ => 1,
            };
            out.put_slice(&[SOCKS_VERSION, code, 0, ATYP_IPV4]);
            out.put_slice(&[0; 4 + PORT_LEN]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `input` one byte at a time, collecting every decoded request.
    fn drip(decoder: &mut Socks5Decoder, input: &[u8]) -> Result<Vec<Socks5Request>, Socks5Error> {
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in input {
            buf.put_u8(*byte);
            while let Some(request) = decoder.decode(&mut buf)? {
                out.push(request);
            }
        }
        Ok(out)
    }

    fn negotiated() -> Socks5Decoder {
        let mut decoder = Socks5Decoder::new();
        assert_eq!(
            drip(&mut decoder, &[5, 1, 0]).unwrap(),
            vec![Socks5Request::MethodNegotiation]
        );
        decoder
    }

    #[test]
    fn greeting_dripped_yields_one_negotiation() {
        let mut decoder = Socks5Decoder::new();
        let requests = drip(&mut decoder, &[5, 3, 2, 0, 1]).unwrap();
        assert_eq!(requests, vec![Socks5Request::MethodNegotiation]);
        assert!(!decoder.is_done());
    }

    #[test]
    fn greeting_without_no_auth_is_rejected() {
        for method in 1..10u8 {
            let mut decoder = Socks5Decoder::new();
            assert_eq!(
                drip(&mut decoder, &[5, 1, method]),
                Err(Socks5Error::NoSupportedMethod)
            );
        }

        let mut decoder = Socks5Decoder::new();
        assert_eq!(
            drip(&mut decoder, &[5, 4, 9, 0, 3, 7]).unwrap(),
            vec![Socks5Request::MethodNegotiation]
        );
    }

    #[test]
    fn greeting_framing_errors() {
        let mut buf = BytesMut::from(&[4u8, 1, 0][..]);
        assert_eq!(
            Socks5Decoder::new().decode(&mut buf),
            Err(Socks5Error::UnsupportedVersion)
        );

        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert_eq!(
            Socks5Decoder::new().decode(&mut buf),
            Err(Socks5Error::NoAuthMethodSpecified)
        );

        let mut buf = BytesMut::from(&[5u8, 1, 0, 0][..]);
        assert_eq!(
            Socks5Decoder::new().decode(&mut buf),
            Err(Socks5Error::TooManyMethods)
        );
    }

    #[test]
    fn partial_input_is_not_consumed() {
        let mut decoder = Socks5Decoder::new();
        let mut buf = BytesMut::from(&[5u8, 2, 0][..]);
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        assert_eq!(&buf[..], &[5, 2, 0]);
    }

    #[test]
    fn connect_ipv4_dripped() {
        let mut decoder = negotiated();
        let requests = drip(&mut decoder, &[5, 1, 0, 1, 192, 168, 1, 20, 0x1f, 0x90]).unwrap();
        let addr: SocketAddr = "192.168.1.20:8080".parse().unwrap();
        assert_eq!(requests, vec![Socks5Request::ConnectTo(Endpoint::Resolved(addr))]);
        assert!(decoder.is_done());
    }

    #[test]
    fn connect_ipv6_dripped() {
        let ip: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let mut input = vec![5, 1, 0, 4];
        input.extend_from_slice(&ip.octets());
        input.extend_from_slice(&443u16.to_be_bytes());

        let mut decoder = negotiated();
        let requests = drip(&mut decoder, &input).unwrap();
        assert_eq!(
            requests,
            vec![Socks5Request::ConnectTo(Endpoint::Resolved(SocketAddr::new(ip.into(), 443)))]
        );
    }

    #[test]
    fn connect_domain_dripped() {
        for (host, port) in [("localhost", 80u16), ("google.com", 443)] {
            let mut input = vec![5, 1, 0, 3, host.len() as u8];
            input.extend_from_slice(host.as_bytes());
            input.extend_from_slice(&port.to_be_bytes());

            let mut decoder = negotiated();
            let requests = drip(&mut decoder, &input).unwrap();
            assert_eq!(
                requests,
                vec![Socks5Request::ConnectTo(Endpoint::domain(host, port))]
            );
        }
    }

    #[test]
    fn connect_request_framing_errors() {
        let cases: [(&[u8], Socks5Error); 6] = [
            (&[4, 1, 0, 1, 1, 2, 3, 4, 0, 80], Socks5Error::UnsupportedVersion),
            (&[5, 2, 0, 1, 1, 2, 3, 4, 0, 80], Socks5Error::UnsupportedCommand),
            (&[5, 1, 1, 1, 1, 2, 3, 4, 0, 80], Socks5Error::ProtocolError),
            (&[5, 1, 0, 3, 0, 0, 80], Socks5Error::InvalidDomainLength),
            (&[5, 1, 0, 2, 1, 2, 3, 4, 0, 80], Socks5Error::InvalidAddressType),
            (&[5, 1, 0, 3, 1, b'a', 0, 80, 9], Socks5Error::ProtocolError),
        ];

        for (input, expected) in cases {
            let mut decoder = negotiated();
            let mut buf = BytesMut::from(input);
            assert_eq!(decoder.decode(&mut buf), Err(expected), "input {:?}", input);
        }
    }

    #[test]
    fn bytes_after_connect_request_are_a_protocol_error() {
        let mut decoder = negotiated();
        drip(&mut decoder, &[5, 1, 0, 1, 127, 0, 0, 1, 0, 80]).unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(decoder.decode(&mut buf), Ok(None));
        buf.put_u8(0);
        assert_eq!(decoder.decode(&mut buf), Err(Socks5Error::ProtocolError));
    }

    #[test]
    fn encoder_output() {
        let mut out = BytesMut::new();
        encode(Socks5Response::MethodSelected, &mut out);
        assert_eq!(&out[..], &[5, 0]);

        let mut out = BytesMut::new();
        encode(Socks5Response::ConnectResult(ReplyStatus::Succeeded), &mut out);
        assert_eq!(&out[..], &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        for status in [
            ReplyStatus::GeneralFailure,
            ReplyStatus::ConnectionRefused,
            ReplyStatus::AddressTypeNotSupported,
        ] {
            let mut out = BytesMut::new();
            encode(Socks5Response::ConnectResult(status), &mut out);
            assert_eq!(&out[..], &[5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);
        }
    }
}
