//! HTTP/1 request framing.
//!
//! [`RequestDecoder`] splits a client byte stream into request parts and
//! [`RequestEncoder`] writes them back out. The decoder works on a buffer
//! owned by the caller, so whatever it has not consumed is still there when
//! the caller stops decoding (after a CONNECT, for instance).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Method, StatusCode, Version};

use super::HttpProxyError;

const MAX_HEADERS: usize = 64;
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// Header list that keeps insertion order and the client's name casing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First value for `name`, compared case-insensitively.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first(name).is_some()
    }

    /// Append a header after all existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every header called `name`. Returns whether any was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// Request line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
            .filter_map(|(_, v)| v.rsplit(',').next())
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    pub fn content_length(&self) -> Result<Option<u64>, HttpProxyError> {
        self.headers
            .first("content-length")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| HttpProxyError::InvalidContentLength)
            })
            .transpose()
    }
}

/// One decoded piece of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    Head(RequestHead),
    Body(Bytes),
    /// End of the request, carrying the trailer fields of a chunked body.
    End(Option<Headers>),
}

impl RequestPart {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestPart::Head(_) => "request head",
            RequestPart::Body(_) => "request body",
            RequestPart::End(_) => "request end",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    /// Head without a body; `End` still has to be emitted.
    EndPending,
    FixedBody { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataCrlf,
    Trailers,
}

/// Incremental HTTP/1 request decoder.
///
/// Requests on a connection follow one another; after a request's `End`
/// the decoder expects the next head.
#[derive(Debug)]
pub struct RequestDecoder {
    state: DecodeState,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
        }
    }

    /// Whether the decoder sits between requests.
    pub fn at_message_boundary(&self) -> bool {
        self.state == DecodeState::Head
    }

    /// Decode the next part from the front of `buf`, or `Ok(None)` if more
    /// input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestPart>, HttpProxyError> {
        loop {
            match self.state {
                DecodeState::Head => return self.decode_head(buf),

                DecodeState::EndPending => {
                    self.state = DecodeState::Head;
                    return Ok(Some(RequestPart::End(None)));
                }

                DecodeState::FixedBody { remaining } => {
                    let Some(chunk) = take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::EndPending
                    } else {
                        DecodeState::FixedBody { remaining: left }
                    };
                    return Ok(Some(RequestPart::Body(chunk)));
                }

                DecodeState::ChunkSize => {
                    match httparse::parse_chunk_size(&buf[..]) {
                        Ok(httparse::Status::Complete((consumed, size))) => {
                            buf.advance(consumed);
                            self.state = if size == 0 {
                                DecodeState::Trailers
                            } else {
                                DecodeState::ChunkData { remaining: size }
                            };
                        }
                        Ok(httparse::Status::Partial) if buf.len() > MAX_CHUNK_LINE => {
                            return Err(HttpProxyError::InvalidChunk);
                        }
                        Ok(httparse::Status::Partial) => return Ok(None),
                        Err(_) => return Err(HttpProxyError::InvalidChunk),
                    }
                }

                DecodeState::ChunkData { remaining } => {
                    let Some(chunk) = take_body(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::ChunkDataCrlf
                    } else {
                        DecodeState::ChunkData { remaining: left }
                    };
                    return Ok(Some(RequestPart::Body(chunk)));
                }

                DecodeState::ChunkDataCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(HttpProxyError::InvalidChunk);
                    }
                    buf.advance(2);
                    self.state = DecodeState::ChunkSize;
                }

                DecodeState::Trailers => return self.decode_trailers(buf),
            }
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<RequestPart>, HttpProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(&buf[..])? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial if buf.len() > MAX_HEAD_SIZE => {
                return Err(HttpProxyError::HeadTooLarge(MAX_HEAD_SIZE));
            }
            httparse::Status::Partial => return Ok(None),
        };

        let method = req
            .method
            .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            .ok_or(HttpProxyError::InvalidMethod)?;
        let uri = req.path.unwrap_or_default().to_owned();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        let headers = owned_headers(req.headers)?;

        let head = RequestHead {
            method,
            uri,
            version,
            headers,
        };
        buf.advance(head_len);

        self.state = if head.is_chunked() {
            DecodeState::ChunkSize
        } else {
            match head.content_length()? {
                Some(len) if len > 0 => DecodeState::FixedBody { remaining: len },
                _ => DecodeState::EndPending,
            }
        };

        Ok(Some(RequestPart::Head(head)))
    }

    /// Trailer section of a chunked body, up to and including the blank line.
    fn decode_trailers(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<RequestPart>, HttpProxyError> {
        let mut fields = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (consumed, trailers) = match httparse::parse_headers(&buf[..], &mut fields)? {
            httparse::Status::Complete((consumed, parsed)) => (consumed, owned_headers(parsed)?),
            httparse::Status::Partial if buf.len() > MAX_HEAD_SIZE => {
                return Err(HttpProxyError::HeadTooLarge(MAX_HEAD_SIZE));
            }
            httparse::Status::Partial => return Ok(None),
        };
        buf.advance(consumed);

        self.state = DecodeState::Head;
        let trailers = (!trailers.is_empty()).then_some(trailers);
        Ok(Some(RequestPart::End(trailers)))
    }
}

fn owned_headers(parsed: &[httparse::Header<'_>]) -> Result<Headers, HttpProxyError> {
    parsed
        .iter()
        .map(|h| {
            std::str::from_utf8(h.value)
                .map(|v| (h.name.to_owned(), v.to_owned()))
                .map_err(|_| HttpProxyError::InvalidHeader)
        })
        .collect()
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn take_body(buf: &mut BytesMut, remaining: u64) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }
    let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
    Some(buf.split_to(n).freeze())
}

/// Writes request parts back to bytes, re-chunking bodies of chunked requests.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    chunked: bool,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, part: RequestPart, out: &mut BytesMut) {
        match part {
            RequestPart::Head(head) => {
                out.put_slice(head.method.as_str().as_bytes());
                out.put_u8(b' ');
                out.put_slice(head.uri.as_bytes());
                out.put_u8(b' ');
                out.put_slice(version_str(head.version).as_bytes());
                out.put_slice(b"\r\n");
                put_headers(head.headers.iter(), out);
                self.chunked = head.is_chunked();
            }
            RequestPart::Body(body) if self.chunked => {
                if !body.is_empty() {
                    out.put_slice(format!("{:x}\r\n", body.len()).as_bytes());
                    out.put_slice(&body);
                    out.put_slice(b"\r\n");
                }
            }
            RequestPart::Body(body) => out.put_slice(&body),
            RequestPart::End(trailers) => {
                if self.chunked {
                    out.put_slice(b"0\r\n");
                    match trailers {
                        Some(trailers) => put_headers(trailers.iter(), out),
                        None => out.put_slice(b"\r\n"),
                    }
                }
                self.chunked = false;
            }
        }
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn put_headers<'a>(headers: impl Iterator<Item = (&'a str, &'a str)>, out: &mut BytesMut) {
    for (name, value) in headers {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}

/// Write an HTTP/1.1 response head with no body.
pub fn encode_response(status: StatusCode, headers: &[(&str, &str)], out: &mut BytesMut) {
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(status.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.put_slice(b"\r\n");
    put_headers(headers.iter().copied(), out);
}

/// `200 OK` sent once a CONNECT tunnel is up.
pub fn connect_established() -> Bytes {
    let mut out = BytesMut::with_capacity(64);
    encode_response(StatusCode::OK, &[("Content-Length", "0")], &mut out);
    out.freeze()
}

/// `400 Bad Request` sent before closing a connection we cannot serve.
pub fn bad_request() -> Bytes {
    let mut out = BytesMut::with_capacity(96);
    encode_response(
        StatusCode::BAD_REQUEST,
        &[("Content-Length", "0"), ("Connection", "close")],
        &mut out,
    );
    out.freeze()
}
