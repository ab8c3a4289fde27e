//! Lenient request-target parser.
//!
//! Accepts `[[http|https]://]host[:port][/path]` where `host` is any run of
//! word characters, dots and dashes. Anything that does not fit that shape
//! is rejected outright.

use once_cell::sync::Lazy;
use regex::Regex;

static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:(https?)://)?([\w.-]+)(?::(\d+))?)?(/.*)?$")
        .expect("Can't compile regex")
});

/// Pieces of a request target. At least one field is always set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Lower-cased `http` or `https`.
    pub scheme: Option<String>,
    pub host: Option<String>,
    /// Absent when the port does not fit in a `u16`.
    pub port: Option<u16>,
    /// Everything from the first `/` after the authority.
    pub path: Option<String>,
}

pub fn parse(input: &str) -> Option<ParsedUrl> {
    let captures = URL.captures(input)?;
    let text = |i: usize| captures.get(i).map(|m| m.as_str());

    let parsed = ParsedUrl {
        scheme: text(1).map(str::to_ascii_lowercase),
        host: text(2).map(str::to_owned),
        port: text(3).and_then(|port| port.parse().ok()),
        path: text(4).map(str::to_owned),
    };

    let empty = parsed.scheme.is_none()
        && parsed.host.is_none()
        && text(3).is_none()
        && parsed.path.is_none();
    (!empty).then_some(parsed)
}
