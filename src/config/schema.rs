//! Configuration schema definitions.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration.

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Limits shared by all listeners.
    pub listener: ListenerConfig,

    /// SOCKS5 front end.
    pub socks5: Socks5Config,

    /// HTTP proxy front end (CONNECT and absolute-form requests).
    pub http: HttpConfig,

    /// Outbound connection settings.
    pub connector: ConnectorConfig,

    /// Buffering between spliced connections.
    pub splice: SpliceConfig,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent client connections per listener.
    pub max_connections: usize,

    /// How long shutdown waits for open connections to finish.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            drain_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Socks5Config {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:1080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind_address: String,

    /// Reject pipelined requests that target a different host:port than
    /// the first request on the connection.
    pub check_endpoint_match: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8080".to_string(),
            check_endpoint_match: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Upper bound on a single outbound dial. `0` disables the limit.
    pub connect_timeout_secs: u64,

    /// Set `TCP_NODELAY` on outbound connections.
    pub nodelay: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SpliceConfig {
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,

    /// Queued bytes above which a side stops accepting writes.
    pub high_watermark: usize,

    /// Queued bytes at or below which a saturated side accepts writes again.
    pub low_watermark: usize,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 16 * 1024,
            high_watermark: 64 * 1024,
            low_watermark: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    pub log_level: String,

    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert!(config.socks5.enabled);
        assert_eq!(config.http.bind_address, "127.0.0.1:8080");
        assert_eq!(config.splice.high_watermark, 64 * 1024);
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [http]
            check_endpoint_match = false

            [splice]
            read_buffer_size = 4096
            "#,
        )
        .unwrap();

        assert!(!config.http.check_endpoint_match);
        assert_eq!(config.http.bind_address, "127.0.0.1:8080");
        assert_eq!(config.splice.read_buffer_size, 4096);
        assert_eq!(config.splice.low_watermark, 32 * 1024);
        assert_eq!(config.connector.connect_timeout_secs, 10);
    }
}
