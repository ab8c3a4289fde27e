//! lit-proxy: SOCKS5 and HTTP proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!   SOCKS5 client ──▶ net::Listener ──▶ socks5::Socks5Handler ──┐
//!                                                               ├─▶ Connector ──▶ target
//!   HTTP client ────▶ net::Listener ──▶ http::HttpProxyHandler ─┘
//!                                          ├─ CONNECT: 200, raw tunnel
//!                                          └─ absolute-form: rewrite per request
//!
//!   client ◀════════ pipeline::Splice (watermark backpressure) ════════▶ target
//! ```

use std::path::PathBuf;

use clap::Parser;

use lit_proxy::config::{load_config, validate_config, ConfigError, ProxyConfig};
use lit_proxy::lifecycle::startup;

#[derive(Parser)]
#[command(name = "lit-proxy")]
#[command(about = "SOCKS5 and HTTP proxy", long_about = None)]
struct Cli {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the SOCKS5 bind address.
    #[arg(long)]
    socks5: Option<String>,

    /// Override the HTTP proxy bind address.
    #[arg(long)]
    http: Option<String>,

    /// Override the log level.
    #[arg(short, long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(addr) = &self.socks5 {
            config.socks5.enabled = true;
            config.socks5.bind_address = addr.clone();
        }
        if let Some(addr) = &self.http {
            config.http.enabled = true;
            config.http.bind_address = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;

    startup::run(config).await
}
