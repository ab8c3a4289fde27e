//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! front ends, splice, listeners
//!     → logging.rs (tracing events, one span per connection)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape (optional)
//! ```

pub mod logging;
pub mod metrics;
