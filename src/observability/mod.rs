//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection and message sessions produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (fmt layer, filtered by RUST_LOG or the configured level)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every connection task runs inside a span carrying its id and peer
//! - Metrics are cheap and are no-ops until an exporter is installed

pub mod logging;
pub mod metrics;
