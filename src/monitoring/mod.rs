//! Monitoring Module
//!
//! Provides observability for plughost:
//! - Runtime metrics
//! - Structured logging

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LogFormat, LoggerConfig};
pub use metrics::{Counter, Gauge, Histogram, MetricsSnapshot, RuntimeMetrics};
