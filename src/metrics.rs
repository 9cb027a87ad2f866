//! Pool gauge publishing.
//!
//! The pool reports three gauges on every acquire, release, and enqueue
//! event. Publishing is fire-and-forget: a sink failure is logged and
//! swallowed so observability can never take down query execution.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Open connections currently owned by the pool.
pub const GAUGE_POOL_TOTAL: &str = "db.pool.total";
/// Connections checked out and not yet returned.
pub const GAUGE_POOL_USED: &str = "db.pool.used";
/// Callers blocked waiting for a connection to become free.
pub const GAUGE_POOL_WAITING: &str = "db.pool.waiting";

/// Measurement unit attached to a published metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Seconds,
    Milliseconds,
    Count,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Unit::Seconds => "Seconds",
            Unit::Milliseconds => "Milliseconds",
            Unit::Count => "Count",
        };
        write!(f, "{name}")
    }
}

/// Error raised by a metrics sink. Never propagated past the pool.
#[derive(Error, Debug)]
#[error("Metrics sink failure: {message}")]
pub struct MetricsError {
    message: String,
}

impl MetricsError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Destination for pool gauges.
///
/// Implementations must not block; hand the value to a channel or an
/// in-memory aggregator and return.
pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &str, value: f64, unit: Unit) -> Result<(), MetricsError>;
}

/// Sink that writes every gauge to the log stream at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn gauge(&self, name: &str, value: f64, unit: Unit) -> Result<(), MetricsError> {
        debug!(metric = name, value, unit = %unit, "Gauge published");
        Ok(())
    }
}

/// Sink that discards every gauge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn gauge(&self, _name: &str, _value: f64, _unit: Unit) -> Result<(), MetricsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_display() {
        assert_eq!(Unit::Seconds.to_string(), "Seconds");
        assert_eq!(Unit::Milliseconds.to_string(), "Milliseconds");
        assert_eq!(Unit::Count.to_string(), "Count");
    }

    #[test]
    fn test_metrics_error_display() {
        let err = MetricsError::new("agent unreachable");
        assert!(err.to_string().contains("agent unreachable"));
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let sink = NullSink;
        assert!(sink.gauge(GAUGE_POOL_TOTAL, 10.0, Unit::Count).is_ok());
        assert!(sink.gauge(GAUGE_POOL_WAITING, 0.0, Unit::Count).is_ok());
    }

    #[test]
    fn test_log_sink_accepts_everything() {
        let sink = LogSink;
        assert!(sink.gauge(GAUGE_POOL_USED, 3.0, Unit::Count).is_ok());
    }
}
