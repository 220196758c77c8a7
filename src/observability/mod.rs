//! Structured logging, counters, and readiness reasons.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthReport, PipelineHealth};
pub use logging::{JsonLineLogger, LogEntry, LogFile, LogLevel, LogRotationPolicy, Logger, LoggingError};
pub use metrics::{scrape_metric_names, PipelineMetrics};
