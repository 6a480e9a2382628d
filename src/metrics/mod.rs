//! Metrics module for Prometheus-based monitoring.
//!
//! Covers reward synthesis, training jobs, candidate success rates and
//! generator usage.
//!
//! ```ignore
//! use reward_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_success_rate(0.9);
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CANDIDATE_SUCCESS_RATE, JOBS_IN_PROGRESS, LLM_LATENCY, LLM_REQUESTS_TOTAL, REGISTRY,
    SYNTHESIS_ATTEMPTS_TOTAL, TRAINING_DURATION, TRAINING_JOBS_TOTAL,
};
