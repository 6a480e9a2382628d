//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by reward-forge and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all reward-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Synthesis attempts, labeled by outcome (accepted, no_function, syntax, smoke_test).
pub static SYNTHESIS_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Finished training jobs, labeled by environment and status.
pub static TRAINING_JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Training job duration in seconds, labeled by environment.
pub static TRAINING_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of training jobs currently running.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Distribution of evaluated candidate success rates.
pub static CANDIDATE_SUCCESS_RATE: OnceLock<Histogram> = OnceLock::new();

/// Total generator requests, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generator request latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls are harmless: the statics keep the
/// first set of metrics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let synthesis_attempts = CounterVec::new(
        Opts::new(
            "reward_forge_synthesis_attempts_total",
            "Reward function synthesis attempts",
        ),
        &["outcome"],
    )?;

    let training_jobs = CounterVec::new(
        Opts::new("reward_forge_training_jobs_total", "Finished training jobs"),
        &["env", "status"],
    )?;

    let training_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "reward_forge_training_duration_seconds",
            "Training job duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
        &["env"],
    )?;

    let jobs_in_progress = Gauge::new(
        "reward_forge_jobs_in_progress",
        "Number of training jobs currently running",
    )?;

    let success_rate = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "reward_forge_candidate_success_rate",
            "Distribution of evaluated candidate success rates",
        )
        .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("reward_forge_llm_requests_total", "Total generator requests"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "reward_forge_llm_latency_seconds",
            "Generator request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 120.0]),
        &["model"],
    )?;

    registry.register(Box::new(synthesis_attempts.clone()))?;
    registry.register(Box::new(training_jobs.clone()))?;
    registry.register(Box::new(training_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(success_rate.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = SYNTHESIS_ATTEMPTS_TOTAL.set(synthesis_attempts);
    let _ = TRAINING_JOBS_TOTAL.set(training_jobs);
    let _ = TRAINING_DURATION.set(training_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = CANDIDATE_SUCCESS_RATE.set(success_rate);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
