//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    CANDIDATE_SUCCESS_RATE, JOBS_IN_PROGRESS, LLM_LATENCY, LLM_REQUESTS_TOTAL,
    SYNTHESIS_ATTEMPTS_TOTAL, TRAINING_DURATION, TRAINING_JOBS_TOTAL,
};

/// Metrics collector for recording reward-forge operational metrics.
///
/// Every method is a no-op until `init_metrics()` has been called, so
/// library code can record unconditionally.
///
/// ```ignore
/// use reward_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_training_job("CartPole-v1", "success", 12.5);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one synthesis attempt.
    ///
    /// `outcome` is `accepted` or the kind of validation failure.
    pub fn record_synthesis_attempt(&self, outcome: &str) {
        if let Some(attempts) = SYNTHESIS_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded synthesis attempt metric");
    }

    /// Record a finished training job.
    ///
    /// # Arguments
    ///
    /// * `env` - Environment identifier
    /// * `status` - `success` or `failure`
    /// * `duration_secs` - Wall-clock duration of the job
    pub fn record_training_job(&self, env: &str, status: &str, duration_secs: f64) {
        if let Some(jobs) = TRAINING_JOBS_TOTAL.get() {
            jobs.with_label_values(&[env, status]).inc();
        }

        if let Some(duration) = TRAINING_DURATION.get() {
            duration.with_label_values(&[env]).observe(duration_secs);
        }

        tracing::trace!(
            env = env,
            status = status,
            duration_secs = duration_secs,
            "Recorded training job metric"
        );
    }

    pub fn record_success_rate(&self, rate: f64) {
        if let Some(histogram) = CANDIDATE_SUCCESS_RATE.get() {
            histogram.observe(rate);
        }
    }

    /// Record a generator request.
    pub fn record_llm_request(&self, model: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(requests) = LLM_REQUESTS_TOTAL.get() {
            requests.with_label_values(&[model, status]).inc();
        }

        if let Some(latency) = LLM_LATENCY.get() {
            latency.with_label_values(&[model]).observe(latency_secs);
        }

        tracing::trace!(
            model = model,
            status = status,
            latency_secs = latency_secs,
            "Recorded LLM request metric"
        );
    }

    pub fn update_jobs_in_progress(&self, count: usize) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.set(count as f64);
        }

        tracing::trace!(count = count, "Updated jobs in progress metric");
    }
}
