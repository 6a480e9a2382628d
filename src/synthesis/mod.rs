//! Turning generator text into a validated reward function.
//!
//! A completion goes through four checks before it becomes a candidate:
//! code extraction, the `def ` marker, compilation against the
//! [`NumericSurface`], and a one-step smoke test on a throwaway environment.
//! [`CodeSynthesizer::synthesize`] re-prompts the generator with the error
//! text when a check fails, for at most `max_attempts` completions.

use std::sync::Arc;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::env::TaskAdapter;
use crate::error::SynthesisError;
use crate::llm::ChatSession;
use crate::metrics::MetricsCollector;
use crate::prompts::build_repair_prompt;
use crate::sandbox::{NumericSurface, RewardFunction};
use crate::training::RewardEnvAdapter;

/// Default number of completions tried per reward function.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A reward function that passed validation, with the exact source it was
/// compiled from.
#[derive(Debug, Clone)]
pub struct SynthesizedReward {
    pub function: Arc<RewardFunction>,
    pub source: String,
}

/// Returns the body of the first fenced code block, or the whole text.
///
/// The language tag after the opening fence is dropped and an unterminated
/// fence runs to the end of the text.
pub fn extract_code(text: &str) -> String {
    let fenced = Regex::new(r"```[\w+-]*[ \t]*\r?\n?([\s\S]*?)(?:```|\z)")
        .ok()
        .and_then(|re| {
            re.captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        });
    match fenced {
        Some(code) => dedent(&code).trim().to_string(),
        None => dedent(text).trim().to_string(),
    }
}

/// Whether `code` contains a `def` keyword followed by whitespace.
pub fn has_definition(code: &str) -> bool {
    Regex::new(r"\bdef\s")
        .ok()
        .is_some_and(|re| re.is_match(code))
}

/// Name of the first defined function: the last identifier before the
/// first `(` on the first `def` line.
pub fn resolve_function_name(code: &str) -> Option<String> {
    let line = code.lines().map(str::trim_start).find(|line| {
        line.strip_prefix("def")
            .is_some_and(|rest| rest.starts_with(char::is_whitespace))
    })?;
    let head = line.split('(').next()?;
    head.split_whitespace()
        .last()
        .filter(|name| *name != "def")
        .map(str::to_string)
}

fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    text.lines()
        .map(|line| line.get(indent..).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn outcome_label(err: &SynthesisError) -> &'static str {
    match err {
        SynthesisError::NoFunctionFound => "no_function",
        SynthesisError::SyntaxInvalid(_) => "syntax_invalid",
        SynthesisError::SmokeTestFailed(_) => "smoke_test_failed",
        SynthesisError::RetriesExhausted { .. } => "exhausted",
        SynthesisError::Generator(_) => "generator_error",
    }
}

/// Validates generator output for one task.
pub struct CodeSynthesizer<T: TaskAdapter> {
    task: Arc<T>,
    surface: Arc<NumericSurface>,
    max_attempts: u32,
    smoke_seed: u64,
    stream: bool,
    metrics: MetricsCollector,
}

impl<T: TaskAdapter> CodeSynthesizer<T> {
    pub fn new(task: Arc<T>) -> Self {
        Self {
            task,
            surface: Arc::new(NumericSurface::standard()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            smoke_seed: 0,
            stream: true,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_surface(mut self, surface: Arc<NumericSurface>) -> Self {
        self.surface = surface;
        self
    }

    /// Completions tried before giving up; at least one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_smoke_seed(mut self, seed: u64) -> Self {
        self.smoke_seed = seed;
        self
    }

    /// Whether repair completions are requested as a stream.
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Single validation pass over raw generator text.
    pub fn validate(&self, raw: &str) -> Result<SynthesizedReward, SynthesisError> {
        let source = extract_code(raw);
        if !has_definition(&source) {
            return Err(SynthesisError::NoFunctionFound);
        }
        let name = resolve_function_name(&source).ok_or_else(|| {
            SynthesisError::SyntaxInvalid("could not resolve the function name".to_string())
        })?;
        debug!(function = %name, "Compiling reward function");

        let function = Arc::new(RewardFunction::compile(
            &source,
            &name,
            Arc::clone(&self.surface),
        )?);
        self.smoke_test(&function)?;

        Ok(SynthesizedReward { function, source })
    }

    /// Resets a fresh environment, takes one random action and checks that
    /// the candidate returns a finite reward for it.
    fn smoke_test(&self, function: &Arc<RewardFunction>) -> Result<(), SynthesisError> {
        let mut env = RewardEnvAdapter::for_task(Arc::clone(&self.task), Some(Arc::clone(function)));
        env.reset(Some(self.smoke_seed));

        let mut rng = ChaCha8Rng::seed_from_u64(self.smoke_seed);
        let action = env.action_space().sample(&mut rng);
        let step = env
            .step(&action)
            .map_err(|e| SynthesisError::SmokeTestFailed(e.to_string()))?;

        if !step.reward.is_finite() {
            return Err(SynthesisError::SmokeTestFailed(format!(
                "reward is not finite: {}",
                step.reward
            )));
        }
        Ok(())
    }

    /// Validates `raw`, asking the session for a corrected completion after
    /// each recoverable failure.
    pub async fn synthesize(
        &self,
        session: &mut ChatSession,
        raw: &str,
    ) -> Result<SynthesizedReward, SynthesisError> {
        let mut response = raw.to_string();
        let mut attempt = 1;

        loop {
            let err = match self.validate(&response) {
                Ok(reward) => {
                    self.metrics.record_synthesis_attempt("accepted");
                    info!(
                        env = self.task.name(),
                        function = reward.function.name(),
                        attempt = attempt,
                        "Reward function accepted"
                    );
                    return Ok(reward);
                }
                Err(err) if err.is_recoverable() => err,
                Err(err) => return Err(err),
            };

            self.metrics.record_synthesis_attempt(outcome_label(&err));
            warn!(
                env = self.task.name(),
                attempt = attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "Generated reward function rejected"
            );

            if attempt >= self.max_attempts {
                self.metrics.record_synthesis_attempt("exhausted");
                return Err(SynthesisError::RetriesExhausted {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            session.add_message(build_repair_prompt(&err.to_string()), "user", &[])?;
            response = session.generate_response(self.stream).await?;
            attempt += 1;
        }
    }
}
