//! Error types for reward-forge operations.
//!
//! Defines error types for the major subsystems:
//! - LLM API interactions
//! - Reward function synthesis
//! - Candidate bookkeeping and job state
//! - Environment stepping and policy training
//! - Result collection and the durable run log

use thiserror::Error;

use crate::sandbox::{CompileError, EvalError};

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to attach image '{path}': {message}")]
    Attachment { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while turning generator output into a reward function.
///
/// `NoFunctionFound`, `SyntaxInvalid` and `SmokeTestFailed` are recovered by
/// re-prompting the generator; the remaining variants are terminal.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("No function definition found in generated text")]
    NoFunctionFound,

    #[error("Reward function failed to compile: {0}")]
    SyntaxInvalid(String),

    #[error("Reward function failed the smoke test: {0}")]
    SmokeTestFailed(String),

    #[error("Reward synthesis failed after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Generator request failed: {0}")]
    Generator(#[from] LlmError),
}

impl SynthesisError {
    /// Whether a fresh completion from the generator may fix this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SynthesisError::NoFunctionFound
                | SynthesisError::SyntaxInvalid(_)
                | SynthesisError::SmokeTestFailed(_)
        )
    }
}

impl From<CompileError> for SynthesisError {
    fn from(err: CompileError) -> Self {
        SynthesisError::SyntaxInvalid(err.to_string())
    }
}

/// Programming errors in candidate bookkeeping. These are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobStateError {
    #[error("Candidate {0} was never started")]
    NotStarted(usize),

    #[error("Candidate {0} has already been started")]
    AlreadyStarted(usize),

    #[error("Candidate {0} is not registered")]
    UnknownCandidate(usize),

    #[error("Candidate {0} has no reward function")]
    MissingRewardFunction(usize),

    #[error("The baseline candidate cannot carry a reward function")]
    BaselineCarriesReward,

    #[error("Candidate index {got} is out of sequence, expected {expected}")]
    NonSequentialIndex { expected: usize, got: usize },

    #[error("Candidate {0} already has recorded results")]
    ResultsAlreadyRecorded(usize),
}

/// Errors raised by an environment.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("step() called on a finished episode; call reset() first")]
    StepAfterDone,

    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

/// Errors that can occur inside a training job.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Reward function failed: {0}")]
    Reward(#[from] EvalError),

    #[error("Backend '{backend}' does not support this action space")]
    UnsupportedActionSpace { backend: String },

    #[error("Invalid hyperparameter '{name}': {message}")]
    InvalidHyperparameter { name: String, message: String },

    #[error("Training was cancelled")]
    Cancelled,

    #[error("Training worker panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the durable run log.
#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the training orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    JobState(#[from] JobStateError),

    #[error("Result channel closed while candidates {pending:?} were still pending")]
    ChannelClosed { pending: Vec<usize> },

    #[error("Timed out waiting for candidates {pending:?}")]
    JobTimeout { pending: Vec<usize> },

    #[error("Baseline candidate has no recorded performance")]
    MissingBaseline,

    #[error("Candidate {0} has no saved policy")]
    NoPolicy(usize),

    #[error("Failed to record rollout: {0}")]
    Rollout(#[from] TrainingError),
}

/// Top-level error for a reward search session.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    JobState(#[from] JobStateError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Feedback source failed: {0}")]
    Feedback(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_synthesis_errors() {
        assert!(SynthesisError::NoFunctionFound.is_recoverable());
        assert!(SynthesisError::SyntaxInvalid("bad".into()).is_recoverable());
        assert!(SynthesisError::SmokeTestFailed("nan".into()).is_recoverable());
        assert!(!SynthesisError::RetriesExhausted {
            attempts: 5,
            last: "x".into()
        }
        .is_recoverable());
        assert!(!SynthesisError::Generator(LlmError::MissingApiBase).is_recoverable());
    }

    #[test]
    fn test_job_state_messages() {
        let err = JobStateError::NonSequentialIndex {
            expected: 3,
            got: 5,
        };
        assert_eq!(
            err.to_string(),
            "Candidate index 5 is out of sequence, expected 3"
        );

        let wrapped: OrchestratorError = JobStateError::NotStarted(4).into();
        assert_eq!(wrapped.to_string(), "Candidate 4 was never started");
    }
}
