//! reward-forge: LLM-driven reward function search for reinforcement learning.
//!
//! A language model proposes reward functions as Python-flavoured source.
//! Each proposal is compiled into a sandboxed [`sandbox::RewardFunction`],
//! a policy is trained under it, and candidates whose held-out success rate
//! stays under the threshold are sent back to the model for refinement.
//!
//! The pieces, bottom-up:
//!
//! - [`sandbox`]: restricted evaluator for generated reward code
//! - [`env`]: environments and the per-task success predicate
//! - [`candidate`]: candidate bookkeeping
//! - [`training`]: reward adapter, training backends, concurrent jobs
//! - [`synthesis`]: generator text to validated reward function
//! - [`controller`]: the generate/evaluate/refine loop
//! - [`runlog`]: durable JSON-lines record of every evaluated candidate

// Core modules
pub mod candidate;
pub mod cli;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod prompts;
pub mod runlog;
pub mod sandbox;
pub mod synthesis;
pub mod training;

// Re-export commonly used types
pub use candidate::{Candidate, CandidateStore, Performances};
pub use config::{ConfigError, ForgeConfig};
pub use controller::RefinementController;
pub use error::{
    ForgeError, JobStateError, LlmError, OrchestratorError, SynthesisError, TrainingError,
};
pub use synthesis::{CodeSynthesizer, SynthesizedReward};
pub use training::{ThresholdMode, TrainingOrchestrator};
