//! LLM prompts for reward-function search.
//!
//! - [`reward`] - designer role, initial generation, repair and refinement
//! - [`critic`] - rollout descriptions used as refinement feedback

pub mod critic;
pub mod reward;

pub use critic::{build_rollout_prompt, ROLLOUT_CRITIC_SYSTEM};
pub use reward::{
    build_initial_prompt, build_refinement_prompt, build_repair_prompt, RefinementFeedback,
    REWARD_DESIGNER_SYSTEM,
};
