//! Extra context for refinement prompts.
//!
//! A [`FeedbackSource`] looks at a candidate that fell under the threshold
//! and may return a comment for the next prompt. [`HumanFeedback`] asks a
//! person on a text stream; [`RolloutCritic`] asks a second model to
//! describe a recorded episode of the candidate's policy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::debug;

use crate::candidate::Performances;
use crate::error::ForgeError;
use crate::llm::{ChatSession, GenerationOptions, LlmProvider};
use crate::prompts::{build_rollout_prompt, ROLLOUT_CRITIC_SYSTEM};
use crate::training::Rollout;

/// What a feedback source gets to see about one candidate.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackRequest<'a> {
    pub env: &'a str,
    pub goal: &'a str,
    pub observation_space: &'a str,
    pub idx: usize,
    pub source: &'a str,
    pub performances: &'a Performances,
    /// Present when the candidate's policy could be replayed.
    pub rollout: Option<&'a Rollout>,
}

#[async_trait]
pub trait FeedbackSource: Send + Sync {
    fn name(&self) -> &str;

    /// Whether [`FeedbackRequest::rollout`] should be recorded for this source.
    fn wants_rollout(&self) -> bool {
        false
    }

    /// A comment for the refinement prompt, or `None` to add nothing.
    async fn comment(&self, request: &FeedbackRequest<'_>) -> Result<Option<String>, ForgeError>;
}

/// Reads one line of feedback per candidate from a text stream.
pub struct HumanFeedback<R> {
    reader: Mutex<R>,
}

impl HumanFeedback<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin + Send> HumanFeedback<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> FeedbackSource for HumanFeedback<R> {
    fn name(&self) -> &str {
        "human"
    }

    async fn comment(&self, request: &FeedbackRequest<'_>) -> Result<Option<String>, ForgeError> {
        println!();
        println!("Candidate {} on {}", request.idx, request.env);
        println!("{}", request.source);
        println!("performance: {}", request.performances.describe());
        println!("Your feedback (empty line to skip):");

        let mut line = String::new();
        self.reader
            .lock()
            .await
            .read_line(&mut line)
            .await
            .map_err(|e| ForgeError::Feedback(e.to_string()))?;
        let line = line.trim();
        Ok((!line.is_empty()).then(|| line.to_string()))
    }
}

/// Describes a recorded rollout with a second model.
pub struct RolloutCritic {
    provider: Arc<dyn LlmProvider>,
    model: String,
    options: GenerationOptions,
    stride: usize,
}

impl RolloutCritic {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            options: GenerationOptions::default(),
            stride: 10,
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Keep every `stride`-th step of the rollout in the trace.
    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride.max(1);
        self
    }
}

#[async_trait]
impl FeedbackSource for RolloutCritic {
    fn name(&self) -> &str {
        "rollout_critic"
    }

    fn wants_rollout(&self) -> bool {
        true
    }

    async fn comment(&self, request: &FeedbackRequest<'_>) -> Result<Option<String>, ForgeError> {
        let Some(rollout) = request.rollout else {
            return Ok(None);
        };
        let prompt = build_rollout_prompt(
            request.env,
            request.goal,
            request.observation_space,
            &rollout.summarize(self.stride),
        );

        let mut session = ChatSession::new(Arc::clone(&self.provider), self.model.clone())
            .with_options(self.options.clone())
            .with_system_prompt(ROLLOUT_CRITIC_SYSTEM);
        session.add_message(prompt, "user", &[])?;
        let description = session.generate_response(false).await?;
        debug!(idx = request.idx, chars = description.len(), "Rollout described");

        let description = description.trim();
        Ok((!description.is_empty()).then(|| description.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SuccessFlags;
    use crate::training::test_support::ScriptedLlm;

    fn request<'a>(performances: &'a Performances, rollout: Option<&'a Rollout>) -> FeedbackRequest<'a> {
        FeedbackRequest {
            env: "Stub-v0",
            goal: "Press the right button",
            observation_space: "0 Slot",
            idx: 3,
            source: "def r(o, s, x):\n    return 0.0",
            performances,
            rollout,
        }
    }

    #[tokio::test]
    async fn test_human_feedback_reads_lines() {
        let human = HumanFeedback::new(&b"push harder\n\n"[..]);
        let perf = Performances::new(0.2, Default::default());
        assert_eq!(
            human.comment(&request(&perf, None)).await.unwrap().as_deref(),
            Some("push harder")
        );
        assert_eq!(human.comment(&request(&perf, None)).await.unwrap(), None);
        assert!(!human.wants_rollout());
    }

    #[tokio::test]
    async fn test_critic_describes_rollout() {
        let llm = Arc::new(ScriptedLlm::new(["  The agent always presses left.  "]));
        let critic = RolloutCritic::new(llm.clone(), "critic").with_stride(1);
        let perf = Performances::new(0.1, Default::default());
        let rollout = Rollout {
            seed: 1000,
            observations: vec![vec![0.0, 0.0], vec![0.0, 1.0]],
            actions: vec![crate::env::Action::Discrete(0)],
            rewards: vec![0.0],
            outcome: SuccessFlags::failure(),
        };

        assert_eq!(critic.comment(&request(&perf, None)).await.unwrap(), None);
        assert_eq!(llm.requests(), 0);

        let description = critic
            .comment(&request(&perf, Some(&rollout)))
            .await
            .unwrap();
        assert_eq!(description.as_deref(), Some("The agent always presses left."));
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("outcome: failure"));
        assert!(prompts[0].contains("Goal: Press the right button"));
    }
}
