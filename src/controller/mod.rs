//! Generate, train, classify, refine.
//!
//! [`RefinementController`] drives one reward search: it prompts the
//! generator for `n_init` reward functions, trains them all concurrently,
//! splits them around the threshold and asks the generator to improve each
//! candidate that fell short, for at most `n_refine` rounds.

pub mod feedback;

use std::path::Path;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use tracing::{info, warn};

use crate::candidate::{Candidate, Performances};
use crate::env::TaskAdapter;
use crate::error::{ForgeError, JobStateError, OrchestratorError, SynthesisError};
use crate::llm::ChatSession;
use crate::prompts::{build_initial_prompt, build_refinement_prompt, RefinementFeedback};
use crate::sandbox::RewardFunction;
use crate::synthesis::CodeSynthesizer;
use crate::training::{Partition, Rollout, TrainingBackend, TrainingOrchestrator};

pub use feedback::{FeedbackRequest, FeedbackSource, HumanFeedback, RolloutCritic};

/// The evaluated candidate with the highest success rate, ignoring the
/// baseline. Ties go to the earliest candidate.
pub fn best_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .filter(|c| !c.is_baseline())
        .filter_map(|c| c.success_rate().map(|rate| (c, rate)))
        .max_by_key(|(c, rate)| (OrderedFloat(*rate), std::cmp::Reverse(c.idx)))
        .map(|(c, _)| c)
}

pub struct RefinementController<T: TaskAdapter, B: TrainingBackend<T>> {
    orchestrator: TrainingOrchestrator<T, B>,
    synthesizer: CodeSynthesizer<T>,
    session: ChatSession,
    human: Option<Box<dyn FeedbackSource>>,
    critic: Option<Box<dyn FeedbackSource>>,
    stream: bool,
}

impl<T: TaskAdapter, B: TrainingBackend<T>> RefinementController<T, B> {
    pub fn new(
        orchestrator: TrainingOrchestrator<T, B>,
        synthesizer: CodeSynthesizer<T>,
        session: ChatSession,
    ) -> Self {
        Self {
            orchestrator,
            synthesizer,
            session,
            human: None,
            critic: None,
            stream: true,
        }
    }

    pub fn with_human_feedback(mut self, source: Box<dyn FeedbackSource>) -> Self {
        self.human = Some(source);
        self
    }

    pub fn with_rollout_critic(mut self, source: Box<dyn FeedbackSource>) -> Self {
        self.critic = Some(source);
        self
    }

    /// Whether completions are requested as a stream.
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn orchestrator(&self) -> &TrainingOrchestrator<T, B> {
        &self.orchestrator
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn into_candidates(self) -> Vec<Candidate> {
        self.orchestrator.into_candidates()
    }

    /// Runs the whole search and returns every candidate, baseline included.
    ///
    /// Candidates whose synthesis exhausts its retries are skipped. A
    /// candidate that never trains (unknown or unstarted idx) is a fatal
    /// error.
    pub async fn generate_reward_function(
        &mut self,
        n_init: usize,
        n_refine: usize,
        focus: Option<&str>,
    ) -> Result<Vec<Candidate>, ForgeError> {
        let task = self.orchestrator.task().clone();
        info!(
            env = task.name(),
            n_init = n_init,
            n_refine = n_refine,
            "Starting reward search"
        );

        let mut initial = Vec::with_capacity(n_init);
        for iteration in 1..=n_init {
            let prompt = build_initial_prompt(task.name(), task.prompt(), iteration, focus);
            let image = task.prompt().image.clone().filter(|_| iteration == 1);
            let images: Vec<&Path> = image.iter().map(|p| p.as_path()).collect();
            if let Some(idx) = self.propose(prompt, &images, Vec::new()).await? {
                initial.push(idx);
            }
        }

        if initial.is_empty() {
            warn!(env = task.name(), "No reward function survived synthesis");
            return Ok(self.orchestrator.candidates().to_vec());
        }

        let mut partition = self.orchestrator.evaluate_policy(&initial).await?;
        log_partition(0, &partition);

        for round in 1..=n_refine {
            if partition.worse.is_empty() {
                info!(round = round, "Every candidate reached the threshold");
                break;
            }

            let mut children = Vec::with_capacity(partition.worse.len());
            for &parent in &partition.worse {
                let (prompt, lineage) = self.refinement_prompt(parent).await?;
                if let Some(idx) = self.propose(prompt, &[], lineage).await? {
                    children.push(idx);
                }
            }

            if children.is_empty() {
                warn!(round = round, "No refined reward function survived synthesis");
                break;
            }
            partition = self.orchestrator.evaluate_policy(&children).await?;
            log_partition(round, &partition);
        }

        Ok(self.orchestrator.candidates().to_vec())
    }

    /// Validates, trains and evaluates a user-supplied reward function.
    ///
    /// Validation is a single pass: nothing is trained if it fails.
    pub async fn test_reward_func(&mut self, source: &str) -> Result<Candidate, ForgeError> {
        let reward = self.synthesizer.validate(source)?;
        let idx = self.schedule(reward.function, Vec::new())?;
        let partition = self.orchestrator.evaluate_policy(&[idx]).await?;
        log_partition(0, &partition);

        self.orchestrator
            .candidate(idx)
            .cloned()
            .ok_or_else(|| JobStateError::UnknownCandidate(idx).into())
    }

    /// Sends `prompt`, synthesizes the reply and starts training it.
    /// Returns `None` when synthesis gave up.
    async fn propose(
        &mut self,
        prompt: String,
        images: &[&Path],
        lineage: Vec<usize>,
    ) -> Result<Option<usize>, ForgeError> {
        self.session.add_message(prompt, "user", images)?;
        let raw = self.session.generate_response(self.stream).await?;

        match self.synthesizer.synthesize(&mut self.session, &raw).await {
            Ok(reward) => Ok(Some(self.schedule(reward.function, lineage)?)),
            Err(err @ SynthesisError::RetriesExhausted { .. }) => {
                warn!(lineage = ?lineage, error = %err, "Skipping reward function");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn schedule(
        &mut self,
        function: Arc<RewardFunction>,
        lineage: Vec<usize>,
    ) -> Result<usize, JobStateError> {
        let idx = self.orchestrator.next_idx();
        let candidate = Candidate::with_reward(idx, function, lineage)?;
        let idx = self.orchestrator.register(candidate)?;
        self.orchestrator.start_learning(idx)?;
        info!(idx = idx, "Candidate scheduled");
        Ok(idx)
    }

    async fn refinement_prompt(
        &self,
        parent: usize,
    ) -> Result<(String, Vec<usize>), ForgeError> {
        let candidate = self
            .orchestrator
            .candidate(parent)
            .ok_or(JobStateError::UnknownCandidate(parent))?;
        let source = candidate.reward_func_str().unwrap_or_default().to_string();
        let lineage = candidate.child_lineage();
        let performances = candidate
            .performances()
            .cloned()
            .unwrap_or_else(|| Performances::failed("not evaluated"));

        let wants_rollout = [&self.human, &self.critic]
            .into_iter()
            .flatten()
            .any(|source| source.wants_rollout());
        let rollout = if wants_rollout {
            self.rollout_for(parent)?
        } else {
            None
        };

        let task = self.orchestrator.task();
        let prompt = task.prompt();
        let request = FeedbackRequest {
            env: task.name(),
            goal: prompt.goal.as_deref().unwrap_or("not specified"),
            observation_space: &prompt.observation_space,
            idx: parent,
            source: &source,
            performances: &performances,
            rollout: rollout.as_ref(),
        };

        let mut feedback = RefinementFeedback::default();
        if let Some(human) = &self.human {
            feedback.human = human.comment(&request).await?;
        }
        if let Some(critic) = &self.critic {
            feedback.rollout_description = critic.comment(&request).await?;
        }

        let text = build_refinement_prompt(prompt, &source, &performances, &feedback);
        Ok((text, lineage))
    }

    /// A candidate whose training failed has no policy to replay.
    fn rollout_for(&self, idx: usize) -> Result<Option<Rollout>, ForgeError> {
        match self.orchestrator.record_rollout(idx) {
            Ok(rollout) => Ok(Some(rollout)),
            Err(OrchestratorError::NoPolicy(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn log_partition(round: usize, partition: &Partition) {
    info!(
        round = round,
        threshold = partition.threshold,
        worse = ?partition.worse,
        better = ?partition.better,
        "Candidates classified"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmProvider;
    use crate::runlog::MemoryRunLogger;
    use crate::training::test_support::{ScriptedLlm, StubBackend, StubTask};
    use crate::training::{OrchestratorConfig, ThresholdMode};
    use std::time::Duration;

    const PREFERS_ONE: &str = "```python\ndef reward_func(observations, is_success, is_failure):\n    if is_success:\n        return 1.0\n    return 0.0\n```";
    const FLAT: &str = "def reward_func(observations, is_success, is_failure):\n    return 0.0";

    fn controller(
        llm: Arc<ScriptedLlm>,
        logger: Arc<MemoryRunLogger>,
    ) -> RefinementController<StubTask, StubBackend> {
        let task = Arc::new(StubTask::new(3));
        let config = OrchestratorConfig {
            eval_episodes: 20,
            eval_seed: 0,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
        .with_threshold(ThresholdMode::Fixed(0.9));
        let orchestrator = TrainingOrchestrator::new(
            Arc::clone(&task),
            Arc::new(StubBackend::default()),
            config,
        )
        .with_run_logger(logger);
        let provider: Arc<dyn LlmProvider> = llm;
        RefinementController::new(
            orchestrator,
            CodeSynthesizer::new(task).with_max_attempts(2),
            ChatSession::new(provider, "scripted"),
        )
    }

    #[test]
    fn test_best_candidate() {
        assert!(best_candidate(&[Candidate::baseline()]).is_none());
    }

    #[tokio::test]
    async fn test_search_refines_worse_candidates() {
        let llm = Arc::new(ScriptedLlm::new([FLAT, PREFERS_ONE, PREFERS_ONE]));
        let logger = Arc::new(MemoryRunLogger::new());
        let mut controller = controller(llm.clone(), logger.clone());

        let history = controller
            .generate_reward_function(2, 3, Some("be brief"))
            .await
            .unwrap();

        assert_eq!(history.len(), 4);
        assert_eq!(history[1].success_rate(), Some(0.1));
        assert_eq!(history[2].success_rate(), Some(0.95));
        assert_eq!(history[3].lineage, vec![1]);
        assert_eq!(history[3].success_rate(), Some(0.95));
        assert_eq!(best_candidate(&history).map(|c| c.idx), Some(2));

        assert_eq!(llm.requests(), 3);
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("Focus: be brief"));
        assert!(prompts[2].starts_with("improve the reward function to:"));
        assert!(prompts[2].contains("success_rate: 0.100"));
        assert_eq!(logger.records().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_synthesis_schedules_nothing() {
        let llm = Arc::new(ScriptedLlm::new(["no code", "still no code"]));
        let mut controller = controller(llm, Arc::new(MemoryRunLogger::new()));

        let history = controller.generate_reward_function(1, 1, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!controller.orchestrator().is_started(1));
    }

    #[tokio::test]
    async fn test_reward_func_runs_once() {
        let llm = Arc::new(ScriptedLlm::new(Vec::<String>::new()));
        let mut controller = controller(llm.clone(), Arc::new(MemoryRunLogger::new()));

        let candidate = controller.test_reward_func(PREFERS_ONE).await.unwrap();
        assert_eq!(candidate.idx, 1);
        assert_eq!(candidate.success_rate(), Some(0.95));
        assert_eq!(llm.requests(), 0);

        let err = controller.test_reward_func("return 1").await.unwrap_err();
        assert!(matches!(
            err,
            ForgeError::Synthesis(SynthesisError::NoFunctionFound)
        ));
        assert_eq!(controller.orchestrator().next_idx(), 2);
    }
}
