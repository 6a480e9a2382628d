//! End-to-end reward search with a scripted generator and a stub backend.
//!
//! The stub environment is a single-step episode that succeeds when the
//! agent presses button 1. The stub backend checks which button the
//! candidate reward prefers: a reward that prefers button 1 trains a policy
//! that passes 19 of 20 evaluation slots, any other reward passes 2.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reward_forge::controller::RefinementController;
use reward_forge::env::{
    Action, ActionSpace, Environment, Observation, Step, StepInfo, SuccessFlags, TaskAdapter,
    TaskPrompt,
};
use reward_forge::error::{EnvError, LlmError, TrainingError};
use reward_forge::llm::{
    ChatSession, Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage,
};
use reward_forge::runlog::MemoryRunLogger;
use reward_forge::synthesis::CodeSynthesizer;
use reward_forge::training::{
    OrchestratorConfig, Policy, RewardEnvAdapter, ThresholdMode, TrainingBackend,
    TrainingContext, TrainingOrchestrator, TrainingStats,
};

// ============================================================================
// Stub task
// ============================================================================

struct ButtonEnv {
    slot: f64,
    pressed: usize,
    done: bool,
}

impl Environment for ButtonEnv {
    fn reset(&mut self, seed: Option<u64>) -> Observation {
        self.slot = seed.map(|s| (s % 20) as f64).unwrap_or(0.0);
        self.done = false;
        vec![self.slot]
    }

    fn step(&mut self, action: &Action) -> Result<Step, EnvError> {
        if self.done {
            return Err(EnvError::StepAfterDone);
        }
        let Action::Discrete(button) = action else {
            return Err(EnvError::InvalidAction(format!("{:?}", action)));
        };
        self.pressed = *button;
        self.done = true;
        Ok(Step {
            observation: vec![self.slot],
            reward: 0.0,
            terminated: true,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(2)
    }

    fn observation_dim(&self) -> usize {
        1
    }
}

struct ButtonTask {
    prompt: TaskPrompt,
}

impl ButtonTask {
    fn new() -> Self {
        Self {
            prompt: TaskPrompt::new("Press button 1", "0 Slot 0 19"),
        }
    }
}

impl TaskAdapter for ButtonTask {
    type Env = ButtonEnv;

    fn name(&self) -> &str {
        "Button-v0"
    }

    fn make_env(&self) -> ButtonEnv {
        ButtonEnv {
            slot: 0.0,
            pressed: 0,
            done: true,
        }
    }

    fn success(&self, env: &ButtonEnv, _info: &StepInfo) -> SuccessFlags {
        if env.pressed == 1 {
            SuccessFlags::success()
        } else {
            SuccessFlags::failure()
        }
    }

    fn objective_metrics(&self, observations: &[Observation]) -> BTreeMap<String, f64> {
        BTreeMap::from([("steps".to_string(), observations.len() as f64)])
    }

    fn prompt(&self) -> &TaskPrompt {
        &self.prompt
    }
}

// ============================================================================
// Stub backend
// ============================================================================

struct SlotPolicy {
    pass_slots: f64,
}

impl Policy for SlotPolicy {
    fn predict(&self, observation: &[f64]) -> Action {
        Action::Discrete(usize::from(observation[0] < self.pass_slots))
    }

    fn save(&self, path: &Path) -> Result<(), TrainingError> {
        std::fs::write(path, serde_json::to_string(&self.pass_slots)?)?;
        Ok(())
    }
}

struct PreferenceBackend;

impl TrainingBackend<ButtonTask> for PreferenceBackend {
    type Policy = SlotPolicy;

    fn name(&self) -> &str {
        "preference"
    }

    fn train(
        &self,
        env: &mut RewardEnvAdapter<ButtonTask>,
        _ctx: &TrainingContext<'_>,
    ) -> Result<(SlotPolicy, TrainingStats), TrainingError> {
        let mut press = |button: usize| -> Result<f64, TrainingError> {
            env.reset(Some(0));
            Ok(env.step(&Action::Discrete(button))?.reward)
        };
        let good = press(1)?;
        let bad = press(0)?;
        let pass_slots = if good > bad { 19.0 } else { 2.0 };
        Ok((SlotPolicy { pass_slots }, TrainingStats::default()))
    }

    fn load(&self, path: &Path) -> Result<SlotPolicy, TrainingError> {
        let pass_slots = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        Ok(SlotPolicy { pass_slots })
    }
}

// ============================================================================
// Scripted generator
// ============================================================================

struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        if let Some(last) = request.messages.last() {
            self.prompts.lock().unwrap().push(last.content.clone());
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::ParseError("script exhausted".to_string()))?;
        Ok(GenerationResponse {
            id: "scripted".to_string(),
            model: "scripted".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(reply),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        })
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Scenarios
// ============================================================================

const INDIFFERENT: &str = "```python\ndef reward_func(observations, is_success, is_failure):\n    return 0.0\n```";
const PREFERS_SUCCESS: &str = "```python\nimport numpy as np\n\ndef reward_func(observations: np.ndarray, is_success: bool, is_failure: bool) -> float:\n    if is_success:\n        return 1.0\n    if is_failure:\n        return -1.0\n    return 0.0\n```";

fn controller(
    generator: Arc<ScriptedGenerator>,
    logger: Arc<MemoryRunLogger>,
) -> RefinementController<ButtonTask, PreferenceBackend> {
    let task = Arc::new(ButtonTask::new());
    let config = OrchestratorConfig {
        eval_episodes: 20,
        eval_seed: 0,
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
    .with_threshold(ThresholdMode::Fixed(0.9));
    let orchestrator =
        TrainingOrchestrator::new(Arc::clone(&task), Arc::new(PreferenceBackend), config)
            .with_run_logger(logger);
    let provider: Arc<dyn LlmProvider> = generator;
    RefinementController::new(
        orchestrator,
        CodeSynthesizer::new(task).with_max_attempts(2),
        ChatSession::new(provider, "scripted"),
    )
}

#[tokio::test]
async fn test_two_initial_one_refinement() {
    let generator = Arc::new(ScriptedGenerator::new(&[
        INDIFFERENT,
        PREFERS_SUCCESS,
        PREFERS_SUCCESS,
    ]));
    let logger = Arc::new(MemoryRunLogger::new());
    let mut controller = controller(Arc::clone(&generator), Arc::clone(&logger));

    let history = controller
        .generate_reward_function(2, 1, None)
        .await
        .expect("search should finish");

    assert_eq!(history.len(), 4);
    assert!(history[0].reward_func().is_none());

    assert_eq!(history[1].success_rate(), Some(0.1));
    assert_eq!(history[2].success_rate(), Some(0.95));

    let children: Vec<_> = history.iter().filter(|c| !c.lineage.is_empty()).collect();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].idx, 3);
    assert_eq!(children[0].lineage, vec![1]);
    assert_eq!(children[0].success_rate(), Some(0.95));

    let prompts = generator.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[2].contains("return 0.0"));
    assert!(prompts[2].contains("success_rate: 0.100"));

    let records = logger.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.env_id == "Button-v0"));
}

#[tokio::test]
async fn test_missing_definition_schedules_nothing() {
    let generator = Arc::new(ScriptedGenerator::new(&[
        "I would reward the agent for pressing button 1.",
        "Reward = 1 when button 1 is pressed.",
    ]));
    let logger = Arc::new(MemoryRunLogger::new());
    let mut controller = controller(Arc::clone(&generator), Arc::clone(&logger));

    let history = controller
        .generate_reward_function(1, 1, None)
        .await
        .expect("search should finish");

    assert_eq!(history.len(), 1);
    assert_eq!(controller.orchestrator().next_idx(), 1);
    assert!(logger.records().is_empty());

    let prompts = generator.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("No function definition found"));
}

#[tokio::test]
async fn test_user_reward_function() {
    let generator = Arc::new(ScriptedGenerator::new(&[]));
    let mut controller = controller(generator, Arc::new(MemoryRunLogger::new()));

    let candidate = controller
        .test_reward_func(PREFERS_SUCCESS)
        .await
        .expect("reward should train");
    assert_eq!(candidate.idx, 1);
    assert_eq!(candidate.success_rate(), Some(0.95));
    assert!(candidate.reward_func_str().unwrap().starts_with("import numpy as np"));
}
