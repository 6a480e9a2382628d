//! Stub task and backend shared by unit tests.
//!
//! `StubTask` episodes last `length` steps and succeed iff the last action
//! is 1. The observation is `[seed % 20, step]`, so evaluating over seeds
//! `0..20` visits every slot once. `StubBackend` checks the reward it is
//! trained under: a reward that prefers the successful action yields a
//! policy passing 19 of 20 slots, anything else passes 2 of 20.
//! `ScriptedLlm` replays canned completions in order.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::env::{
    Action, ActionSpace, Environment, Observation, Step, StepInfo, SuccessFlags, TaskAdapter,
    TaskPrompt,
};
use crate::error::{EnvError, LlmError, TrainingError};
use crate::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use crate::training::{Policy, RewardEnvAdapter, TrainingBackend, TrainingContext, TrainingStats};

#[derive(Debug)]
pub struct StubEnv {
    length: usize,
    position: usize,
    seed_slot: f64,
    last_action: usize,
    done: bool,
}

impl Environment for StubEnv {
    fn reset(&mut self, seed: Option<u64>) -> Observation {
        self.seed_slot = seed.map(|s| (s % 20) as f64).unwrap_or(0.0);
        self.position = 0;
        self.done = false;
        vec![self.seed_slot, 0.0]
    }

    fn step(&mut self, action: &Action) -> Result<Step, EnvError> {
        if self.done {
            return Err(EnvError::StepAfterDone);
        }
        let Action::Discrete(a) = action else {
            return Err(EnvError::InvalidAction(format!("{:?}", action)));
        };
        self.last_action = *a;
        self.position += 1;
        let terminated = self.position >= self.length;
        self.done = terminated;
        Ok(Step {
            observation: vec![self.seed_slot, self.position as f64],
            reward: 0.0,
            terminated,
            truncated: false,
            info: StepInfo::default(),
        })
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(2)
    }

    fn observation_dim(&self) -> usize {
        2
    }
}

#[derive(Debug)]
pub struct StubTask {
    pub length: usize,
    pub predicate_calls: AtomicUsize,
    prompt: TaskPrompt,
}

impl StubTask {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            predicate_calls: AtomicUsize::new(0),
            prompt: TaskPrompt::new("Press the right button", "0 Slot 0 19\n1 Step 0 1"),
        }
    }

    pub fn calls(&self) -> usize {
        self.predicate_calls.load(Ordering::SeqCst)
    }
}

impl TaskAdapter for StubTask {
    type Env = StubEnv;

    fn name(&self) -> &str {
        "Stub-v0"
    }

    fn make_env(&self) -> StubEnv {
        StubEnv {
            length: self.length,
            position: 0,
            seed_slot: 0.0,
            last_action: 0,
            done: true,
        }
    }

    fn success(&self, env: &StubEnv, _info: &StepInfo) -> SuccessFlags {
        self.predicate_calls.fetch_add(1, Ordering::SeqCst);
        if env.last_action == 1 {
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

#[derive(Debug, Clone, PartialEq)]
pub struct SlotPolicy {
    pub pass_slots: f64,
}

impl Policy for SlotPolicy {
    fn predict(&self, observation: &[f64]) -> Action {
        Action::Discrete(usize::from(observation[0] < self.pass_slots))
    }

    fn save(&self, path: &Path) -> Result<(), TrainingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(&self.pass_slots)?)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StubBackend {
    /// Simulated training time; the stop flag is polled while waiting.
    pub delay: Duration,
}

impl StubBackend {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl TrainingBackend<StubTask> for StubBackend {
    type Policy = SlotPolicy;

    fn name(&self) -> &str {
        "stub"
    }

    fn train(
        &self,
        env: &mut RewardEnvAdapter<StubTask>,
        ctx: &TrainingContext<'_>,
    ) -> Result<(SlotPolicy, TrainingStats), TrainingError> {
        let mut press = |action: usize| -> Result<f64, TrainingError> {
            env.reset(Some(0));
            let mut total = 0.0;
            loop {
                let step = env.step(&Action::Discrete(action))?;
                total += step.reward;
                if step.is_done() {
                    return Ok(total);
                }
            }
        };
        let good = press(1)?;
        let bad = press(0)?;

        let started = Instant::now();
        while started.elapsed() < self.delay {
            if ctx.is_cancelled() {
                return Err(TrainingError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let pass_slots = if good > bad { 19.0 } else { 2.0 };
        let stats = TrainingStats {
            mean_reward: (good + bad) / 2.0,
            total_episodes: 2,
            episode_returns: vec![good, bad],
            ..Default::default()
        };
        Ok((SlotPolicy { pass_slots }, stats))
    }

    fn load(&self, path: &Path) -> Result<SlotPolicy, TrainingError> {
        let pass_slots: f64 = serde_json::from_str(&fs::read_to_string(path)?)?;
        Ok(SlotPolicy { pass_slots })
    }
}

/// Replays canned completions and keeps every prompt it was sent.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(last);
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
