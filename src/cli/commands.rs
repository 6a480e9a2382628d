//! CLI command definitions for reward-forge.
//!
//! `generate` runs a full reward search, `test-reward` trains and evaluates
//! a hand-written reward function, and `envs` lists the built-in tasks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::candidate::Candidate;
use crate::config::{ForgeConfig, LlmSettings, ProviderKind};
use crate::controller::{best_candidate, HumanFeedback, RefinementController, RolloutCritic};
use crate::env::{CartPole, EnvKind, MountainCar, TaskAdapter, TaskPrompt};
use crate::llm::{ChatSession, LiteLlmClient, LlmProvider, OllamaClient, DEFAULT_OLLAMA_BASE};
use crate::metrics::{export_metrics, init_metrics};
use crate::prompts::REWARD_DESIGNER_SYSTEM;
use crate::runlog::{JsonlRunLogger, RunContext, RunLogger};
use crate::synthesis::CodeSynthesizer;
use crate::training::{DirectSearch, ExecutionMode, TrainingOrchestrator};

/// LLM-driven reward function search for reinforcement learning tasks.
#[derive(Parser)]
#[command(name = "reward-forge")]
#[command(about = "Search reward functions for RL tasks with a language model")]
#[command(version)]
#[command(
    long_about = "reward-forge asks a language model for reward functions, trains a policy under each one, and refines the candidates whose success rate stays under the threshold.\n\nExample usage:\n  reward-forge generate --env CartPole-v1 --n-init 2 --n-refine 1 --model qwen2.5-coder"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate, train and refine reward functions for an environment.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Train and evaluate a reward function read from a file.
    TestReward(TestRewardArgs),

    /// List the built-in environments.
    Envs(EnvsArgs),
}

/// Generator selection, shared by the commands that talk to a model.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct LlmArgs {
    /// Generator backend.
    #[arg(long, value_enum)]
    pub provider: Option<ProviderKind>,

    /// Generator model.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Model used to describe rollouts (defaults to --model).
    #[arg(long)]
    pub critic_model: Option<String>,

    /// Generator API base URL.
    #[arg(long)]
    pub api_base: Option<String>,

    /// API key for the litellm provider.
    #[arg(long, env = "LITELLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

/// Training overrides, shared by `generate` and `test-reward`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TrainingArgs {
    /// Training budget per candidate, in environment steps.
    #[arg(long)]
    pub timesteps: Option<u64>,

    /// Training seed of the first run.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Fixed success-rate threshold (default: the baseline's success rate).
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Held-out evaluation episodes per candidate.
    #[arg(long)]
    pub eval_episodes: Option<usize>,

    /// Directory for saved policies.
    #[arg(long)]
    pub artifact_dir: Option<PathBuf>,

    /// Train candidates one after another on the calling thread.
    #[arg(long)]
    pub inline: bool,

    /// Give up on a round of training jobs after this many seconds.
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct GenerateArgs {
    /// Environment to search rewards for.
    #[arg(short, long, default_value = "CartPole-v1")]
    pub env: EnvKind,

    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub llm: LlmArgs,

    #[command(flatten)]
    pub training: TrainingArgs,

    /// Number of initial reward functions.
    #[arg(long)]
    pub n_init: Option<usize>,

    /// Maximum refinement rounds.
    #[arg(long)]
    pub n_refine: Option<usize>,

    /// Extra guidance added to every initial prompt.
    #[arg(long)]
    pub focus: Option<String>,

    /// Independent searches, with consecutive training seeds.
    #[arg(long)]
    pub runs: Option<usize>,

    /// Completions tried per reward function before it is skipped.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Replaces the environment's goal description.
    #[arg(long)]
    pub goal: Option<String>,

    /// Replaces the environment's observation-space description.
    #[arg(long)]
    pub observation_space: Option<String>,

    /// Image of the environment attached to the first prompt.
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Ask for a comment on stdin before each refinement.
    #[arg(long)]
    pub human_feedback: bool,

    /// Describe a rollout of each weak candidate with the critic model.
    #[arg(long)]
    pub rollout_description: bool,

    /// JSON-lines file receiving one record per evaluated candidate.
    #[arg(long)]
    pub run_log: Option<PathBuf>,

    /// Write Prometheus metrics to this file when the search ends.
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
pub struct TestRewardArgs {
    /// Environment to train on.
    #[arg(short, long, default_value = "CartPole-v1")]
    pub env: EnvKind,

    /// File containing the reward function.
    #[arg(short, long)]
    pub file: PathBuf,

    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub training: TrainingArgs,

    /// JSON-lines file receiving the candidate record.
    #[arg(long)]
    pub run_log: Option<PathBuf>,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
pub struct EnvsArgs {
    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Generate(args) => run_generate_command(args).await,
        Commands::TestReward(args) => run_test_reward_command(args).await,
        Commands::Envs(args) => run_envs_command(args),
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct CandidateSummary {
    idx: usize,
    lineage: Vec<usize>,
    success_rate: Option<f64>,
    failure: Option<String>,
    metrics: BTreeMap<String, f64>,
    policy: Option<PathBuf>,
    source: Option<String>,
}

impl From<&Candidate> for CandidateSummary {
    fn from(candidate: &Candidate) -> Self {
        let performances = candidate.performances();
        Self {
            idx: candidate.idx,
            lineage: candidate.lineage.clone(),
            success_rate: candidate.success_rate(),
            failure: performances.and_then(|p| p.failure.clone()),
            metrics: performances.map(|p| p.metrics.clone()).unwrap_or_default(),
            policy: candidate.policy().map(Path::to_path_buf),
            source: candidate.reward_func_str().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RunSummary {
    run: usize,
    seed: u64,
    env: String,
    best: Option<usize>,
    candidates: Vec<CandidateSummary>,
}

impl RunSummary {
    fn new(run: usize, seed: u64, env: &str, history: &[Candidate]) -> Self {
        Self {
            run,
            seed,
            env: env.to_string(),
            best: best_candidate(history).map(|c| c.idx),
            candidates: history.iter().map(CandidateSummary::from).collect(),
        }
    }

    fn print(&self) {
        println!("\n=== Run {} ({}, seed {}) ===", self.run, self.env, self.seed);
        for candidate in &self.candidates {
            let rate = candidate
                .success_rate
                .map(|r| format!("{:.3}", r))
                .unwrap_or_else(|| "-".to_string());
            let label = if candidate.idx == 0 {
                "baseline".to_string()
            } else if candidate.lineage.is_empty() {
                "initial".to_string()
            } else {
                format!("refined from {:?}", candidate.lineage)
            };
            println!("  [{}] success_rate={} ({})", candidate.idx, rate, label);
            if let Some(failure) = &candidate.failure {
                println!("      training failed: {}", failure);
            }
        }
        match self.best.and_then(|idx| self.candidates.iter().find(|c| c.idx == idx)) {
            Some(best) => {
                println!("\nBest reward function (candidate {}):", best.idx);
                println!("{}", best.source.as_deref().unwrap_or_default());
            }
            None => println!("\nNo reward function was evaluated."),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(path: Option<&Path>) -> anyhow::Result<ForgeConfig> {
    let mut config = match path {
        Some(path) => ForgeConfig::from_yaml_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?,
        None => ForgeConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn apply_llm_args(config: &mut ForgeConfig, args: &LlmArgs) {
    if let Some(provider) = args.provider {
        config.llm.provider = provider;
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if let Some(model) = &args.critic_model {
        config.llm.critic_model = Some(model.clone());
    }
    if let Some(base) = &args.api_base {
        config.llm.api_base = Some(base.clone());
    }
    if let Some(key) = &args.api_key {
        config.llm.api_key = Some(key.clone());
    }
}

fn apply_training_args(config: &mut ForgeConfig, args: &TrainingArgs) {
    if let Some(steps) = args.timesteps {
        config.training.total_timesteps = steps;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    if args.threshold.is_some() {
        config.training.threshold = args.threshold;
    }
    if let Some(episodes) = args.eval_episodes {
        config.training.eval_episodes = episodes;
    }
    if let Some(dir) = &args.artifact_dir {
        config.training.artifact_dir = Some(dir.clone());
    }
    if args.inline {
        config.training.execution = ExecutionMode::Inline;
    }
    if let Some(secs) = args.job_timeout_secs {
        config.training.job_timeout_secs = Some(secs);
    }
}

fn build_provider(settings: &LlmSettings) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    match settings.provider {
        ProviderKind::Ollama => {
            let base = settings
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE.to_string());
            info!(api_base = %base, model = %settings.model, "Using Ollama");
            Ok(Arc::new(
                OllamaClient::new(base, settings.model.clone()).with_timeout(timeout),
            ))
        }
        ProviderKind::Litellm => {
            let base = settings.api_base.clone().ok_or_else(|| {
                anyhow::anyhow!("The litellm provider needs --api-base or LITELLM_API_BASE")
            })?;
            info!(api_base = %base, model = %settings.model, "Using LiteLLM");
            Ok(Arc::new(
                LiteLlmClient::new(base, settings.api_key.clone(), settings.model.clone())
                    .with_timeout(timeout),
            ))
        }
    }
}

fn task_prompt(env: EnvKind, args: &GenerateArgs) -> TaskPrompt {
    env.default_prompt()
        .with_goal(args.goal.clone())
        .with_observation_space(args.observation_space.clone())
        .with_image(args.image.clone())
}

fn build_controller<T: TaskAdapter>(
    task: Arc<T>,
    config: &ForgeConfig,
    provider: &Arc<dyn LlmProvider>,
    logger: Option<&Arc<dyn RunLogger>>,
    seed: u64,
) -> RefinementController<T, DirectSearch> {
    let backend = Arc::new(DirectSearch::new().with_max_episodes(config.training.max_episodes));
    let mut orchestrator = TrainingOrchestrator::new(
        Arc::clone(&task),
        backend,
        config.orchestrator_config(seed),
    )
    .with_run_context(RunContext::new(task.name(), config.llm.model.clone()));
    if let Some(logger) = logger {
        orchestrator = orchestrator.with_run_logger(Arc::clone(logger));
    }

    let synthesizer = CodeSynthesizer::new(Arc::clone(&task))
        .with_max_attempts(config.synthesis.max_attempts)
        .with_smoke_seed(config.synthesis.smoke_seed)
        .with_streaming(config.llm.stream);
    let session = ChatSession::new(Arc::clone(provider), config.llm.model.clone())
        .with_options(config.llm.options.clone())
        .with_system_prompt(REWARD_DESIGNER_SYSTEM);

    let mut controller = RefinementController::new(orchestrator, synthesizer, session)
        .with_streaming(config.llm.stream);
    if config.refinement.human_feedback {
        controller = controller.with_human_feedback(Box::new(HumanFeedback::stdin()));
    }
    if config.refinement.rollout_description {
        let model = config
            .llm
            .critic_model
            .clone()
            .unwrap_or_else(|| config.llm.model.clone());
        controller = controller.with_rollout_critic(Box::new(
            RolloutCritic::new(Arc::clone(provider), model).with_options(config.llm.options.clone()),
        ));
    }
    controller
}

fn run_logger(config: &ForgeConfig) -> Option<Arc<dyn RunLogger>> {
    config.run_log.path.as_ref().map(|path| {
        info!(path = %path.display(), "Appending candidates to run log");
        Arc::new(JsonlRunLogger::new(path.clone())) as Arc<dyn RunLogger>
    })
}

// ============================================================================
// Generate
// ============================================================================

async fn run_generate_command(args: GenerateArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    apply_llm_args(&mut config, &args.llm);
    apply_training_args(&mut config, &args.training);
    if let Some(n) = args.n_init {
        config.refinement.n_init = n;
    }
    if let Some(n) = args.n_refine {
        config.refinement.n_refine = n;
    }
    if args.focus.is_some() {
        config.refinement.focus = args.focus.clone();
    }
    if let Some(runs) = args.runs {
        config.refinement.runs = runs;
    }
    if let Some(attempts) = args.max_attempts {
        config.synthesis.max_attempts = attempts;
    }
    config.refinement.human_feedback |= args.human_feedback;
    config.refinement.rollout_description |= args.rollout_description;
    if let Some(path) = &args.run_log {
        config.run_log.path = Some(path.clone());
    }
    config.validate()?;

    if args.metrics_file.is_some() {
        init_metrics()?;
    }

    let prompt = task_prompt(args.env, &args);
    let summaries = match args.env {
        EnvKind::CartPole => search(Arc::new(CartPole::new().with_prompt(prompt)), &config).await?,
        EnvKind::MountainCar => {
            search(Arc::new(MountainCar::new().with_prompt(prompt)), &config).await?
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for summary in &summaries {
            summary.print();
        }
    }

    if let Some(path) = &args.metrics_file {
        fs::write(path, export_metrics())?;
        info!(path = %path.display(), "Metrics written");
    }
    Ok(())
}

async fn search<T: TaskAdapter>(
    task: Arc<T>,
    config: &ForgeConfig,
) -> anyhow::Result<Vec<RunSummary>> {
    let provider = build_provider(&config.llm)?;
    let logger = run_logger(config);
    let refinement = &config.refinement;

    let mut summaries = Vec::with_capacity(refinement.runs);
    for run in 0..refinement.runs {
        let seed = config.training.seed + run as u64;
        info!(env = task.name(), run = run, seed = seed, "Starting run");

        let mut controller =
            build_controller(Arc::clone(&task), config, &provider, logger.as_ref(), seed);
        let history = controller
            .generate_reward_function(
                refinement.n_init,
                refinement.n_refine,
                refinement.focus.as_deref(),
            )
            .await?;
        if history.len() == 1 {
            warn!(run = run, "Run produced no reward function");
        }
        summaries.push(RunSummary::new(run, seed, task.name(), &history));
    }
    Ok(summaries)
}

// ============================================================================
// Test reward
// ============================================================================

async fn run_test_reward_command(args: TestRewardArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    apply_training_args(&mut config, &args.training);
    if let Some(path) = &args.run_log {
        config.run_log.path = Some(path.clone());
    }
    config.validate()?;

    let source = fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.file.display(), e))?;

    let summary = match args.env {
        EnvKind::CartPole => test_reward(Arc::new(CartPole::new()), &config, &source).await?,
        EnvKind::MountainCar => test_reward(Arc::new(MountainCar::new()), &config, &source).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        summary.print();
    }
    Ok(())
}

async fn test_reward<T: TaskAdapter>(
    task: Arc<T>,
    config: &ForgeConfig,
    source: &str,
) -> anyhow::Result<RunSummary> {
    let provider = build_provider(&config.llm)?;
    let logger = run_logger(config);
    let seed = config.training.seed;
    let mut controller = build_controller(Arc::clone(&task), config, &provider, logger.as_ref(), seed);

    let candidate = controller.test_reward_func(source).await?;
    info!(
        idx = candidate.idx,
        success_rate = candidate.success_rate().unwrap_or_default(),
        "Reward function evaluated"
    );
    let history = controller.into_candidates();
    Ok(RunSummary::new(0, seed, task.name(), &history))
}

// ============================================================================
// Envs
// ============================================================================

#[derive(Debug, Serialize)]
struct EnvEntry {
    id: &'static str,
    goal: Option<String>,
    observation_space: String,
}

fn run_envs_command(args: EnvsArgs) -> anyhow::Result<()> {
    let entries: Vec<EnvEntry> = EnvKind::all()
        .iter()
        .map(|kind| {
            let prompt = kind.default_prompt();
            EnvEntry {
                id: kind.id(),
                goal: prompt.goal,
                observation_space: prompt.observation_space,
            }
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{}", entry.id);
            if let Some(goal) = &entry.goal {
                println!("  goal: {}", goal.lines().next().unwrap_or_default());
            }
        }
    }
    Ok(())
}
