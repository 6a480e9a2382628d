//! Prompts for generating, repairing and refining reward functions.

use crate::candidate::Performances;
use crate::env::TaskPrompt;

/// System prompt establishing the reward-designer role.
pub const REWARD_DESIGNER_SYSTEM: &str = r#"You are an expert in Reinforcement Learning specialized in designing reward functions.
Strict criteria:
- Complete ONLY the reward function code
- Use Python format
- Give no additional explanations
- Focus on the Gymnasium environment
- Take into account the observation of the state and the is_success and is_failure booleans
- Use only numpy (as np) and math
- STOP immediately your completion after the last return"#;

const INITIAL_TEMPLATE: &str = r#"Complete the reward function for a {env} environment.
Task Description: {goal}
Observation Space:
{observation_space}
{focus}
Proposal number {iteration}: it must differ from the previous proposals.

complete this sentence:
def reward_func(observations: np.ndarray, is_success: bool, is_failure: bool) -> float:
    """Reward function for {env}

    Args:
        observations (np.ndarray): observation on the current state
        is_success (bool): True on the last step of an episode that reached the goal
        is_failure (bool): True on the last step of an episode that failed

    Returns:
        float: The reward for the current step
    """"#;

const REFINEMENT_TEMPLATE: &str = r#"improve the reward function to:
- Increase success rate
- Optimize reward signal
- Maintain task objectives
Task Description: {goal}

your best reward function:
{source}

performance:
{performances}
{feedback}"#;

const REPAIR_TEMPLATE: &str = r#"The reward function you wrote cannot be used:
{error}

Rewrite the complete function `def reward_func(observations, is_success, is_failure)` fixing this problem.
Only use numpy (as np), math and Python builtins. Loops must be `for` loops."#;

/// Optional extra material for a refinement prompt.
#[derive(Debug, Clone, Default)]
pub struct RefinementFeedback {
    /// Comment typed by a human reviewer.
    pub human: Option<String>,
    /// Description of a recorded rollout of the trained policy.
    pub rollout_description: Option<String>,
}

fn goal_text(prompt: &TaskPrompt) -> &str {
    prompt.goal.as_deref().unwrap_or("not specified")
}

/// Prompt asking for a first reward function.
pub fn build_initial_prompt(
    env_name: &str,
    prompt: &TaskPrompt,
    iteration: usize,
    focus: Option<&str>,
) -> String {
    let focus = focus
        .filter(|f| !f.trim().is_empty())
        .map(|f| format!("Focus: {}\n", f.trim()))
        .unwrap_or_default();
    INITIAL_TEMPLATE
        .replace("{env}", env_name)
        .replace("{goal}", goal_text(prompt))
        .replace("{observation_space}", &prompt.observation_space)
        .replace("{focus}", &focus)
        .replace("{iteration}", &iteration.to_string())
}

/// Prompt asking to improve an evaluated reward function.
pub fn build_refinement_prompt(
    prompt: &TaskPrompt,
    source: &str,
    performances: &Performances,
    feedback: &RefinementFeedback,
) -> String {
    let mut extra = String::new();
    if let Some(comment) = feedback.human.as_deref().filter(|c| !c.trim().is_empty()) {
        extra.push_str(&format!("\nhuman feedback:\n{}\n", comment.trim()));
    }
    if let Some(description) = feedback.rollout_description.as_deref() {
        extra.push_str(&format!(
            "\ndescription of the trained agent's behaviour:\n{}\n",
            description.trim()
        ));
    }
    REFINEMENT_TEMPLATE
        .replace("{goal}", goal_text(prompt))
        .replace("{source}", source)
        .replace("{performances}", &performances.describe())
        .replace("{feedback}", &extra)
}

/// Prompt reporting why generated code was rejected.
pub fn build_repair_prompt(error: &str) -> String {
    REPAIR_TEMPLATE.replace("{error}", error)
}
