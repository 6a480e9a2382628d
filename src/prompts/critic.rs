//! Prompts for the rollout critic, a second model that describes what a
//! trained policy actually does.

/// System prompt for the rollout critic.
pub const ROLLOUT_CRITIC_SYSTEM: &str = r#"You are an expert in Reinforcement Learning who analyses the behaviour of trained agents.
You receive a step-by-step trace of one episode. Describe concisely what the agent does, where it fails to reach the goal, and which behaviour the reward function seems to encourage by mistake. Do not write code."#;

const ROLLOUT_TEMPLATE: &str = r#"Environment: {env}
Goal: {goal}
Observation Space:
{observation_space}

Episode trace:
{trace}"#;

/// Prompt asking the critic to describe one recorded episode.
pub fn build_rollout_prompt(env: &str, goal: &str, observation_space: &str, trace: &str) -> String {
    ROLLOUT_TEMPLATE
        .replace("{env}", env)
        .replace("{goal}", goal)
        .replace("{observation_space}", observation_space)
        .replace("{trace}", trace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollout_prompt() {
        let text = build_rollout_prompt("CartPole-v1", "Balance", "obs", "t=0 obs=[0.0]");
        assert!(text.contains("Environment: CartPole-v1"));
        assert!(text.ends_with("t=0 obs=[0.0]"));
    }
}
