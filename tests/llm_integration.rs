//! Integration tests against a live generator.
//!
//! These tests talk to a local Ollama server (`OLLAMA_API_BASE`, default
//! `http://localhost:11434`) with the model in `FORGE_MODEL`
//! (default `qwen2.5-coder`).
//! Run with: cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use reward_forge::env::{CartPole, TaskAdapter};
use reward_forge::llm::{
    ChatSession, GenerationRequest, LiteLlmClient, LlmProvider, Message, OllamaClient,
};
use reward_forge::prompts::{build_initial_prompt, REWARD_DESIGNER_SYSTEM};
use reward_forge::synthesis::CodeSynthesizer;
use reward_forge::LlmError;

fn test_model() -> String {
    std::env::var("FORGE_MODEL").unwrap_or_else(|_| "qwen2.5-coder".to_string())
}

fn create_test_client() -> OllamaClient {
    OllamaClient::from_env(test_model())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        test_model(),
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.first_content().expect("Should have content");
    assert!(
        content.contains('4'),
        "Response should contain '4', got: {}",
        content
    );
}

#[tokio::test]
#[ignore]
async fn test_streamed_session() {
    let client: Arc<dyn LlmProvider> = Arc::new(create_test_client());
    let mut session = ChatSession::new(client, test_model())
        .with_system_prompt("You are a math tutor. Be concise.");

    session
        .add_message("What is 3 times 4? Reply with just the number.", "user", &[])
        .expect("Should add message");
    let reply = session.generate_response(true).await;
    assert!(reply.is_ok(), "Streaming failed: {:?}", reply.err());
    assert!(reply.expect("Should have reply").contains("12"));
    assert_eq!(session.messages().len(), 3);
}

#[tokio::test]
#[ignore]
async fn test_reward_function_synthesis() {
    let client: Arc<dyn LlmProvider> = Arc::new(create_test_client());
    let task = Arc::new(CartPole::new());
    let mut session = ChatSession::new(client, test_model())
        .with_system_prompt(REWARD_DESIGNER_SYSTEM);

    session
        .add_message(
            build_initial_prompt(task.name(), task.prompt(), 1, None),
            "user",
            &[],
        )
        .expect("Should add message");
    let raw = session
        .generate_response(true)
        .await
        .expect("Should have completion");

    let reward = CodeSynthesizer::new(task)
        .synthesize(&mut session, &raw)
        .await;
    assert!(reward.is_ok(), "Synthesis failed: {:?}", reward.err());
}

#[tokio::test]
async fn test_unreachable_server() {
    let client = OllamaClient::new("http://127.0.0.1:9", "missing-model");
    let request = GenerationRequest::new("", vec![Message::user("hello")]);

    let result = client.generate(request).await;
    assert!(matches!(result, Err(LlmError::RequestFailed(_))));
}

#[tokio::test]
#[ignore]
async fn test_litellm_generation() {
    let client = LiteLlmClient::from_env().expect("LITELLM_API_BASE must be set");
    let request = GenerationRequest::new(
        test_model(),
        vec![Message::user("Reply with the single word: ready")],
    )
    .with_max_tokens(5);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());
}
