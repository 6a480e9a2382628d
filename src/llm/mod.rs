//! Generator clients.
//!
//! [`LlmProvider`] is the seam between the search engine and a language
//! model. Two implementations ship with the crate:
//!
//! - [`OllamaClient`] for a local Ollama server (`/api/chat`, NDJSON streaming)
//! - [`LiteLlmClient`] for any OpenAI-compatible endpoint
//!
//! [`ChatSession`] keeps a conversation with one provider and is what the
//! synthesizer and controller talk to.
//!
//! ```ignore
//! use reward_forge::llm::{ChatSession, OllamaClient};
//! use std::sync::Arc;
//!
//! let client = Arc::new(OllamaClient::from_env("qwen2.5-coder"));
//! let mut session = ChatSession::new(client, "qwen2.5-coder");
//! session.add_message("Write a reward function", "user", &[])?;
//! let reply = session.generate_response(true).await?;
//! ```

pub mod chat;
pub mod litellm;
pub mod ollama;

pub use chat::{ChatSession, GenerationOptions};
pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message,
    TokenStream, Usage,
};
pub use ollama::{OllamaClient, DEFAULT_OLLAMA_BASE};
