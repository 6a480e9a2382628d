//! Stateful chat session over an [`LlmProvider`].
//!
//! The session keeps the whole conversation and replays it on every request,
//! so repair prompts see the code they are repairing.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::litellm::{GenerationRequest, LlmProvider, Message};
use crate::error::LlmError;
use crate::metrics::MetricsCollector;

/// Sampling options applied to every request of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub top_p: f64,
    /// Maximum completion tokens; negative means unbounded.
    pub num_predict: i64,
    pub seed: Option<u64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.9,
            num_predict: -1,
            seed: Some(0),
        }
    }
}

/// Conversation with a single model.
pub struct ChatSession {
    provider: Arc<dyn LlmProvider>,
    model: String,
    options: GenerationOptions,
    messages: Vec<Message>,
    metrics: MetricsCollector,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            options: GenerationOptions::default(),
            messages: Vec::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.messages.insert(0, Message::system(prompt));
        self
    }

    /// Model name as sent to the provider, falling back to its default.
    pub fn model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Appends a message. Image files are read and base64-encoded.
    pub fn add_message(
        &mut self,
        text: impl Into<String>,
        role: &str,
        images: &[&Path],
    ) -> Result<(), LlmError> {
        let encoded = images
            .iter()
            .map(|path| encode_image(path))
            .collect::<Result<Vec<_>, _>>()?;
        self.messages
            .push(Message::new(role, text).with_images(encoded));
        Ok(())
    }

    /// Requests a completion for the conversation so far and appends it.
    pub async fn generate_response(&mut self, stream: bool) -> Result<String, LlmError> {
        let mut request = GenerationRequest::new(self.model.clone(), self.messages.clone())
            .with_temperature(self.options.temperature)
            .with_top_p(self.options.top_p);
        if self.options.num_predict > 0 {
            request = request.with_max_tokens(self.options.num_predict.min(u32::MAX as i64) as u32);
        }
        if let Some(seed) = self.options.seed {
            request = request.with_seed(seed);
        }

        debug!(
            model = self.model(),
            messages = self.messages.len(),
            stream = stream,
            "Requesting completion"
        );
        let started = Instant::now();
        let result = if stream {
            self.collect_stream(request).await
        } else {
            self.provider.generate(request).await.and_then(|response| {
                response
                    .first_content()
                    .map(str::to_string)
                    .ok_or_else(|| LlmError::ParseError("No content in LLM response".to_string()))
            })
        };
        let latency = started.elapsed().as_secs_f64();
        self.metrics
            .record_llm_request(self.model(), result.is_ok(), latency);

        let text = result?;
        info!(
            model = self.model(),
            chars = text.len(),
            latency_secs = latency,
            "Completion received"
        );
        self.messages.push(Message::assistant(text.clone()));
        Ok(text)
    }

    async fn collect_stream(&self, request: GenerationRequest) -> Result<String, LlmError> {
        let mut stream = self.provider.generate_stream(request).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

fn encode_image(path: &Path) -> Result<String, LlmError> {
    let bytes = std::fs::read(path).map_err(|e| LlmError::Attachment {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, GenerationResponse, Usage};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Echoes the number of messages it received and records the last request.
    #[derive(Default)]
    struct RecordingProvider {
        last: Mutex<Option<GenerationRequest>>,
    }

    #[async_trait]
    impl LlmProvider for RecordingProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let reply = format!("seen {}", request.messages.len());
            *self.last.lock().unwrap() = Some(request);
            Ok(GenerationResponse {
                id: "r".to_string(),
                model: "mock".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(reply),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage::default(),
            })
        }

        fn default_model(&self) -> &str {
            "mock-default"
        }
    }

    #[tokio::test]
    async fn test_conversation_accumulates() {
        let provider = Arc::new(RecordingProvider::default());
        let mut session =
            ChatSession::new(provider.clone(), "").with_system_prompt("You design rewards.");
        assert_eq!(session.model(), "mock-default");

        session.add_message("first", "user", &[]).unwrap();
        assert_eq!(session.generate_response(false).await.unwrap(), "seen 2");
        session.add_message("second", "user", &[]).unwrap();
        assert_eq!(session.generate_response(true).await.unwrap(), "seen 4");

        let roles: Vec<&str> = session.messages().iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user", "assistant"]);

        let last = provider.last.lock().unwrap().clone().unwrap();
        assert_eq!(last.temperature, Some(0.8));
        assert_eq!(last.top_p, Some(0.9));
        assert_eq!(last.max_tokens, None);
        assert_eq!(last.seed, Some(0));
    }

    #[test]
    fn test_image_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("frame.png");
        std::fs::write(&image, b"abc").unwrap();

        let mut session = ChatSession::new(Arc::new(RecordingProvider::default()), "m");
        session
            .add_message("look", "user", &[image.as_path()])
            .unwrap();
        assert_eq!(
            session.messages()[0].images.as_deref(),
            Some(&["YWJj".to_string()][..])
        );

        let missing = dir.path().join("missing.png");
        assert!(matches!(
            session.add_message("x", "user", &[missing.as_path()]),
            Err(LlmError::Attachment { .. })
        ));
        assert_eq!(session.messages().len(), 1);
    }
}
