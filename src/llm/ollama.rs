//! Client for a local Ollama server's `/api/chat` endpoint.
//!
//! Non-streaming requests return a single JSON object. Streaming requests
//! return newline-delimited JSON chunks, each carrying a fragment of the
//! assistant message, terminated by a chunk with `"done": true`.

use std::env;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::litellm::{
    http_client, Choice, GenerationRequest, GenerationResponse, LlmProvider, Message,
    TokenStream, Usage,
};
use crate::error::LlmError;

pub const DEFAULT_OLLAMA_BASE: &str = "http://localhost:11434";

/// Client for the Ollama chat API.
pub struct OllamaClient {
    api_base: String,
    default_model: String,
    http_client: Client,
}

impl OllamaClient {
    pub fn new(api_base: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
            http_client: http_client(Duration::from_secs(600)),
        }
    }

    /// Reads `OLLAMA_API_BASE`, defaulting to `http://localhost:11434`.
    pub fn from_env(default_model: impl Into<String>) -> Self {
        let api_base =
            env::var("OLLAMA_API_BASE").unwrap_or_else(|_| DEFAULT_OLLAMA_BASE.to_string());
        Self::new(api_base, default_model)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http_client = http_client(timeout);
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn chat_request(&self, request: GenerationRequest, stream: bool) -> ChatRequest {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model
        };
        ChatRequest {
            model,
            messages: request.messages,
            stream,
            options: ChatOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens.map(i64::from),
                seed: request.seed,
            },
        }
    }

    async fn send(&self, body: &ChatRequest) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.api_base);
        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        if status.as_u16() == 404 {
            return Err(LlmError::InvalidModel(message));
        }
        Err(LlmError::ApiError {
            code: status.as_u16(),
            message,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    /// -1 generates until the model stops.
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    model: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Parses one NDJSON line. Blank lines yield `None`.
fn parse_chunk(line: &[u8]) -> Result<Option<ChatChunk>, LlmError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| LlmError::ParseError(format!("Invalid stream chunk: {}", e)))?;
    if let Some(error) = chunk.error {
        return Err(LlmError::ApiError {
            code: 500,
            message: error,
        });
    }
    Ok(Some(chunk))
}

#[async_trait]
impl LlmProvider for OllamaClient {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = self.chat_request(request, false);
        let response = self.send(&body).await?;
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let chunk = parse_chunk(text.as_bytes())?
            .ok_or_else(|| LlmError::ParseError("Empty response body".to_string()))?;

        let message = chunk
            .message
            .map(|m| Message::new(m.role, m.content))
            .unwrap_or_else(|| Message::assistant(""));
        let prompt_tokens = chunk.prompt_eval_count.unwrap_or(0);
        let completion_tokens = chunk.eval_count.unwrap_or(0);

        Ok(GenerationResponse {
            id: chunk.created_at,
            model: chunk.model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason: chunk.done_reason.unwrap_or_else(|| "stop".to_string()),
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream, LlmError> {
        let body = self.chat_request(request, true);
        let response = self.send(&body).await?;
        let mut bytes = response.bytes_stream();

        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut finished = false;
            while !finished {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                let chunk = chunk.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if let Some(parsed) = parse_chunk(&line)? {
                        if let Some(message) = parsed.message {
                            if !message.content.is_empty() {
                                yield message.content;
                            }
                        }
                        if parsed.done {
                            finished = true;
                            break;
                        }
                    }
                }
            }
            if !finished {
                if let Some(parsed) = parse_chunk(&buffer)? {
                    if let Some(message) = parsed.message {
                        if !message.content.is_empty() {
                            yield message.content;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
