//! OpenAI-compatible chat-completions client.
//!
//! Works with any provider exposing `POST {base_url}/chat/completions`
//! (OpenAI, vLLM, Ollama, LocalAI). HTTP status codes are mapped onto the
//! transient/permanent taxonomy of [`GenerationError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::generator::{Generated, GenerationError, Generator};
use crate::prompt::{Prompt, ResponseFormat, Role};

#[derive(Debug, Clone)]
pub struct HttpGeneratorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for HttpGeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

pub struct HttpGenerator {
    client: Client,
    config: HttpGeneratorConfig,
}

impl HttpGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Result<Self, GenerationError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| GenerationError::Configuration(format!("http client: {e}")))?;

        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatRequest>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormatRequest {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageResponse,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Option<String>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Map a non-success HTTP status onto the failure taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> GenerationError {
    let message = truncate(body, 300);
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GenerationError::Authentication(format!("HTTP {status}: {message}"))
        }
        StatusCode::NOT_FOUND => {
            GenerationError::Configuration(format!("endpoint or model not found: {message}"))
        }
        StatusCode::REQUEST_TIMEOUT => GenerationError::Server {
            status: status.as_u16(),
            message,
        },
        s if s.is_server_error() => GenerationError::Server {
            status: s.as_u16(),
            message,
        },
        s => GenerationError::InvalidRequest(format!("HTTP {s}: {message}")),
    }
}

fn parse_retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        prompt: &Prompt,
        deadline: Duration,
    ) -> Result<Generated, GenerationError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: prompt
                .to_messages()
                .into_iter()
                .map(|m| ChatMessage {
                    role: role_str(m.role),
                    content: m.content,
                })
                .collect(),
            max_tokens: prompt.max_tokens,
            temperature: prompt.temperature,
            response_format: match prompt.format {
                ResponseFormat::Json => Some(ResponseFormatRequest {
                    format_type: "json_object",
                }),
                ResponseFormat::Text => None,
            },
            stream: false,
        };

        let mut http_request = self
            .client
            .post(self.chat_completions_url())
            .timeout(deadline)
            .json(&request);
        if let Some(key) = &self.config.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(deadline)
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, "generation request rejected");
            return Err(classify_status(status, &body, retry_after));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;

        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(GenerationError::EmptyResponse)?;

        Ok(Generated {
            text: content,
            model: chat.model,
        })
    }
}
