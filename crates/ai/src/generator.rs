use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use chorus_core::FailureKind;

use crate::prompt::Prompt;

/// Text returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generated {
    pub text: String,

    /// Model that produced the text, when the provider reports it.
    pub model: Option<String>,
}

impl Generated {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }

    /// Parse the text as a JSON object.
    ///
    /// Tolerates a surrounding Markdown code fence, which models add even when
    /// asked not to. Anything else that fails to parse is `Malformed`.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, GenerationError> {
        let trimmed = strip_code_fence(self.text.trim());
        serde_json::from_str(trimmed).map_err(|e| GenerationError::Malformed(e.to_string()))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Generation failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected credentials: {0}")]
    Authentication(String),

    #[error("provider misconfigured: {0}")]
    Configuration(String),

    #[error("provider rejected the request: {0}")]
    InvalidRequest(String),

    #[error("provider returned an empty response")]
    EmptyResponse,

    #[error("provider returned a malformed response: {0}")]
    Malformed(String),
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GenerationError::RateLimited { .. }
            | GenerationError::Server { .. }
            | GenerationError::Timeout(_)
            | GenerationError::Transport(_)
            | GenerationError::EmptyResponse
            | GenerationError::Malformed(_) => FailureKind::Transient,
            GenerationError::Authentication(_)
            | GenerationError::Configuration(_)
            | GenerationError::InvalidRequest(_) => FailureKind::Permanent,
        }
    }

    /// Provider-supplied hint for when to try again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerationError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// The external generation capability.
///
/// Implementations should honour `deadline` themselves where the transport
/// allows it; [`generate_bounded`] enforces it regardless.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    async fn generate(&self, prompt: &Prompt, deadline: Duration)
        -> Result<Generated, GenerationError>;
}

/// Call `generator` with a hard deadline and reject blank output.
pub async fn generate_bounded(
    generator: &dyn Generator,
    prompt: &Prompt,
    deadline: Duration,
) -> Result<Generated, GenerationError> {
    let generated = tokio::time::timeout(deadline, generator.generate(prompt, deadline))
        .await
        .map_err(|_| GenerationError::Timeout(deadline))??;

    if generated.text.trim().is_empty() {
        return Err(GenerationError::EmptyResponse);
    }
    Ok(generated)
}
