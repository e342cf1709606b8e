use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::generator::{Generated, GenerationError, Generator};
use crate::prompt::Prompt;

/// Generator that replays queued responses.
///
/// Intended for tests/dev. Every call records its prompt; once the script is
/// exhausted the fallback text is returned.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Generated, GenerationError>>>,
    prompts: Mutex<Vec<Prompt>>,
    fallback: String,
    latency: Option<Duration>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            fallback: "scripted response".to_string(),
            latency: None,
        }
    }

    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(Ok(Generated::text(text)))
    }

    pub fn then_error(self, error: GenerationError) -> Self {
        self.then(Err(error))
    }

    pub fn then(self, response: Result<Generated, GenerationError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = text.into();
        self
    }

    /// Sleep before answering (pair with a paused tokio clock in tests).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &Prompt,
        _deadline: Duration,
    ) -> Result<Generated, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Generated::text(self.fallback.clone())))
    }
}
