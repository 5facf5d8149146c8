//! LLM abstraction plus Gemini and Ollama clients.
//!
//! Both clients implement `Generator`: one prompt in, one reply text out (no streaming, no tools).

mod gemini;
mod ollama;

use async_trait::async_trait;

pub use gemini::GeminiClient;
pub use ollama::OllamaClient;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(reqwest::Error),
    #[error("llm api error: {0}")]
    Api(String),
    #[error("llm returned an empty reply")]
    Empty,
}

/// Request URLs can carry credentials, so they are dropped from the error.
impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Request(e.without_url())
    }
}

/// A text generation backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Backend name for logs (e.g. "gemini").
    fn name(&self) -> &str;

    /// Generate a reply for the full prompt.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}
