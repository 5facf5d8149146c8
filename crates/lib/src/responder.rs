//! Reply generation with a fixed prompt and a fixed fallback.
//!
//! Provider failures never reach the caller: they are logged and replaced by `FALLBACK_REPLY`,
//! so every handled message gets some reply text.

use crate::llm::Generator;
use std::sync::Arc;

/// Sent (and stored) when the provider fails.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't process your message right now. Please try again later.";

/// Frame the user's text as a request to a helpful, concise assistant.
pub fn build_prompt(body: &str) -> String {
    format!(
        "You are a helpful and friendly assistant. Reply clearly and concisely to the following message: \"{}\"",
        body
    )
}

#[derive(Clone)]
pub struct ResponseGenerator {
    backend: Arc<dyn Generator>,
}

impl ResponseGenerator {
    pub fn new(backend: Arc<dyn Generator>) -> Self {
        Self { backend }
    }

    pub async fn generate(&self, body: &str) -> String {
        let prompt = build_prompt(body);
        match self.backend.generate(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("{}: reply generation failed: {}", self.backend.name(), e);
                FALLBACK_REPLY.to_string()
            }
        }
    }
}
