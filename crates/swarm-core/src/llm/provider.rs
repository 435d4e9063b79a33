//! LLM provider abstraction

use async_trait::async_trait;

use super::types::{ChatRequest, ChatResponse};
use crate::Result;

/// A chat-completion backend.
///
/// Retries and streaming belong to implementations; orchestrators call
/// `chat` once per iteration and treat any error as terminal for the task.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name, used for provider-scoped tool policies
    fn name(&self) -> &str;

    /// Model used when a request carries no override
    fn default_model(&self) -> &str;

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
}
