//! LLM message model, provider trait and HTTP client

mod client;
mod provider;
mod types;

pub use client::ClaudeClient;
pub use provider::LlmProvider;
pub use types::*;
