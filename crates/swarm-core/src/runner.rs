//! Agent runner contract used for delegated runs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{PeerKind, RunContext};
use crate::Result;

/// A request to run a fully configured named agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub session_key: String,
    pub message: String,
    pub user_id: Option<String>,
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default)]
    pub peer_kind: PeerKind,
    pub run_id: String,
    /// Appended to the agent's own system prompt
    pub extra_system_prompt: Option<String>,
}

/// Result of one agent run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub content: String,
    pub iterations: u32,
}

/// Runs named agents
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, ctx: &RunContext, agent_key: &str, request: RunRequest) -> Result<RunOutput>;
}
