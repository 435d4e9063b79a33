//! Collaborator stores consumed by the orchestrators
//!
//! Agents, links, teams, delegation history and sessions are owned by the
//! host application. The orchestrators only see these traits.

mod memory;
mod sqlite;
mod types;

pub use memory::MemoryStores;
pub use sqlite::SqliteHistoryStore;
pub use types::{
    AgentLink, AgentRecord, DelegationHistory, DelegationMode, LinkSettings, Team, TeamTask,
    TeamTaskStatus,
};

use async_trait::async_trait;

use crate::Result;

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>>;

    async fn get_agent_by_key(&self, key: &str) -> Result<Option<AgentRecord>>;
}

#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Link permitting `source_id` to delegate to `target_id`
    async fn get_link(&self, source_id: &str, target_id: &str) -> Result<Option<AgentLink>>;

    /// Every link originating at `source_id`
    async fn links_from(&self, source_id: &str) -> Result<Vec<AgentLink>>;
}

#[async_trait]
pub trait TeamStore: Send + Sync {
    async fn team_for_agent(&self, agent_id: &str) -> Result<Option<Team>>;

    /// Mark a team task as in progress, owned by `agent_id`
    async fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<()>;

    async fn complete_task(&self, task_id: &str, result: &str) -> Result<()>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save_delegation(&self, record: &DelegationHistory) -> Result<()>;

    async fn get_delegation(&self, id: &str) -> Result<Option<DelegationHistory>>;

    /// Most recent first
    async fn list_delegations(&self, source_agent_id: &str, limit: usize) -> Result<Vec<DelegationHistory>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn delete_session(&self, key: &str) -> Result<()>;
}
