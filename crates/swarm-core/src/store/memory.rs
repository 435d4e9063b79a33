//! In-process implementation of every store trait

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::types::{AgentLink, AgentRecord, DelegationHistory, Team, TeamTask, TeamTaskStatus};
use super::{AgentStore, HistoryStore, LinkStore, SessionStore, TeamStore};
use crate::{Error, Result};

/// In-memory stores, for tests and single-process deployments
#[derive(Default)]
pub struct MemoryStores {
    /// Agents indexed by ID
    agents: RwLock<HashMap<String, AgentRecord>>,
    links: RwLock<Vec<AgentLink>>,
    teams: RwLock<Vec<Team>>,
    team_tasks: RwLock<HashMap<String, TeamTask>>,
    history: RwLock<Vec<DelegationHistory>>,
    sessions: RwLock<HashSet<String>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_agent(&self, agent: AgentRecord) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn add_link(&self, link: AgentLink) {
        let mut links = self.links.write().await;
        links.retain(|l| {
            !(l.source_agent_id == link.source_agent_id && l.target_agent_id == link.target_agent_id)
        });
        links.push(link);
    }

    pub async fn add_team(&self, team: Team) {
        self.teams.write().await.push(team);
    }

    pub async fn add_team_task(&self, task: TeamTask) {
        self.team_tasks.write().await.insert(task.id.clone(), task);
    }

    pub async fn team_task(&self, id: &str) -> Option<TeamTask> {
        self.team_tasks.read().await.get(id).cloned()
    }

    pub async fn add_session(&self, key: impl Into<String>) {
        self.sessions.write().await.insert(key.into());
    }

    pub async fn has_session(&self, key: &str) -> bool {
        self.sessions.read().await.contains(key)
    }

    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }
}

#[async_trait]
impl AgentStore for MemoryStores {
    async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn get_agent_by_key(&self, key: &str) -> Result<Option<AgentRecord>> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .find(|a| a.key == key)
            .cloned())
    }
}

#[async_trait]
impl LinkStore for MemoryStores {
    async fn get_link(&self, source_id: &str, target_id: &str) -> Result<Option<AgentLink>> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .find(|l| l.source_agent_id == source_id && l.target_agent_id == target_id)
            .cloned())
    }

    async fn links_from(&self, source_id: &str) -> Result<Vec<AgentLink>> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .filter(|l| l.source_agent_id == source_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TeamStore for MemoryStores {
    async fn team_for_agent(&self, agent_id: &str) -> Result<Option<Team>> {
        Ok(self
            .teams
            .read()
            .await
            .iter()
            .find(|t| t.lead_agent_id == agent_id || t.member_ids.iter().any(|m| m == agent_id))
            .cloned())
    }

    async fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<()> {
        let mut tasks = self.team_tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::Store(format!("Team task not found: {}", task_id)))?;
        if task.status == TeamTaskStatus::Completed {
            return Err(Error::Store(format!("Team task already completed: {}", task_id)));
        }
        task.status = TeamTaskStatus::InProgress;
        task.owner_agent_id = Some(agent_id.to_string());
        Ok(())
    }

    async fn complete_task(&self, task_id: &str, result: &str) -> Result<()> {
        let mut tasks = self.team_tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::Store(format!("Team task not found: {}", task_id)))?;
        task.status = TeamTaskStatus::Completed;
        task.result = Some(result.to_string());
        debug!("Team task completed: {}", task_id);
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for MemoryStores {
    async fn save_delegation(&self, record: &DelegationHistory) -> Result<()> {
        let mut history = self.history.write().await;
        history.retain(|h| h.id != record.id);
        history.push(record.clone());
        Ok(())
    }

    async fn get_delegation(&self, id: &str) -> Result<Option<DelegationHistory>> {
        Ok(self.history.read().await.iter().find(|h| h.id == id).cloned())
    }

    async fn list_delegations(&self, source_agent_id: &str, limit: usize) -> Result<Vec<DelegationHistory>> {
        let history = self.history.read().await;
        let mut records: Vec<_> = history
            .iter()
            .filter(|h| h.source_agent_id == source_agent_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

#[async_trait]
impl SessionStore for MemoryStores {
    async fn delete_session(&self, key: &str) -> Result<()> {
        self.sessions.write().await.remove(key);
        Ok(())
    }
}
