//! Records exchanged with the collaborator stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ToolPolicyConfig;
use crate::gate::GateSpec;
use crate::status::TaskStatus;

/// A managed, fully configured agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub key: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Concurrent delegations this agent accepts; `None` or `<= 0` means default
    pub max_load: Option<i64>,
    #[serde(default)]
    pub quality_gates: Vec<GateSpec>,
    pub tool_policy: Option<ToolPolicyConfig>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn with_max_load(mut self, max_load: i64) -> Self {
        self.max_load = Some(max_load);
        self
    }

    pub fn with_gate(mut self, gate: GateSpec) -> Self {
        self.quality_gates.push(gate);
        self
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.key)
    }
}

/// Per-user rules attached to a delegation link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// When non-empty, only these users may use the link
    pub user_allow: Vec<String>,
    /// Always refused; wins over `user_allow`
    pub user_deny: Vec<String>,
}

/// Explicit permission for `source` to delegate to `target`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLink {
    pub source_agent_id: String,
    pub target_agent_id: String,
    /// `<= 0` means default
    #[serde(default)]
    pub max_concurrent: i64,
    #[serde(default)]
    pub settings: LinkSettings,
}

impl AgentLink {
    pub fn new(source_agent_id: impl Into<String>, target_agent_id: impl Into<String>) -> Self {
        Self {
            source_agent_id: source_agent_id.into(),
            target_agent_id: target_agent_id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrent(mut self, max: i64) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_settings(mut self, settings: LinkSettings) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub lead_agent_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamTaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// A tracked unit of team work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTask {
    pub id: String,
    pub team_id: String,
    pub subject: String,
    pub status: TeamTaskStatus,
    pub owner_agent_id: Option<String>,
    pub result: Option<String>,
}

impl TeamTask {
    pub fn new(id: impl Into<String>, team_id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            team_id: team_id.into(),
            subject: subject.into(),
            status: TeamTaskStatus::Pending,
            owner_agent_id: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationMode {
    Sync,
    Async,
}

impl DelegationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

/// Persisted outcome of one delegation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationHistory {
    pub id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub team_task_id: Option<String>,
    pub user_id: Option<String>,
    pub task: String,
    pub mode: DelegationMode,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub iterations: u32,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
