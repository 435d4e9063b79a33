//! Task records held by the orchestrator registries

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use swarm_core::context::{OriginMeta, TraceLink};
use swarm_core::store::DelegationMode;
use swarm_core::TaskStatus;

/// Common surface of registry entries
pub trait TaskRecord: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn status(&self) -> TaskStatus;

    fn cancel_token(&self) -> &CancellationToken;

    /// Move to a terminal state. Returns false (and changes nothing) when the
    /// record is already terminal or `status` is not terminal.
    fn finish(&mut self, status: TaskStatus, result: Option<String>) -> bool;

    fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }
}

/// A spawned subagent
#[derive(Debug, Clone, Serialize)]
pub struct SubagentTask {
    pub id: String,
    pub parent_id: String,
    pub depth: u32,
    pub label: String,
    pub task: String,
    pub model: Option<String>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub origin: OriginMeta,
    pub trace: TraceLink,
    /// RunSync tasks are excluded from concurrency accounting
    pub sync: bool,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl TaskRecord for SubagentTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn finish(&mut self, status: TaskStatus, result: Option<String>) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        if result.is_some() {
            self.result = result;
        }
        self.completed_at = Some(Utc::now());
        true
    }
}

/// A delegation from one named agent to another
#[derive(Debug, Clone, Serialize)]
pub struct DelegationTask {
    pub id: String,
    pub source_agent_id: String,
    pub source_agent_key: String,
    pub target_agent_id: String,
    pub target_agent_key: String,
    pub user_id: Option<String>,
    pub task: String,
    pub team_task_id: Option<String>,
    pub session_key: String,
    pub mode: DelegationMode,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub origin: OriginMeta,
    pub trace: TraceLink,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl TaskRecord for DelegationTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn finish(&mut self, status: TaskStatus, result: Option<String>) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        if result.is_some() {
            self.result = result;
        }
        self.completed_at = Some(Utc::now());
        true
    }
}
