//! Error types for swarm-agents

use thiserror::Error;

/// Orchestration errors
///
/// Admission rejections carry the concrete limit and a next step for the
/// caller; they are returned synchronously and never retried here.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(
        "Subagent depth limit reached (depth {depth}, max {max}). \
         Complete this task directly instead of spawning another subagent."
    )]
    DepthLimit { depth: u32, max: u32 },

    #[error(
        "Concurrent subagent limit reached ({max} running). \
         Wait for a running subagent to finish, or handle the task directly."
    )]
    ConcurrencyLimit { max: usize },

    #[error(
        "Subagent limit for '{parent_id}' reached ({max} running). \
         Wait for one of your subagents to finish before spawning another."
    )]
    ChildLimit { parent_id: String, max: usize },

    #[error(
        "Delegation is only available in managed multi-agent mode: \
         the caller has no agent identity."
    )]
    NoAgentContext,

    #[error("Agent not found: '{0}'. Check the agent key against your available delegation targets.")]
    AgentNotFound(String),

    #[error("Agent '{0}' cannot delegate to itself. Handle the task directly.")]
    SelfDelegation(String),

    #[error("No delegation link from '{from}' to '{to}'. {hint}")]
    NoLink { from: String, to: String, hint: String },

    #[error(
        "User '{user_id}' is denied delegation from '{from}' to '{to}'. \
         Handle the task directly or choose a different target."
    )]
    UserDenied { user_id: String, from: String, to: String },

    #[error(
        "User '{user_id}' is not on the allow-list for delegation from '{from}' to '{to}'. \
         Handle the task directly or choose a different target."
    )]
    UserNotAllowed { user_id: String, from: String, to: String },

    #[error(
        "Agent '{agent}' is a member of team '{team}': every delegation must belong to a \
         team task. Create a team task first, then pass its team_task_id."
    )]
    TeamTaskRequired { agent: String, team: String },

    #[error(
        "Delegation link '{from}' -> '{to}' is at capacity ({active}/{max} active). \
         Wait for a running delegation to finish or try a different target."
    )]
    LinkCapacity {
        from: String,
        to: String,
        active: usize,
        max: usize,
    },

    #[error(
        "Agent '{target}' is at capacity ({active}/{max} active delegations). \
         Try again later, pick another agent, or handle the task yourself."
    )]
    TargetCapacity {
        target: String,
        active: usize,
        max: usize,
    },

    #[error("Task failed: {0}")]
    Execution(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] swarm_core::Error),
}

impl AgentError {
    /// True for rejections raised before a task starts
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::DepthLimit { .. }
                | Self::ConcurrencyLimit { .. }
                | Self::ChildLimit { .. }
                | Self::NoAgentContext
                | Self::AgentNotFound(_)
                | Self::SelfDelegation(_)
                | Self::NoLink { .. }
                | Self::UserDenied { .. }
                | Self::UserNotAllowed { .. }
                | Self::TeamTaskRequired { .. }
                | Self::LinkCapacity { .. }
                | Self::TargetCapacity { .. }
        )
    }
}

/// Result type alias for swarm-agents
pub type Result<T> = std::result::Result<T, AgentError>;
