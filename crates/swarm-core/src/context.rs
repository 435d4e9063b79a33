//! Per-invocation run context
//!
//! A [`RunContext`] travels with every tool call and orchestrated run. It
//! carries the cancellation token plus the metadata captured from the
//! originating conversation, so detached work can still route results back.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Kind of conversation a request originated from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    #[default]
    Direct,
    Group,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

/// Where a request came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMeta {
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default)]
    pub peer_kind: PeerKind,
    pub user_id: Option<String>,
}

impl OriginMeta {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            chat_id: Some(chat_id.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_peer_kind(mut self, peer_kind: PeerKind) -> Self {
        self.peer_kind = peer_kind;
        self
    }
}

/// Trace linkage for nested observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceLink {
    pub trace_id: Option<String>,
    /// Span that new spans should hang under
    pub parent_span_id: Option<String>,
}

impl TraceLink {
    pub fn new(trace_id: impl Into<String>, parent_span_id: Option<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            parent_span_id,
        }
    }
}

/// Identity of the managed agent a run belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub key: String,
}

/// Cancellation-aware context passed to tools and orchestrators
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
    /// Present only in managed multi-agent mode
    pub agent: Option<AgentIdentity>,
    /// Task id when running inside a subagent
    pub task_id: Option<String>,
    /// Subagent nesting depth of the caller (0 = top-level agent)
    pub depth: u32,
    pub session_key: Option<String>,
    /// Provider name, for provider-scoped tool policies
    pub provider: Option<String>,
    /// Tool allow-list attached to the originating chat group
    pub group_tool_allow: Option<Vec<String>>,
    pub origin: OriginMeta,
    pub trace: TraceLink,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, id: impl Into<String>, key: impl Into<String>) -> Self {
        self.agent = Some(AgentIdentity {
            id: id.into(),
            key: key.into(),
        });
        self
    }

    pub fn with_origin(mut self, origin: OriginMeta) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_trace(mut self, trace: TraceLink) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_group_tool_allow(mut self, allow: Vec<String>) -> Self {
        self.group_tool_allow = Some(allow);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same metadata, cancelled whenever `self` is cancelled
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Same metadata, re-parented onto `root` so it outlives the caller
    pub fn detached(&self, root: &CancellationToken) -> Self {
        Self {
            cancel: root.child_token(),
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Identifier children spawned from this context are attributed to
    pub fn parent_id(&self) -> String {
        self.task_id
            .clone()
            .or_else(|| self.session_key.clone())
            .or_else(|| self.agent.as_ref().map(|a| a.key.clone()))
            .unwrap_or_else(|| "default".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_is_cancelled_with_parent() {
        let parent = RunContext::new();
        let child = parent.child();
        parent.cancel.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_detached_survives_caller_cancellation() {
        let root = CancellationToken::new();
        let caller = RunContext::new().with_origin(OriginMeta::new("telegram", "42"));
        let detached = caller.detached(&root);

        caller.cancel.cancel();
        assert!(!detached.is_cancelled());
        assert_eq!(detached.origin.chat_id.as_deref(), Some("42"));

        root.cancel();
        assert!(detached.is_cancelled());
    }

    #[test]
    fn test_parent_id_precedence() {
        let ctx = RunContext::new().with_agent("uuid-1", "writer");
        assert_eq!(ctx.parent_id(), "writer");

        let ctx = ctx.with_session_key("agent:writer:telegram:42");
        assert_eq!(ctx.parent_id(), "agent:writer:telegram:42");

        let mut ctx = ctx;
        ctx.task_id = Some("subagent-1".to_string());
        assert_eq!(ctx.parent_id(), "subagent-1");

        assert_eq!(RunContext::new().parent_id(), "default");
    }
}
