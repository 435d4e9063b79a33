//! Announce/result routing
//!
//! Background task outcomes are injected back into the originating
//! conversation as inbound system messages. Delegations announce
//! immediately; subagent outcomes for the same (parent, chat) pair are
//! debounced and merged into one message.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use swarm_core::bus::{InboundMessage, MessageBus};
use swarm_core::context::{OriginMeta, PeerKind, TraceLink};
use swarm_core::TaskStatus;

/// Sender id used for subagent announces
pub const SUBAGENT_SENDER: &str = "system:subagent";

/// Sender id used for delegation announces
pub const DELEGATION_SENDER: &str = "system:delegation";

/// Where an announce goes and how it correlates back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceTarget {
    pub channel: String,
    pub chat_id: String,
    pub peer_kind: PeerKind,
    pub user_id: Option<String>,
    /// Parent task / session (subagents) or source agent (delegations)
    pub parent_id: String,
    pub trace: TraceLink,
    pub sender_id: String,
}

impl AnnounceTarget {
    /// `None` when no origin channel was captured
    pub fn from_origin(
        origin: &OriginMeta,
        parent_id: impl Into<String>,
        trace: &TraceLink,
        sender_id: &str,
    ) -> Option<Self> {
        let channel = origin.channel.clone()?;
        Some(Self {
            channel,
            chat_id: origin.chat_id.clone().unwrap_or_default(),
            peer_kind: origin.peer_kind,
            user_id: origin.user_id.clone(),
            parent_id: parent_id.into(),
            trace: trace.clone(),
            sender_id: sender_id.to_string(),
        })
    }

    fn message(&self, content: String) -> InboundMessage {
        let mut msg = InboundMessage::new(&self.channel, &self.chat_id, &self.sender_id, content)
            .with_meta("origin_channel", &self.channel)
            .with_meta("origin_chat_id", &self.chat_id)
            .with_meta("origin_peer_kind", self.peer_kind.as_str())
            .with_meta("parent_id", &self.parent_id);
        msg.peer_kind = self.peer_kind;
        msg.user_id = self.user_id.clone();
        if let Some(user_id) = &self.user_id {
            msg = msg.with_meta("origin_user_id", user_id);
        }
        if let Some(trace_id) = &self.trace.trace_id {
            msg = msg.with_meta("trace_id", trace_id);
        }
        if let Some(span_id) = &self.trace.parent_span_id {
            msg = msg.with_meta("parent_span_id", span_id);
        }
        msg
    }
}

/// One finished task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceItem {
    pub task_id: String,
    pub label: String,
    pub status: TaskStatus,
    pub result: String,
    pub runtime: Duration,
    pub iterations: u32,
}

impl AnnounceItem {
    fn headline(&self) -> String {
        format!(
            "\"{}\" {} in {:.1}s ({} iterations)",
            self.label,
            self.status,
            self.runtime.as_secs_f64(),
            self.iterations
        )
    }
}

/// Message body for a single outcome
pub fn format_single(kind: &str, item: &AnnounceItem) -> String {
    let mut out = format!("[System Message] {} {}.\n", kind, item.headline());
    if !item.result.is_empty() {
        out.push_str("\nResult:\n");
        out.push_str(&item.result);
        out.push('\n');
    }
    out.push_str("\nSummarize this result for the user in your own words.");
    out
}

/// Message body for a merged batch of subagent outcomes
pub fn format_batch(items: &[AnnounceItem], still_running: usize) -> String {
    if let [item] = items {
        if still_running == 0 {
            return format_single("Subagent", item);
        }
    }

    let mut out = format!("[System Message] {} subagent task(s) finished:\n", items.len());
    for (i, item) in items.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n", i + 1, item.headline()));
        if !item.result.is_empty() {
            out.push_str("Result:\n");
            out.push_str(&item.result);
            out.push('\n');
        }
    }
    if still_running > 0 {
        out.push_str(&format!(
            "\n{} subagent task(s) still running. Wait for them before giving a final answer.",
            still_running
        ));
    } else {
        out.push_str("\nAll subagent tasks are done. Summarize the results for the user.");
    }
    out
}

/// Immediate-mode router
#[derive(Clone)]
pub struct AnnounceRouter {
    bus: Arc<dyn MessageBus>,
}

impl AnnounceRouter {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Publish one outcome now. Failures are logged, never returned.
    pub async fn announce(&self, target: &AnnounceTarget, kind: &str, item: &AnnounceItem) {
        let msg = target
            .message(format_single(kind, item))
            .with_meta("task_id", &item.task_id)
            .with_meta("status", item.status.as_str());
        self.publish(msg).await;
    }

    async fn publish(&self, msg: InboundMessage) {
        let chat_id = msg.chat_id.clone();
        if let Err(e) = self.bus.publish_inbound(msg).await {
            warn!(chat_id = %chat_id, "Failed to publish announce: {}", e);
        }
    }
}

struct PendingBatch {
    target: AnnounceTarget,
    items: Vec<AnnounceItem>,
}

/// Running subagents for a parent id
pub type RunningCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Debounced announce queue for subagent outcomes
#[derive(Clone)]
pub struct AnnounceQueue {
    router: AnnounceRouter,
    debounce: Duration,
    pending: Arc<DashMap<(String, String), PendingBatch>>,
    still_running: RunningCounter,
}

impl AnnounceQueue {
    pub fn new(bus: Arc<dyn MessageBus>, debounce: Duration, still_running: RunningCounter) -> Self {
        Self {
            router: AnnounceRouter::new(bus),
            debounce,
            pending: Arc::new(DashMap::new()),
            still_running,
        }
    }

    /// Queue an outcome. The first item for a key starts the debounce timer;
    /// later items within the window join the same batch.
    pub async fn enqueue(&self, target: AnnounceTarget, item: AnnounceItem) {
        if self.debounce.is_zero() {
            self.router.announce(&target, "Subagent", &item).await;
            return;
        }

        let key = (target.parent_id.clone(), target.chat_id.clone());
        let start_timer = {
            let mut started = false;
            self.pending
                .entry(key.clone())
                .and_modify(|batch| batch.items.push(item.clone()))
                .or_insert_with(|| {
                    started = true;
                    PendingBatch {
                        target,
                        items: vec![item],
                    }
                });
            started
        };

        if start_timer {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(queue.debounce).await;
                queue.flush(&key).await;
            });
        }
    }

    /// Publish whatever is queued for `key`
    async fn flush(&self, key: &(String, String)) {
        let Some((_, batch)) = self.pending.remove(key) else {
            return;
        };
        let running = (self.still_running)(&batch.target.parent_id);
        debug!(
            parent_id = %batch.target.parent_id,
            items = batch.items.len(),
            still_running = running,
            "Flushing announce batch"
        );

        let ids: Vec<&str> = batch.items.iter().map(|i| i.task_id.as_str()).collect();
        let msg = batch
            .target
            .message(format_batch(&batch.items, running))
            .with_meta("task_ids", ids.join(","))
            .with_meta("still_running", running.to_string());
        self.router.publish(msg).await;
    }

    /// Number of keys with a batch waiting
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }
}
