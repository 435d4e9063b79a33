//! Subagent Orchestrator
//!
//! Spawns child task executions from a running agent, enforces depth and
//! concurrency limits at admission, runs each task through a bounded
//! LLM/tool loop with a policy-restricted tool view, and routes outcomes
//! back to the originating conversation.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = Arc::new(
//!     SubagentManager::new(config.subagents.clone(), provider)
//!         .with_bus(bus)
//!         .with_tool_policy(config.tools.clone()),
//! );
//! manager.set_tools(tools);
//!
//! let ack = manager.spawn(&ctx, SpawnRequest::new("Summarise the changelog"))?;
//! ```

mod prompt;
mod worker;

pub use prompt::{build_system_prompt, PromptParams};
pub use worker::{LoopOutcome, TaskLoop};

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swarm_core::bus::{BusEvent, MessageBus};
use swarm_core::config::{SubagentConfig, ToolPolicyConfig};
use swarm_core::llm::{LlmProvider, Message};
use swarm_core::store::AgentStore;
use swarm_core::telemetry::{new_id, LogTraceSink, SpanKind, SpanRecord, SpanStatus, TraceSink};
use swarm_core::{
    CallerKind, PolicyEngine, PolicyInputs, RunContext, TaskStatus, ToolManager, TraceLink,
};

use crate::announce::{AnnounceItem, AnnounceQueue, AnnounceTarget, RunningCounter, SUBAGENT_SENDER};
use crate::error::{AgentError, Result};
use crate::registry::{AbandonGuard, TaskRegistry};
use crate::task::{SubagentTask, TaskRecord};

/// Invoked once with a human-readable summary when a spawned task ends
pub type CompletionCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Parameters for [`SubagentManager::spawn`] and [`SubagentManager::run_sync`]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    pub model: Option<String>,
    pub on_complete: Option<CompletionCallback>,
}

impl SpawnRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            label: None,
            model: None,
            on_complete: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    fn label(&self) -> String {
        match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => {
                let mut label: String = self.task.chars().take(40).collect();
                if self.task.chars().count() > 40 {
                    label.push_str("...");
                }
                label
            }
        }
    }
}

/// Returned by a successful async spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnAck {
    pub task_id: String,
    pub message: String,
}

/// Terminal result of a subagent task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub content: String,
    pub iterations: u32,
    pub runtime: Duration,
}

/// A task body's raw result plus its root span
struct Execution {
    outcome: LoopOutcome,
    span: SpanRecord,
    started: Instant,
}

/// Subagent orchestrator
///
/// One instance owns its registry and root cancellation token; several
/// managers can coexist in one process.
pub struct SubagentManager {
    config: SubagentConfig,
    provider: Arc<dyn LlmProvider>,
    /// Shared registry; set after construction since tools may hold a
    /// reference back to this manager
    tools: OnceLock<Arc<ToolManager>>,
    policy: PolicyEngine,
    tool_policy: ToolPolicyConfig,
    /// Source of per-agent tool policies
    agents: Option<Arc<dyn AgentStore>>,
    registry: Arc<TaskRegistry<SubagentTask>>,
    bus: Option<Arc<dyn MessageBus>>,
    announcer: Option<AnnounceQueue>,
    trace: Arc<dyn TraceSink>,
    /// Parent of every detached task token
    root: CancellationToken,
}

impl SubagentManager {
    pub fn new(config: SubagentConfig, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            config,
            provider,
            tools: OnceLock::new(),
            policy: PolicyEngine::default(),
            tool_policy: ToolPolicyConfig::default(),
            agents: None,
            registry: Arc::new(TaskRegistry::new()),
            bus: None,
            announcer: None,
            trace: Arc::new(LogTraceSink),
            root: CancellationToken::new(),
        }
    }

    /// Publish lifecycle events and announces on `bus`
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        let registry = Arc::clone(&self.registry);
        let still_running: RunningCounter = Arc::new(move |parent_id: &str| {
            registry.count_running(|t| !t.sync && t.parent_id == parent_id)
        });
        self.announcer = Some(AnnounceQueue::new(
            Arc::clone(&bus),
            Duration::from_millis(self.config.announce_debounce_ms),
            still_running,
        ));
        self.bus = Some(bus);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    /// Global tool policy applied before the subagent deny sets
    pub fn with_tool_policy(mut self, policy: ToolPolicyConfig) -> Self {
        self.tool_policy = policy;
        self
    }

    /// Apply the calling agent's stored tool policy on top of the global one
    pub fn with_agent_store(mut self, agents: Arc<dyn AgentStore>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_policy_engine(mut self, engine: PolicyEngine) -> Self {
        self.policy = engine;
        self
    }

    pub fn with_tools(self, tools: Arc<ToolManager>) -> Self {
        self.set_tools(tools);
        self
    }

    /// Install the shared tool registry. Only the first call takes effect.
    pub fn set_tools(&self, tools: Arc<ToolManager>) {
        if self.tools.set(tools).is_err() {
            warn!("Subagent tool registry already set, ignoring");
        }
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.config
    }

    /// Start a subagent in the background and return immediately.
    ///
    /// The parent id and depth come from `ctx`; the task runs on a token
    /// derived from this manager's root, so it outlives the calling request.
    pub fn spawn(self: &Arc<Self>, ctx: &RunContext, request: SpawnRequest) -> Result<SpawnAck> {
        let (task, run_ctx) = self.admit(ctx, &request, false)?;
        let task_id = task.id.clone();
        let label = task.label.clone();

        info!(
            task_id = %task.id,
            parent_id = %task.parent_id,
            depth = task.depth,
            "Spawned subagent: {}",
            task.label
        );
        self.broadcast("subagent.started", &task);

        let manager = Arc::clone(self);
        let on_complete = request.on_complete;
        tokio::spawn(async move {
            let execution = manager.execute(&task, &run_ctx).await;
            manager.finalize(task, execution, on_complete).await;
        });

        Ok(SpawnAck {
            message: format!(
                "Spawned subagent '{}' (id: {}). It runs in the background; its result \
                 will be announced in this conversation when it finishes.",
                label, task_id
            ),
            task_id,
        })
    }

    /// Run a subagent and wait for it.
    ///
    /// Not counted against the concurrency limits (the depth limit still
    /// applies). Failures are returned instead of announced.
    pub async fn run_sync(&self, ctx: &RunContext, request: SpawnRequest) -> Result<SubagentOutcome> {
        let (task, run_ctx) = self.admit(ctx, &request, true)?;
        debug!(task_id = %task.id, depth = task.depth, "Running subagent synchronously");
        self.broadcast("subagent.started", &task);

        let guard = AbandonGuard::new(&*self.registry, task.id.as_str(), |abandoned| {
            warn!(task_id = %abandoned.id, "Sync subagent dropped by its caller");
            self.broadcast("subagent.cancelled", abandoned);
        });

        let execution = self.execute(&task, &run_ctx).await;
        let outcome = self.finalize(task, execution, None).await;
        guard.disarm();

        match outcome.status {
            TaskStatus::Completed => Ok(outcome),
            TaskStatus::Cancelled => Err(AgentError::Cancelled),
            _ => Err(AgentError::Execution(outcome.content)),
        }
    }

    /// Admission check and registry insert, under one registry lock
    fn admit(
        &self,
        ctx: &RunContext,
        request: &SpawnRequest,
        sync: bool,
    ) -> Result<(SubagentTask, RunContext)> {
        let parent_id = ctx.parent_id();
        let depth = ctx.depth;
        let max_depth = self.config.max_spawn_depth;
        let max_concurrent = self.config.max_concurrent;
        let max_children = self.config.max_children_per_parent;

        let mut run_ctx = if sync {
            ctx.child()
        } else {
            ctx.detached(&self.root)
        };
        let cancel = run_ctx.cancel.clone();

        let task = self.registry.try_insert_with(|scan| {
            if depth >= max_depth {
                return Err(AgentError::DepthLimit {
                    depth,
                    max: max_depth,
                });
            }
            if !sync {
                if scan.running(|t| !t.sync) >= max_concurrent {
                    return Err(AgentError::ConcurrencyLimit { max: max_concurrent });
                }
                if scan.running(|t| !t.sync && t.parent_id == parent_id) >= max_children {
                    return Err(AgentError::ChildLimit {
                        parent_id: parent_id.clone(),
                        max: max_children,
                    });
                }
            }

            let mut id = new_task_id();
            while scan.contains(&id) {
                id = new_task_id();
            }

            Ok(SubagentTask {
                id,
                parent_id: parent_id.clone(),
                depth: depth + 1,
                label: request.label(),
                task: request.task.clone(),
                model: request.model.clone().or_else(|| self.config.model.clone()),
                status: TaskStatus::Running,
                result: None,
                created_at: Utc::now(),
                completed_at: None,
                origin: ctx.origin.clone(),
                trace: ctx.trace.clone(),
                sync,
                cancel: cancel.clone(),
            })
        });

        let task = match task {
            Ok(task) => task,
            Err(e) => {
                debug!(parent_id = %parent_id, depth, "Subagent admission rejected: {}", e);
                return Err(e);
            }
        };

        run_ctx.task_id = Some(task.id.clone());
        run_ctx.depth = task.depth;
        Ok((task, run_ctx))
    }

    /// Task body: restricted tools, role prompt, bounded loop
    async fn execute(&self, task: &SubagentTask, ctx: &RunContext) -> Execution {
        let started = Instant::now();
        let trace_id = task.trace.trace_id.clone().unwrap_or_else(new_id);
        let span = SpanRecord::start(
            &trace_id,
            task.trace.parent_span_id.clone(),
            SpanKind::Task,
            format!("subagent:{}", task.label),
        )
        .attr("task_id", task.id.as_str())
        .attr("parent_id", task.parent_id.as_str())
        .attr("depth", task.depth);

        let registry = self
            .tools
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(ToolManager::new()));
        let agent_policy = self.agent_tool_policy(ctx).await;
        let layers = PolicyInputs {
            global: Some(&self.tool_policy),
            agent: agent_policy.as_ref(),
            provider: Some(ctx.provider.as_deref().unwrap_or(self.provider.name())),
            group_allow: ctx.group_tool_allow.as_deref(),
        }
        .layers();
        let caller = CallerKind::for_depth(task.depth, self.config.max_spawn_depth);
        let tools = self.policy.filter_tools(&registry, &layers, caller);

        let parent_label = if task.depth > 1 {
            format!("subagent {}", task.parent_id)
        } else {
            ctx.agent
                .as_ref()
                .map(|a| format!("agent '{}'", a.key))
                .unwrap_or_else(|| "the main agent".to_string())
        };
        let system = build_system_prompt(&PromptParams {
            label: &task.label,
            parent_label: &parent_label,
            depth: task.depth,
            max_depth: self.config.max_spawn_depth,
        });
        let messages = vec![Message::system(system), Message::user(task.task.clone())];

        // Spans and nested spawns hang under this task's root span
        let mut loop_ctx = ctx.clone();
        loop_ctx.trace = TraceLink::new(trace_id, Some(span.span_id.clone()));

        let task_loop = TaskLoop {
            provider: self.provider.as_ref(),
            tools: &tools,
            trace: self.trace.as_ref(),
            max_iterations: self.config.max_iterations,
            model: task.model.clone(),
        };
        let outcome = task_loop.run(&loop_ctx, messages).await;

        Execution {
            outcome,
            span,
            started,
        }
    }

    /// Stored policy of the managed agent the task was spawned for
    async fn agent_tool_policy(&self, ctx: &RunContext) -> Option<ToolPolicyConfig> {
        let (agents, agent) = (self.agents.as_ref()?, ctx.agent.as_ref()?);
        match agents.get_agent(&agent.id).await {
            Ok(record) => record.and_then(|r| r.tool_policy),
            Err(e) => {
                warn!(agent = %agent.key, "Failed to load agent tool policy: {}", e);
                None
            }
        }
    }

    /// Record the terminal state, then emit span, event, announce and
    /// callback, then schedule removal
    async fn finalize(
        &self,
        task: SubagentTask,
        execution: Execution,
        on_complete: Option<CompletionCallback>,
    ) -> SubagentOutcome {
        let Execution {
            outcome,
            span,
            started,
        } = execution;
        let runtime = started.elapsed();

        // Absent means an explicit Cancel already took the record
        let transitioned = self
            .registry
            .complete(&task.id, outcome.status, Some(outcome.content.clone()))
            .is_some();
        let status = if transitioned {
            outcome.status
        } else {
            TaskStatus::Cancelled
        };

        let span_status = match status {
            TaskStatus::Completed => SpanStatus::Ok,
            TaskStatus::Cancelled => SpanStatus::Cancelled,
            _ => SpanStatus::Error,
        };
        self.trace.emit(
            span.attr("iterations", outcome.iterations)
                .attr("status", status.as_str())
                .finish(span_status),
        );

        match status {
            TaskStatus::Completed => info!(
                task_id = %task.id,
                iterations = outcome.iterations,
                "Subagent '{}' completed in {}ms",
                task.label,
                runtime.as_millis()
            ),
            _ => warn!(
                task_id = %task.id,
                status = %status,
                "Subagent '{}' ended: {}",
                task.label,
                outcome.content
            ),
        }

        if transitioned {
            let mut finished = task.clone();
            finished.status = status;
            self.broadcast(&format!("subagent.{}", status), &finished);
        }

        if !task.sync {
            let target =
                AnnounceTarget::from_origin(&task.origin, &task.parent_id, &task.trace, SUBAGENT_SENDER);
            match (target, &self.announcer) {
                (Some(target), Some(announcer)) => {
                    let item = AnnounceItem {
                        task_id: task.id.clone(),
                        label: task.label.clone(),
                        status,
                        result: outcome.content.clone(),
                        runtime,
                        iterations: outcome.iterations,
                    };
                    announcer.enqueue(target, item).await;
                }
                _ => debug!(task_id = %task.id, "No announce route for subagent"),
            }
        }

        if let Some(callback) = on_complete {
            callback(format!(
                "Subagent '{}' {} after {} iterations:\n{}",
                task.label, status, outcome.iterations, outcome.content
            ));
        }

        self.schedule_removal(&task.id);

        SubagentOutcome {
            task_id: task.id,
            status,
            content: outcome.content,
            iterations: outcome.iterations,
            runtime,
        }
    }

    fn schedule_removal(&self, task_id: &str) {
        let delay = self.config.archive_after_secs;
        if delay == 0 {
            self.registry.remove(task_id);
            return;
        }
        let registry = Arc::clone(&self.registry);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            registry.remove(&task_id);
        });
    }

    /// Cancel a running task. Returns false for unknown or finished tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.registry.cancel(task_id) {
            Some(task) => {
                info!(task_id = %task_id, "Cancelled subagent '{}'", task.label);
                self.broadcast("subagent.cancelled", &task);
                true
            }
            None => false,
        }
    }

    /// Cancel `task_id` only if it was spawned by `parent_id`
    pub fn cancel_child(&self, parent_id: &str, task_id: &str) -> bool {
        match self.registry.get(task_id) {
            Some(task) if task.parent_id == parent_id => self.cancel(task_id),
            _ => false,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<SubagentTask> {
        self.registry.get(task_id)
    }

    /// Running tasks, optionally limited to one parent, oldest first
    pub fn list_active(&self, parent_id: Option<&str>) -> Vec<SubagentTask> {
        self.list_where(|t| t.is_running() && parent_id.is_none_or(|p| t.parent_id == p))
    }

    /// Running tasks plus finished ones still inside their archive window
    pub fn list(&self, parent_id: Option<&str>) -> Vec<SubagentTask> {
        self.list_where(|t| parent_id.is_none_or(|p| t.parent_id == p))
    }

    fn list_where(&self, pred: impl Fn(&SubagentTask) -> bool) -> Vec<SubagentTask> {
        let mut tasks = self.registry.filter(pred);
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Running background tasks counted against the limits
    pub fn active_count(&self) -> usize {
        self.registry.count_running(|t| !t.sync)
    }

    pub fn active_count_for_parent(&self, parent_id: &str) -> usize {
        self.registry
            .count_running(|t| !t.sync && t.parent_id == parent_id)
    }

    /// Cancel every background task owned by this manager
    pub fn shutdown(&self) {
        info!(active = self.active_count(), "Shutting down subagent manager");
        self.root.cancel();
    }

    fn broadcast(&self, name: &str, task: &SubagentTask) {
        if let Some(bus) = &self.bus {
            bus.broadcast(BusEvent::new(
                name,
                json!({
                    "task_id": task.id,
                    "parent_id": task.parent_id,
                    "label": task.label,
                    "depth": task.depth,
                    "status": task.status.as_str(),
                }),
            ));
        }
    }
}

fn new_task_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("sub-{}", &id[..12])
}
