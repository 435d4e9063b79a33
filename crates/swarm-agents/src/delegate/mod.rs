//! Delegate Orchestrator
//!
//! Routes a task from one named agent to another over an explicit
//! permission link. Both the sync and async paths share resolution
//! (`prepare_delegation`) and admission; they differ in who waits for the
//! result and how it is reported.
//!
//! # Example
//!
//! ```rust,ignore
//! let stores = Arc::new(MemoryStores::new());
//! let manager = Arc::new(
//!     DelegateManager::new(config.delegation.clone(), runner, stores.clone(), stores.clone())
//!         .with_history_store(stores.clone())
//!         .with_bus(bus),
//! );
//!
//! let result = manager
//!     .delegate(&ctx, DelegateOptions::new("reviewer", "Review the release notes"))
//!     .await?;
//! ```

mod prepare;
mod quality;

pub use quality::feedback_message;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swarm_core::bus::{BusEvent, MessageBus};
use swarm_core::config::DelegationConfig;
use swarm_core::gate::HookEvaluator;
use swarm_core::runner::{AgentRunner, RunOutput, RunRequest};
use swarm_core::store::{
    AgentStore, DelegationHistory, DelegationMode, HistoryStore, LinkStore, SessionStore, TeamStore,
};
use swarm_core::telemetry::{new_id, LogTraceSink, SpanKind, SpanRecord, SpanStatus, TraceSink};
use swarm_core::{RunContext, TaskStatus, TraceLink};

use crate::announce::{AnnounceItem, AnnounceRouter, AnnounceTarget, DELEGATION_SENDER};
use crate::error::{AgentError, Result};
use crate::registry::{AbandonGuard, TaskRegistry};
use crate::task::DelegationTask;
use prepare::Prepared;

/// Parameters for [`DelegateManager::delegate`] and [`DelegateManager::delegate_async`]
#[derive(Debug, Clone, Default)]
pub struct DelegateOptions {
    /// Key of the agent that should do the work
    pub target_agent_key: String,
    pub task: String,
    /// Required when the source agent belongs to a team
    pub team_task_id: Option<String>,
    /// Extra background appended to the target's system prompt
    pub context: Option<String>,
}

impl DelegateOptions {
    pub fn new(target_agent_key: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            target_agent_key: target_agent_key.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    pub fn with_team_task(mut self, team_task_id: impl Into<String>) -> Self {
        self.team_task_id = Some(team_task_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Result of a completed sync delegation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateResult {
    pub delegation_id: String,
    pub target_agent_key: String,
    pub content: String,
    pub iterations: u32,
    pub duration: Duration,
}

/// Returned by an admitted async delegation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateAck {
    pub delegation_id: String,
    pub target_agent_key: String,
    pub message: String,
}

/// Fixed inputs of one delegated run, shared by the first run and any
/// quality-gate re-runs
pub(crate) struct TargetRun<'a> {
    task: &'a DelegationTask,
    prepared: &'a Prepared,
    ctx: RunContext,
    extra_system_prompt: String,
}

impl TargetRun<'_> {
    /// One runner invocation, abandoned when the task is cancelled
    async fn invoke(
        &self,
        runner: &dyn AgentRunner,
        message: String,
    ) -> swarm_core::Result<RunOutput> {
        let task = self.task;
        let request = RunRequest {
            session_key: task.session_key.clone(),
            message,
            user_id: task.user_id.clone(),
            channel: task.origin.channel.clone(),
            chat_id: task.origin.chat_id.clone(),
            peer_kind: task.origin.peer_kind,
            run_id: Uuid::new_v4().to_string(),
            extra_system_prompt: Some(self.extra_system_prompt.clone()),
        };

        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(swarm_core::Error::Cancelled),
            output = runner.run(&self.ctx, &task.target_agent_key, request) => output,
        }
    }
}

/// A run's raw outcome plus its root span
struct Execution {
    outcome: swarm_core::Result<RunOutput>,
    span: SpanRecord,
    started: Instant,
}

/// Terminal state of one delegation
#[derive(Debug, Clone)]
struct Finished {
    status: TaskStatus,
    content: String,
    iterations: u32,
    duration: Duration,
}

/// Delegate orchestrator
///
/// Owns its registry and root cancellation token. Stores, bus, evaluator
/// and trace sink are injected; everything except the agent and link
/// stores is optional.
pub struct DelegateManager {
    config: DelegationConfig,
    runner: Arc<dyn AgentRunner>,
    agents: Arc<dyn AgentStore>,
    links: Arc<dyn LinkStore>,
    teams: Option<Arc<dyn TeamStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    evaluator: Option<Arc<dyn HookEvaluator>>,
    bus: Option<Arc<dyn MessageBus>>,
    router: Option<AnnounceRouter>,
    trace: Arc<dyn TraceSink>,
    registry: Arc<TaskRegistry<DelegationTask>>,
    /// Session keys of completed delegations awaiting cleanup
    completed_sessions: Mutex<Vec<String>>,
    seq: AtomicU64,
    root: CancellationToken,
}

impl DelegateManager {
    pub fn new(
        config: DelegationConfig,
        runner: Arc<dyn AgentRunner>,
        agents: Arc<dyn AgentStore>,
        links: Arc<dyn LinkStore>,
    ) -> Self {
        Self {
            config,
            runner,
            agents,
            links,
            teams: None,
            history: None,
            sessions: None,
            evaluator: None,
            bus: None,
            router: None,
            trace: Arc::new(LogTraceSink),
            registry: Arc::new(TaskRegistry::new()),
            completed_sessions: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            root: CancellationToken::new(),
        }
    }

    /// Enables team-task attribution and auto-completion
    pub fn with_team_store(mut self, teams: Arc<dyn TeamStore>) -> Self {
        self.teams = Some(teams);
        self
    }

    pub fn with_history_store(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Quality gates are skipped without an evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn HookEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.router = Some(AnnounceRouter::new(Arc::clone(&bus)));
        self.bus = Some(bus);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    /// Delegate and wait for the result.
    ///
    /// The run is cancelled with `ctx`. Failures are returned; history is
    /// recorded either way.
    pub async fn delegate(&self, ctx: &RunContext, opts: DelegateOptions) -> Result<DelegateResult> {
        let prepared = self.prepare_delegation(ctx, &opts).await?;
        let task = self.admit(ctx, &prepared, &opts, DelegationMode::Sync)?;
        let guard = AbandonGuard::new(&*self.registry, task.id.as_str(), |abandoned| {
            warn!(delegation_id = %abandoned.id, "Sync delegation dropped by its caller");
            self.broadcast("delegation.cancelled", abandoned, TaskStatus::Cancelled);
        });
        self.start(&task).await;

        let execution = self.execute(&task, &prepared, &opts).await;
        let finished = self.finalize(&task, execution).await;
        guard.disarm();

        match finished.status {
            TaskStatus::Completed => Ok(DelegateResult {
                delegation_id: task.id,
                target_agent_key: task.target_agent_key,
                content: finished.content,
                iterations: finished.iterations,
                duration: finished.duration,
            }),
            TaskStatus::Cancelled => Err(AgentError::Cancelled),
            _ => Err(AgentError::Execution(finished.content)),
        }
    }

    /// Delegate in the background and return once admitted.
    ///
    /// The outcome is announced into the originating conversation. The run
    /// is detached from `ctx` and only stops on [`cancel`](Self::cancel) or
    /// [`shutdown`](Self::shutdown).
    pub async fn delegate_async(
        self: &Arc<Self>,
        ctx: &RunContext,
        opts: DelegateOptions,
    ) -> Result<DelegateAck> {
        let prepared = self.prepare_delegation(ctx, &opts).await?;
        let task = self.admit(ctx, &prepared, &opts, DelegationMode::Async)?;
        self.start(&task).await;

        let ack = DelegateAck {
            delegation_id: task.id.clone(),
            target_agent_key: task.target_agent_key.clone(),
            message: format!(
                "Delegated to '{}' (id: {}). The result will be announced in this conversation \
                 when it is ready; continue with other work meanwhile.",
                task.target_agent_key, task.id
            ),
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let execution = manager.execute(&task, &prepared, &opts).await;
            let finished = manager.finalize(&task, execution).await;
            manager.announce(&task, &finished).await;

            if finished.status == TaskStatus::Completed {
                manager.complete_team_task(&task, &finished.content).await;
                manager.flush_completed_sessions().await;
            }
        });

        Ok(ack)
    }

    /// Capacity checks and registry insert, under one registry lock
    fn admit(
        &self,
        ctx: &RunContext,
        prepared: &Prepared,
        opts: &DelegateOptions,
        mode: DelegationMode,
    ) -> Result<DelegationTask> {
        let source = &prepared.source;
        let target = &prepared.target;
        let cancel = match mode {
            DelegationMode::Sync => ctx.child().cancel,
            DelegationMode::Async => ctx.detached(&self.root).cancel,
        };

        let task = self.registry.try_insert_with(|scan| {
            let link_active = scan.running(|t| {
                t.source_agent_id == source.id && t.target_agent_id == target.id
            });
            if link_active >= prepared.link_max {
                return Err(AgentError::LinkCapacity {
                    from: source.key.clone(),
                    to: target.key.clone(),
                    active: link_active,
                    max: prepared.link_max,
                });
            }

            let target_active = scan.running(|t| t.target_agent_id == target.id);
            if target_active >= prepared.target_max {
                return Err(AgentError::TargetCapacity {
                    target: target.key.clone(),
                    active: target_active,
                    max: prepared.target_max,
                });
            }

            let mut id = self.next_id(prepared);
            while scan.contains(&id) {
                id = self.next_id(prepared);
            }

            Ok(DelegationTask {
                session_key: format!("delegate:{}:{}:{}", source.key, target.key, id),
                id,
                source_agent_id: source.id.clone(),
                source_agent_key: source.key.clone(),
                target_agent_id: target.id.clone(),
                target_agent_key: target.key.clone(),
                user_id: prepared.user_id.clone(),
                task: opts.task.clone(),
                team_task_id: prepared.team_task_id.clone(),
                mode,
                status: TaskStatus::Running,
                result: None,
                created_at: Utc::now(),
                completed_at: None,
                origin: ctx.origin.clone(),
                trace: ctx.trace.clone(),
                cancel: cancel.clone(),
            })
        });

        if let Err(e) = &task {
            debug!(
                source = %source.key,
                target = %target.key,
                "Delegation admission rejected: {}",
                e
            );
        }
        task
    }

    /// Ids hash the link, user and a clock/sequence pair
    fn next_id(&self, prepared: &Prepared) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let name = format!(
            "{}|{}|{}|{}|{}",
            prepared.source.id,
            prepared.target.id,
            prepared.user_id.as_deref().unwrap_or(""),
            nanos,
            seq
        );
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
            .simple()
            .to_string();
        id[..12].to_string()
    }

    /// Claim the team task and announce the start
    async fn start(&self, task: &DelegationTask) {
        info!(
            delegation_id = %task.id,
            source = %task.source_agent_key,
            target = %task.target_agent_key,
            mode = task.mode.as_str(),
            "Delegation started"
        );

        if let (Some(teams), Some(team_task_id)) = (&self.teams, &task.team_task_id) {
            if let Err(e) = teams.claim_task(team_task_id, &task.target_agent_id).await {
                warn!(
                    delegation_id = %task.id,
                    team_task_id = %team_task_id,
                    "Failed to claim team task: {}",
                    e
                );
            }
        }

        self.broadcast("delegation.started", task, TaskStatus::Running);
    }

    /// Run the target agent, then the quality gates
    async fn execute(
        &self,
        task: &DelegationTask,
        prepared: &Prepared,
        opts: &DelegateOptions,
    ) -> Execution {
        let started = Instant::now();
        let trace_id = task.trace.trace_id.clone().unwrap_or_else(new_id);
        let span = SpanRecord::start(
            &trace_id,
            task.trace.parent_span_id.clone(),
            SpanKind::Task,
            format!("delegation:{}", task.target_agent_key),
        )
        .attr("delegation_id", task.id.as_str())
        .attr("source_agent", task.source_agent_key.as_str())
        .attr("target_agent", task.target_agent_key.as_str())
        .attr("mode", task.mode.as_str());

        let ctx = RunContext::new()
            .with_agent(&task.target_agent_id, &task.target_agent_key)
            .with_session_key(&task.session_key)
            .with_origin(task.origin.clone())
            .with_trace(TraceLink::new(trace_id, Some(span.span_id.clone())))
            .with_cancel(task.cancel.clone());

        let run = TargetRun {
            task,
            prepared,
            ctx,
            extra_system_prompt: delegation_prompt(task, opts.context.as_deref()),
        };

        let outcome = match run.invoke(self.runner.as_ref(), task.task.clone()).await {
            Ok(output) => match &self.evaluator {
                Some(evaluator) => {
                    let output = quality::apply_quality_gates(
                        evaluator.as_ref(),
                        self.runner.as_ref(),
                        &run,
                        output,
                    )
                    .await;
                    if task.cancel.is_cancelled() {
                        Err(swarm_core::Error::Cancelled)
                    } else {
                        Ok(output)
                    }
                }
                None => {
                    if !prepared.source.quality_gates.is_empty() {
                        debug!(delegation_id = %task.id, "No gate evaluator configured, skipping quality gates");
                    }
                    Ok(output)
                }
            },
            Err(e) => Err(e),
        };

        Execution {
            outcome,
            span,
            started,
        }
    }

    /// Record the terminal state, remove the record, emit event, history
    /// and span
    async fn finalize(&self, task: &DelegationTask, execution: Execution) -> Finished {
        let Execution {
            outcome,
            span,
            started,
        } = execution;
        let duration = started.elapsed();

        let (status, content, iterations) = match outcome {
            Ok(output) => (TaskStatus::Completed, output.content, output.iterations),
            Err(swarm_core::Error::Cancelled) => {
                (TaskStatus::Cancelled, "Delegation was cancelled".to_string(), 0)
            }
            Err(e) => (TaskStatus::Failed, e.to_string(), 0),
        };

        // Absent means an explicit Cancel already took the record
        let transitioned = self
            .registry
            .complete(&task.id, status, Some(content.clone()))
            .is_some();
        self.registry.remove(&task.id);
        let status = if transitioned {
            status
        } else {
            TaskStatus::Cancelled
        };

        match status {
            TaskStatus::Completed => info!(
                delegation_id = %task.id,
                target = %task.target_agent_key,
                iterations,
                "Delegation completed in {}ms",
                duration.as_millis()
            ),
            _ => warn!(
                delegation_id = %task.id,
                target = %task.target_agent_key,
                status = %status,
                "Delegation ended: {}",
                content
            ),
        }

        if transitioned {
            self.broadcast(&format!("delegation.{}", status), task, status);
        }

        self.save_history(task, status, &content, iterations, duration).await;

        let span_status = match status {
            TaskStatus::Completed => SpanStatus::Ok,
            TaskStatus::Cancelled => SpanStatus::Cancelled,
            _ => SpanStatus::Error,
        };
        self.trace.emit(
            span.attr("iterations", iterations)
                .attr("status", status.as_str())
                .finish(span_status),
        );

        if status == TaskStatus::Completed && self.sessions.is_some() {
            self.completed_sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(task.session_key.clone());
        }

        Finished {
            status,
            content,
            iterations,
            duration,
        }
    }

    async fn save_history(
        &self,
        task: &DelegationTask,
        status: TaskStatus,
        content: &str,
        iterations: u32,
        duration: Duration,
    ) {
        let Some(history) = &self.history else {
            return;
        };

        let (result, error) = if status == TaskStatus::Completed {
            (Some(content.to_string()), None)
        } else {
            (None, Some(content.to_string()))
        };
        let record = DelegationHistory {
            id: task.id.clone(),
            source_agent_id: task.source_agent_id.clone(),
            target_agent_id: task.target_agent_id.clone(),
            team_task_id: task.team_task_id.clone(),
            user_id: task.user_id.clone(),
            task: task.task.clone(),
            mode: task.mode,
            status,
            result,
            error,
            iterations,
            duration_ms: duration.as_millis() as i64,
            created_at: task.created_at,
            completed_at: Some(Utc::now()),
        };

        if let Err(e) = history.save_delegation(&record).await {
            warn!(delegation_id = %task.id, "Failed to save delegation history: {}", e);
        }
    }

    /// Publish an async outcome into the originating conversation
    async fn announce(&self, task: &DelegationTask, finished: &Finished) {
        let Some(router) = &self.router else {
            return;
        };
        let Some(target) = AnnounceTarget::from_origin(
            &task.origin,
            &task.source_agent_key,
            &task.trace,
            DELEGATION_SENDER,
        ) else {
            debug!(delegation_id = %task.id, "No announce route for delegation");
            return;
        };

        let item = AnnounceItem {
            task_id: task.id.clone(),
            label: format!("delegation to {}", task.target_agent_key),
            status: finished.status,
            result: finished.content.clone(),
            runtime: finished.duration,
            iterations: finished.iterations,
        };
        router.announce(&target, "Delegation", &item).await;
    }

    async fn complete_team_task(&self, task: &DelegationTask, result: &str) {
        let (Some(teams), Some(team_task_id)) = (&self.teams, &task.team_task_id) else {
            return;
        };
        match teams.complete_task(team_task_id, result).await {
            Ok(()) => debug!(delegation_id = %task.id, team_task_id = %team_task_id, "Team task completed"),
            Err(e) => warn!(
                delegation_id = %task.id,
                team_task_id = %team_task_id,
                "Failed to complete team task: {}",
                e
            ),
        }
    }

    /// Delete the sessions of completed delegations. Returns how many were
    /// removed; failures are logged and dropped.
    pub async fn flush_completed_sessions(&self) -> usize {
        let Some(sessions) = &self.sessions else {
            return 0;
        };
        let keys = std::mem::take(
            &mut *self
                .completed_sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        let mut removed = 0;
        for key in keys {
            match sessions.delete_session(&key).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(session_key = %key, "Failed to delete delegation session: {}", e),
            }
        }
        if removed > 0 {
            debug!(removed, "Flushed delegation sessions");
        }
        removed
    }

    /// Cancel a running delegation. Returns false for unknown or finished ones.
    pub fn cancel(&self, delegation_id: &str) -> bool {
        match self.registry.cancel(delegation_id) {
            Some(task) => {
                info!(delegation_id = %delegation_id, target = %task.target_agent_key, "Cancelled delegation");
                self.broadcast("delegation.cancelled", &task, TaskStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, delegation_id: &str) -> Option<DelegationTask> {
        self.registry.get(delegation_id)
    }

    /// Running delegations, optionally limited to one source agent id,
    /// oldest first
    pub fn list_active(&self, source_agent_id: Option<&str>) -> Vec<DelegationTask> {
        let mut tasks = self.registry.filter(|t| {
            t.status == TaskStatus::Running
                && source_agent_id.is_none_or(|s| t.source_agent_id == s)
        });
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn active_count(&self) -> usize {
        self.registry.count_running(|_| true)
    }

    pub fn active_count_for_link(&self, source_agent_id: &str, target_agent_id: &str) -> usize {
        self.registry.count_running(|t| {
            t.source_agent_id == source_agent_id && t.target_agent_id == target_agent_id
        })
    }

    pub fn active_count_for_target(&self, target_agent_id: &str) -> usize {
        self.registry
            .count_running(|t| t.target_agent_id == target_agent_id)
    }

    /// Cancel every async delegation owned by this manager
    pub fn shutdown(&self) {
        info!(active = self.active_count(), "Shutting down delegate manager");
        self.root.cancel();
    }

    fn broadcast(&self, name: &str, task: &DelegationTask, status: TaskStatus) {
        if let Some(bus) = &self.bus {
            bus.broadcast(BusEvent::new(
                name,
                json!({
                    "delegation_id": task.id,
                    "source_agent": task.source_agent_key,
                    "target_agent": task.target_agent_key,
                    "user_id": task.user_id,
                    "team_task_id": task.team_task_id,
                    "mode": task.mode.as_str(),
                    "status": status.as_str(),
                }),
            ));
        }
    }
}

/// Role note appended to the target agent's own system prompt
fn delegation_prompt(task: &DelegationTask, context: Option<&str>) -> String {
    let mut prompt = format!(
        "[Delegated Task]\n\
         Agent '{}' delegated this task to you. Your reply is returned to '{}', not shown \
         to the end user directly. Reply with a complete, self-contained result.",
        task.source_agent_key, task.source_agent_key
    );
    if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\n\nContext:\n");
        prompt.push_str(context);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        wait_until, RecordingBus, RecordingSink, ScriptedEvaluator, ScriptedRunner,
    };
    use swarm_core::context::OriginMeta;
    use swarm_core::gate::{GateSpec, GateVerdict, DELEGATION_COMPLETED};
    use swarm_core::store::{
        AgentLink, AgentRecord, LinkSettings, MemoryStores, SqliteHistoryStore, Team, TeamTask,
        TeamTaskStatus,
    };
    use tokio::sync::Semaphore;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> DelegationConfig {
        DelegationConfig {
            default_max_load: 5,
            default_link_max_concurrent: 3,
            history_db_path: None,
        }
    }

    /// alpha -> beta is linked; gamma exists with no links
    async fn stores() -> Arc<MemoryStores> {
        let stores = Arc::new(MemoryStores::new());
        stores.add_agent(AgentRecord::new("a1", "alpha")).await;
        stores.add_agent(AgentRecord::new("b1", "beta")).await;
        stores.add_agent(AgentRecord::new("g1", "gamma")).await;
        stores.add_link(AgentLink::new("a1", "b1")).await;
        stores
    }

    fn manager(stores: &Arc<MemoryStores>, runner: &Arc<ScriptedRunner>) -> DelegateManager {
        DelegateManager::new(config(), runner.clone(), stores.clone(), stores.clone())
            .with_history_store(stores.clone())
    }

    fn ctx(id: &str, key: &str) -> RunContext {
        RunContext::new()
            .with_agent(id, key)
            .with_origin(OriginMeta::new("slack", "C42").with_user("u1"))
    }

    #[tokio::test]
    async fn test_no_link_lists_available_targets() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let manager = manager(&stores, &runner);

        let err = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("gamma", "help"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoLink { .. }));
        let msg = err.to_string();
        assert!(msg.contains("No delegation link from 'alpha' to 'gamma'"));
        assert!(msg.contains("Available targets: beta"));
        assert_eq!(runner.call_count(), 0);
        assert_eq!(stores.history_len().await, 0);
    }

    #[tokio::test]
    async fn test_no_link_without_any_targets() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let manager = manager(&stores, &runner);

        let err = manager
            .delegate(&ctx("g1", "gamma"), DelegateOptions::new("beta", "help"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no delegation targets configured"));
    }

    #[tokio::test]
    async fn test_requires_agent_identity() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let manager = manager(&stores, &runner);

        let err = manager
            .delegate(&RunContext::new(), DelegateOptions::new("beta", "help"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoAgentContext));
    }

    #[tokio::test]
    async fn test_unknown_target_and_self_delegation() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let manager = manager(&stores, &runner);

        let err = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("nobody", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AgentNotFound(ref key) if key == "nobody"));

        let err = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("alpha", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SelfDelegation(_)));
    }

    #[tokio::test]
    async fn test_source_resolved_by_key_when_id_unknown() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let manager = manager(&stores, &runner);

        let result = manager
            .delegate(&ctx("stale-id", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap();
        assert_eq!(result.content, "beta result #1");
    }

    #[tokio::test]
    async fn test_sync_delegation_records_history() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new().reply("summary ready"));
        let bus = Arc::new(RecordingBus::new());
        let manager = manager(&stores, &runner).with_bus(bus.clone());

        let result = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "Summarise Q3"))
            .await
            .unwrap();
        assert_eq!(result.content, "summary ready");
        assert_eq!(result.target_agent_key, "beta");
        assert_eq!(manager.active_count(), 0);
        assert!(manager.get(&result.delegation_id).is_none());

        let (agent_key, request) = &runner.requests()[0];
        assert_eq!(agent_key, "beta");
        assert_eq!(request.message, "Summarise Q3");
        assert_eq!(request.user_id.as_deref(), Some("u1"));
        assert_eq!(request.channel.as_deref(), Some("slack"));
        assert_eq!(
            request.session_key,
            format!("delegate:alpha:beta:{}", result.delegation_id)
        );
        assert!(request
            .extra_system_prompt
            .as_deref()
            .unwrap()
            .contains("Agent 'alpha' delegated this task"));

        let record = stores.get_delegation(&result.delegation_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("summary ready"));
        assert_eq!(record.mode, DelegationMode::Sync);
        assert!(record.error.is_none());

        assert_eq!(bus.event_names(), vec!["delegation.started", "delegation.completed"]);
        // Sync results go back to the caller, not the conversation
        assert!(bus.inbound().is_empty());
    }

    #[tokio::test]
    async fn test_sync_failure_is_returned_and_recorded() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new().fail("target crashed"));
        let bus = Arc::new(RecordingBus::new());
        let manager = manager(&stores, &runner).with_bus(bus.clone());

        let err = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Execution(ref msg) if msg.contains("target crashed")));

        let history = stores.list_delegations("a1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TaskStatus::Failed);
        assert!(history[0].error.as_deref().unwrap().contains("target crashed"));
        assert!(history[0].result.is_none());
        assert_eq!(bus.events_named("delegation.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_history_round_trip_in_sqlite() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new().reply("done well"));
        let history = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let manager = DelegateManager::new(config(), runner.clone(), stores.clone(), stores.clone())
            .with_history_store(history.clone());

        let result = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap();

        let record = history.get_delegation(&result.delegation_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some(result.content.as_str()));
        assert_eq!(record.iterations, result.iterations);
        let measured = result.duration.as_millis() as i64;
        assert!((record.duration_ms - measured).abs() <= 5);
    }

    #[tokio::test]
    async fn test_target_capacity_across_sources() {
        let stores = stores().await;
        stores.add_agent(AgentRecord::new("b1", "beta").with_max_load(2)).await;
        stores.add_agent(AgentRecord::new("d1", "delta")).await;
        stores.add_link(AgentLink::new("g1", "b1")).await;
        stores.add_link(AgentLink::new("d1", "b1")).await;

        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().gated(gate.clone()));
        let manager = Arc::new(manager(&stores, &runner));

        let mut admitted = 0;
        let mut rejected = Vec::new();
        for (id, key) in [("a1", "alpha"), ("g1", "gamma"), ("d1", "delta")] {
            match manager
                .delegate_async(&ctx(id, key), DelegateOptions::new("beta", "work"))
                .await
            {
                Ok(_) => admitted += 1,
                Err(e) => rejected.push(e),
            }
        }

        assert_eq!(admitted, 2);
        assert_eq!(rejected.len(), 1);
        assert!(matches!(
            rejected[0],
            AgentError::TargetCapacity { active: 2, max: 2, .. }
        ));
        assert!(rejected[0].is_admission());
        assert_eq!(manager.active_count_for_target("b1"), 2);

        gate.add_permits(2);
        assert!(wait_until(WAIT, || manager.active_count() == 0).await);
        assert!(runner.max_active() <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_delegations_respect_target_load() {
        let stores = stores().await;
        stores.add_agent(AgentRecord::new("b1", "beta").with_max_load(2)).await;
        stores.add_agent(AgentRecord::new("d1", "delta")).await;
        stores.add_link(AgentLink::new("g1", "b1")).await;
        stores.add_link(AgentLink::new("d1", "b1")).await;

        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().gated(gate.clone()));
        let manager = Arc::new(manager(&stores, &runner));

        let attempts: Vec<_> = [("a1", "alpha"), ("g1", "gamma"), ("d1", "delta")]
            .into_iter()
            .map(|(id, key)| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager
                        .delegate_async(&ctx(id, key), DelegateOptions::new("beta", "work"))
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        let mut rejected = Vec::new();
        for attempt in futures::future::join_all(attempts).await {
            match attempt.unwrap() {
                Ok(_) => admitted += 1,
                Err(e) => rejected.push(e),
            }
        }

        assert_eq!(admitted, 2);
        assert_eq!(rejected.len(), 1);
        assert!(matches!(
            rejected[0],
            AgentError::TargetCapacity { active: 2, max: 2, .. }
        ));
        assert_eq!(manager.active_count_for_target("b1"), 2);

        gate.add_permits(2);
        assert!(wait_until(WAIT, || manager.active_count() == 0).await);
        assert!(runner.max_active() <= 2);
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_link_capacity() {
        let stores = stores().await;
        stores.add_link(AgentLink::new("a1", "b1").with_max_concurrent(1)).await;
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().gated(gate.clone()));
        let manager = Arc::new(manager(&stores, &runner));

        manager
            .delegate_async(&ctx("a1", "alpha"), DelegateOptions::new("beta", "one"))
            .await
            .unwrap();
        let err = manager
            .delegate_async(&ctx("a1", "alpha"), DelegateOptions::new("beta", "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::LinkCapacity { active: 1, max: 1, .. }));
        assert!(err.to_string().contains("1/1 active"));
        assert_eq!(manager.active_count_for_link("a1", "b1"), 1);
        assert_eq!(manager.list_active(Some("a1")).len(), 1);
        assert!(manager.list_active(Some("g1")).is_empty());

        manager.shutdown();
        assert!(wait_until(WAIT, || manager.active_count() == 0).await);
    }

    #[tokio::test]
    async fn test_link_user_rules() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let manager = manager(&stores, &runner);

        stores
            .add_link(AgentLink::new("a1", "b1").with_settings(LinkSettings {
                user_allow: vec!["u1".into()],
                user_deny: vec!["u1".into()],
            }))
            .await;
        let err = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UserDenied { .. }));

        stores
            .add_link(AgentLink::new("a1", "b1").with_settings(LinkSettings {
                user_allow: vec!["u2".into()],
                user_deny: vec![],
            }))
            .await;
        let err = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::UserNotAllowed { .. }));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_team_member_needs_team_task() {
        let stores = stores().await;
        stores
            .add_team(Team {
                id: "t1".into(),
                name: "research".into(),
                lead_agent_id: "a1".into(),
                member_ids: vec!["b1".into()],
            })
            .await;
        stores.add_team_task(TeamTask::new("task-7", "t1", "Collect sources")).await;

        let runner = Arc::new(ScriptedRunner::new().reply("3 sources found"));
        let bus = Arc::new(RecordingBus::new());
        let manager = Arc::new(
            manager(&stores, &runner)
                .with_team_store(stores.clone())
                .with_bus(bus.clone()),
        );

        let err = manager
            .delegate_async(&ctx("a1", "alpha"), DelegateOptions::new("beta", "collect"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TeamTaskRequired { ref team, .. } if team == "research"));
        assert!(err.to_string().contains("Create a team task first"));

        manager
            .delegate_async(
                &ctx("a1", "alpha"),
                DelegateOptions::new("beta", "collect").with_team_task("task-7"),
            )
            .await
            .unwrap();
        assert!(bus.wait_for_inbound(1, WAIT).await);

        let mut done = false;
        for _ in 0..200 {
            let task = stores.team_task("task-7").await.unwrap();
            if task.status == TeamTaskStatus::Completed {
                assert_eq!(task.result.as_deref(), Some("3 sources found"));
                assert_eq!(task.owner_agent_id.as_deref(), Some("b1"));
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(done);
    }

    #[tokio::test]
    async fn test_async_announce_and_session_flush() {
        let stores = stores().await;
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().reply("report attached").gated(gate.clone()));
        let bus = Arc::new(RecordingBus::new());
        let manager = Arc::new(
            manager(&stores, &runner)
                .with_session_store(stores.clone())
                .with_bus(bus.clone()),
        );

        let ack = manager
            .delegate_async(&ctx("a1", "alpha"), DelegateOptions::new("beta", "write report"))
            .await
            .unwrap();
        assert!(ack.message.contains("Delegated to 'beta'"));
        let session_key = format!("delegate:alpha:beta:{}", ack.delegation_id);
        stores.add_session(&session_key).await;

        gate.add_permits(1);
        assert!(bus.wait_for_inbound(1, WAIT).await);
        let msg = &bus.inbound()[0];
        assert_eq!(msg.sender_id, DELEGATION_SENDER);
        assert_eq!(msg.channel, "slack");
        assert_eq!(msg.chat_id, "C42");
        assert_eq!(msg.metadata["task_id"], ack.delegation_id);
        assert_eq!(msg.metadata["parent_id"], "alpha");
        assert_eq!(msg.metadata["status"], "completed");
        assert!(msg.content.contains("report attached"));

        let mut flushed = false;
        for _ in 0..200 {
            if !stores.has_session(&session_key).await {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(flushed);
        assert_eq!(manager.flush_completed_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_async_delegation() {
        let stores = stores().await;
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().gated(gate.clone()));
        let bus = Arc::new(RecordingBus::new());
        let manager = Arc::new(manager(&stores, &runner).with_bus(bus.clone()));

        let ack = manager
            .delegate_async(&ctx("a1", "alpha"), DelegateOptions::new("beta", "slow"))
            .await
            .unwrap();
        assert_eq!(manager.active_count_for_target("b1"), 1);

        assert!(manager.cancel(&ack.delegation_id));
        assert!(!manager.cancel(&ack.delegation_id));
        assert!(!manager.cancel("unknown"));
        assert_eq!(manager.active_count_for_target("b1"), 0);

        assert!(bus.wait_for_inbound(1, WAIT).await);
        assert_eq!(bus.inbound()[0].metadata["status"], "cancelled");
        assert_eq!(bus.events_named("delegation.cancelled").len(), 1);

        let record = stores.get_delegation(&ack.delegation_id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_sync_delegation_cancelled_with_caller() {
        let stores = stores().await;
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().gated(gate.clone()));
        let manager = manager(&stores, &runner);

        let caller = ctx("a1", "alpha");
        let cancel = caller.cancel.clone();
        let (result, _) = tokio::join!(
            manager.delegate(&caller, DelegateOptions::new("beta", "x")),
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        );
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_sync_delegation_releases_capacity() {
        let stores = stores().await;
        stores.add_agent(AgentRecord::new("b1", "beta").with_max_load(1)).await;
        let gate = Arc::new(Semaphore::new(0));
        let runner = Arc::new(ScriptedRunner::new().gated(gate.clone()));
        let bus = Arc::new(RecordingBus::new());
        let manager = manager(&stores, &runner).with_bus(bus.clone());

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            manager.delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "slow")),
        )
        .await;
        assert!(dropped.is_err());

        assert_eq!(manager.active_count_for_target("b1"), 0);
        assert_eq!(manager.active_count_for_link("a1", "b1"), 0);
        assert_eq!(
            bus.event_names(),
            vec!["delegation.started", "delegation.cancelled"]
        );

        gate.add_permits(1);
        let result = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "again"))
            .await
            .unwrap();
        assert_eq!(result.target_agent_key, "beta");
        assert_eq!(manager.active_count(), 0);
        assert_eq!(bus.events_named("delegation.cancelled").len(), 1);
    }

    #[tokio::test]
    async fn test_blocking_gate_retries_then_accepts_last_result() {
        let stores = stores().await;
        stores
            .add_agent(
                AgentRecord::new("a1", "alpha")
                    .with_gate(GateSpec::new(DELEGATION_COMPLETED, "command").blocking(2)),
            )
            .await;
        let runner = Arc::new(ScriptedRunner::new());
        let evaluator = Arc::new(ScriptedEvaluator::always(GateVerdict::fail("lint errors")));
        let manager = manager(&stores, &runner).with_evaluator(evaluator.clone());

        let result = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "Fix module"))
            .await
            .unwrap();

        assert_eq!(runner.call_count(), 3);
        assert_eq!(evaluator.calls(), 3);
        assert_eq!(result.content, "beta result #3");
        assert_eq!(result.iterations, 3);

        let retry = &runner.requests()[1].1;
        assert!(retry.message.contains("lint errors"));
        assert!(retry.message.contains("Original task:\nFix module"));
        // Re-runs stay in the same delegation session
        assert_eq!(retry.session_key, runner.requests()[0].1.session_key);
    }

    #[tokio::test]
    async fn test_gate_passes_after_one_retry() {
        let stores = stores().await;
        stores
            .add_agent(
                AgentRecord::new("a1", "alpha")
                    .with_gate(GateSpec::new(DELEGATION_COMPLETED, "agent").blocking(3)),
            )
            .await;
        let runner = Arc::new(ScriptedRunner::new());
        let evaluator = Arc::new(
            ScriptedEvaluator::always(GateVerdict::pass()).then(Ok(GateVerdict::fail("too short"))),
        );
        let manager = manager(&stores, &runner).with_evaluator(evaluator.clone());

        let result = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 2);
        assert_eq!(result.content, "beta result #2");
    }

    #[tokio::test]
    async fn test_evaluator_error_skips_gate() {
        let stores = stores().await;
        stores
            .add_agent(
                AgentRecord::new("a1", "alpha")
                    .with_gate(GateSpec::new(DELEGATION_COMPLETED, "command").blocking(2)),
            )
            .await;
        let runner = Arc::new(ScriptedRunner::new());
        let evaluator = Arc::new(
            ScriptedEvaluator::always(GateVerdict::fail("unused")).then(Err("hook timed out".into())),
        );
        let manager = manager(&stores, &runner).with_evaluator(evaluator.clone());

        let result = manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 1);
        assert_eq!(evaluator.calls(), 1);
        assert_eq!(result.content, "beta result #1");
    }

    #[tokio::test]
    async fn test_non_blocking_and_unrelated_gates() {
        let stores = stores().await;
        stores
            .add_agent(
                AgentRecord::new("a1", "alpha")
                    .with_gate(GateSpec::new(DELEGATION_COMPLETED, "command"))
                    .with_gate(GateSpec::new("subagent.completed", "command").blocking(5)),
            )
            .await;
        let runner = Arc::new(ScriptedRunner::new());
        let evaluator = Arc::new(ScriptedEvaluator::always(GateVerdict::fail("meh")));
        let manager = manager(&stores, &runner).with_evaluator(evaluator.clone());

        manager
            .delegate(&ctx("a1", "alpha"), DelegateOptions::new("beta", "x"))
            .await
            .unwrap();
        assert_eq!(runner.call_count(), 1);
        assert_eq!(evaluator.calls(), 1);
    }

    #[tokio::test]
    async fn test_delegation_span() {
        let stores = stores().await;
        let runner = Arc::new(ScriptedRunner::new());
        let sink = Arc::new(RecordingSink::new());
        let manager = manager(&stores, &runner).with_trace_sink(sink.clone());
        let caller = ctx("a1", "alpha").with_trace(TraceLink::new("trace-3", Some("turn".into())));

        manager
            .delegate(&caller, DelegateOptions::new("beta", "x"))
            .await
            .unwrap();

        let spans = sink.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, SpanKind::Task);
        assert_eq!(spans[0].trace_id, "trace-3");
        assert_eq!(spans[0].parent_span_id.as_deref(), Some("turn"));
        assert_eq!(spans[0].status, SpanStatus::Ok);
        assert_eq!(spans[0].attributes["target_agent"], "beta");
    }

    #[test]
    fn test_ids_are_unique() {
        let runner: Arc<dyn AgentRunner> = Arc::new(ScriptedRunner::new());
        let stores = Arc::new(MemoryStores::new());
        let manager = DelegateManager::new(config(), runner, stores.clone(), stores);
        let prepared = Prepared {
            source: AgentRecord::new("a1", "alpha"),
            target: AgentRecord::new("b1", "beta"),
            user_id: None,
            team_task_id: None,
            link_max: 1,
            target_max: 1,
        };

        let ids: std::collections::HashSet<_> =
            (0..500).map(|_| manager.next_id(&prepared)).collect();
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| id.len() == 12));
    }
}
