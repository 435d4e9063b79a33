//! Test doubles shared by the orchestrator tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;

use swarm_core::bus::{BusEvent, InboundMessage, MessageBus};
use swarm_core::gate::{GateSpec, GateVerdict, HookEvaluator, HookInput};
use swarm_core::llm::{ChatRequest, ChatResponse, LlmProvider, ToolCall};
use swarm_core::runner::{AgentRunner, RunOutput, RunRequest};
use swarm_core::telemetry::{SpanRecord, TraceSink};
use swarm_core::tool::{Tool, ToolResult};
use swarm_core::{Error, Result, RunContext};

pub async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}

/// Bus that records everything published on it
#[derive(Default)]
pub struct RecordingBus {
    inbound: Mutex<Vec<InboundMessage>>,
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inbound(&self) -> Vec<InboundMessage> {
        self.inbound.lock().unwrap().clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| e.name.clone()).collect()
    }

    pub fn events_named(&self, name: &str) -> Vec<BusEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub async fn wait_for_inbound(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.inbound.lock().unwrap().len() >= n).await
    }

    pub async fn wait_for_event(&self, name: &str, timeout: Duration) -> bool {
        wait_until(timeout, || {
            self.events.lock().unwrap().iter().any(|e| e.name == name)
        })
        .await
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish_inbound(&self, message: InboundMessage) -> Result<()> {
        self.inbound.lock().unwrap().push(message);
        Ok(())
    }

    fn broadcast(&self, event: BusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Trace sink that keeps every span
#[derive(Default)]
pub struct RecordingSink {
    spans: Mutex<Vec<SpanRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().unwrap().clone()
    }
}

impl TraceSink for RecordingSink {
    fn emit(&self, span: SpanRecord) {
        self.spans.lock().unwrap().push(span);
    }
}

/// LLM provider replaying a script, optionally held at a gate
pub struct ScriptedProvider {
    script: Mutex<VecDeque<std::result::Result<ChatResponse, String>>>,
    fallback: String,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: "done".to_string(),
            gate: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(ChatResponse::text(text)));
        self
    }

    pub fn tool_call(self, id: &str, name: &str, arguments: JsonValue) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(ChatResponse::tool_calls(vec![ToolCall::new(id, name, arguments)])));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    /// Every call waits for a permit on `gate`
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(Error::LlmApi(message)),
            None => Ok(ChatResponse::text(&self.fallback)),
        }
    }
}

/// Agent runner with scripted outputs and concurrency tracking
pub struct ScriptedRunner {
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<(String, RunRequest)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            gate: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn reply(self, content: &str) -> Self {
        self.script.lock().unwrap().push_back(Ok(content.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<(String, RunRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn run(&self, _ctx: &RunContext, agent_key: &str, request: RunRequest) -> Result<RunOutput> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((agent_key.to_string(), request));
            calls.len()
        };
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(content)) => Ok(RunOutput {
                content,
                iterations: 1,
            }),
            Some(Err(message)) => Err(Error::LlmApi(message)),
            None => Ok(RunOutput {
                content: format!("{} result #{}", agent_key, n),
                iterations: 1,
            }),
        }
    }
}

/// Gate evaluator replaying verdicts; falls back to `fallback` when empty
pub struct ScriptedEvaluator {
    script: Mutex<VecDeque<std::result::Result<GateVerdict, String>>>,
    fallback: GateVerdict,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn always(verdict: GateVerdict) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: verdict,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then(self, verdict: std::result::Result<GateVerdict, String>) -> Self {
        self.script.lock().unwrap().push_back(verdict);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HookEvaluator for ScriptedEvaluator {
    async fn evaluate_single_hook(
        &self,
        _ctx: &RunContext,
        _gate: &GateSpec,
        _input: &HookInput,
    ) -> Result<GateVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(message)) => Err(Error::Other(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Tool returning its name and input
pub struct EchoTool(pub &'static str);

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        self.0
    }

    fn description(&self) -> &str {
        "Echo the input"
    }

    fn input_schema(&self) -> JsonValue {
        serde_json::json!({"type": "object"})
    }

    async fn execute(&self, _ctx: &RunContext, input: JsonValue) -> Result<ToolResult> {
        Ok(ToolResult::success(format!("{}:{}", self.0, input)))
    }
}
