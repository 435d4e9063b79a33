//! Bounded LLM/tool iteration loop run by every subagent

use tracing::{debug, warn};

use swarm_core::llm::{ChatRequest, LlmProvider, Message};
use swarm_core::telemetry::{new_id, SpanKind, SpanRecord, SpanStatus, TraceSink};
use swarm_core::{RunContext, TaskStatus, ToolView};

/// How a loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub status: TaskStatus,
    pub content: String,
    pub iterations: u32,
}

impl LoopOutcome {
    fn cancelled(iterations: u32) -> Self {
        Self {
            status: TaskStatus::Cancelled,
            content: "Task was cancelled".to_string(),
            iterations,
        }
    }
}

/// Everything one loop needs, borrowed from the orchestrator
pub struct TaskLoop<'a> {
    pub provider: &'a dyn LlmProvider,
    pub tools: &'a ToolView,
    pub trace: &'a dyn TraceSink,
    pub max_iterations: usize,
    pub model: Option<String>,
}

impl TaskLoop<'_> {
    /// Run until the model answers without tool calls, an LLM call fails,
    /// the context is cancelled, or the iteration cap is hit.
    ///
    /// `ctx.trace.parent_span_id` must be the task's root span.
    pub async fn run(&self, ctx: &RunContext, mut messages: Vec<Message>) -> LoopOutcome {
        let trace_id = ctx.trace.trace_id.clone().unwrap_or_else(new_id);
        let definitions = self.tools.definitions();
        let mut last_content = String::new();
        let mut iterations = 0u32;

        for iteration in 1..=self.max_iterations {
            if ctx.is_cancelled() {
                debug!(iteration, "Task cancelled at iteration boundary");
                return LoopOutcome::cancelled(iterations);
            }
            iterations = iteration as u32;

            let request = ChatRequest {
                messages: messages.clone(),
                tools: definitions.clone(),
                model: self.model.clone(),
                ..Default::default()
            };

            let mut span = SpanRecord::start(
                &trace_id,
                ctx.trace.parent_span_id.clone(),
                SpanKind::LlmCall,
                "llm.chat",
            )
            .attr("iteration", iterations)
            .attr("provider", self.provider.name());

            let response = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    self.trace.emit(span.finish(SpanStatus::Cancelled));
                    return LoopOutcome::cancelled(iterations);
                }
                response = self.provider.chat(request) => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    span.set_attr("error", e.to_string());
                    self.trace.emit(span.finish(SpanStatus::Error));
                    warn!(iteration, "LLM call failed: {}", e);
                    return LoopOutcome {
                        status: TaskStatus::Failed,
                        content: e.to_string(),
                        iterations,
                    };
                }
            };

            if let Some(usage) = response.usage {
                span.set_attr("input_tokens", usage.input_tokens);
                span.set_attr("output_tokens", usage.output_tokens);
            }
            span.set_attr("tool_calls", response.tool_calls.len());
            self.trace.emit(span.finish(SpanStatus::Ok));

            if !response.has_tool_calls() {
                return LoopOutcome {
                    status: TaskStatus::Completed,
                    content: response.content,
                    iterations,
                };
            }

            last_content = response.content.clone();
            messages.push(Message::assistant_with_tools(
                response.content,
                response.tool_calls.clone(),
            ));

            // Results go back in the order the model issued the calls
            for call in response.tool_calls {
                debug!(tool = %call.name, iteration, "Executing tool");
                let span = SpanRecord::start(
                    &trace_id,
                    ctx.trace.parent_span_id.clone(),
                    SpanKind::ToolCall,
                    call.name.clone(),
                )
                .attr("iteration", iterations);

                let result = self.tools.execute(ctx, &call.name, call.arguments).await;
                let status = if result.is_error {
                    SpanStatus::Error
                } else {
                    SpanStatus::Ok
                };
                self.trace.emit(span.finish(status));

                messages.push(Message::tool_result(call.id, result.output, result.is_error));
            }
        }

        warn!(iterations, "Task hit the iteration limit");
        let note = format!(
            "[Stopped after reaching the iteration limit of {}]",
            self.max_iterations
        );
        LoopOutcome {
            status: TaskStatus::Completed,
            content: if last_content.is_empty() {
                note
            } else {
                format!("{}\n\n{}", last_content, note)
            },
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EchoTool, RecordingSink, ScriptedProvider};
    use serde_json::json;
    use std::sync::Arc;
    use swarm_core::llm::Role;
    use swarm_core::ToolManager;

    fn view() -> ToolView {
        let mut manager = ToolManager::new();
        manager.register(Arc::new(EchoTool("read_file")));
        ToolView::unrestricted(Arc::new(manager))
    }

    fn task_loop<'a>(
        provider: &'a ScriptedProvider,
        tools: &'a ToolView,
        sink: &'a RecordingSink,
        max_iterations: usize,
    ) -> TaskLoop<'a> {
        TaskLoop {
            provider,
            tools,
            trace: sink,
            max_iterations,
            model: None,
        }
    }

    #[tokio::test]
    async fn test_tool_results_feed_next_iteration() {
        let provider = ScriptedProvider::new()
            .tool_call("c1", "read_file", json!({"path": "a"}))
            .reply("final answer");
        let tools = view();
        let sink = RecordingSink::new();

        let outcome = task_loop(&provider, &tools, &sink, 5)
            .run(&RunContext::new(), vec![Message::user("go")])
            .await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.content, "final answer");
        assert_eq!(outcome.iterations, 2);

        let second = &provider.requests()[1];
        let tool_msg = second.messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert!(tool_msg.content.starts_with("read_file:"));

        let kinds: Vec<_> = sink.spans().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SpanKind::LlmCall, SpanKind::ToolCall, SpanKind::LlmCall]);
    }

    #[tokio::test]
    async fn test_llm_error_fails_without_retry() {
        let provider = ScriptedProvider::new().fail("rate limited").reply("never");
        let tools = view();
        let sink = RecordingSink::new();

        let outcome = task_loop(&provider, &tools, &sink, 5)
            .run(&RunContext::new(), vec![Message::user("go")])
            .await;

        assert_eq!(outcome.status, TaskStatus::Failed);
        assert!(outcome.content.contains("rate limited"));
        assert_eq!(outcome.iterations, 1);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let provider = ScriptedProvider::new();
        let tools = view();
        let sink = RecordingSink::new();
        let ctx = RunContext::new();
        ctx.cancel.cancel();

        let outcome = task_loop(&provider, &tools, &sink, 5)
            .run(&ctx, vec![Message::user("go")])
            .await;

        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_iteration_cap_completes_with_note() {
        let provider = ScriptedProvider::new()
            .tool_call("c1", "read_file", json!({}))
            .tool_call("c2", "read_file", json!({}))
            .tool_call("c3", "read_file", json!({}));
        let tools = view();
        let sink = RecordingSink::new();

        let outcome = task_loop(&provider, &tools, &sink, 2)
            .run(&RunContext::new(), vec![Message::user("go")])
            .await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        assert!(outcome.content.contains("iteration limit of 2"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_hidden_tool_call_returns_error_result() {
        let provider = ScriptedProvider::new()
            .tool_call("c1", "exec", json!("rm -rf /"))
            .reply("ok");
        let tools = view();
        let sink = RecordingSink::new();

        let outcome = task_loop(&provider, &tools, &sink, 5)
            .run(&RunContext::new(), vec![Message::user("go")])
            .await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        let tool_msg = provider.requests()[1].messages.last().cloned().unwrap();
        assert!(tool_msg.is_error);
    }
}
