//! Agent-facing tools for the orchestrators
//!
//! The tools hold weak references, so a manager can register tools that
//! point back at itself without a reference cycle. Admission rejections
//! come back as error results the model can act on, not as tool failures.

use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use swarm_core::{Error, Result, RunContext, Tool, ToolResult};

use crate::delegate::{DelegateManager, DelegateOptions};
use crate::subagent::{SpawnRequest, SubagentManager};

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input[key]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::ToolExecution(format!("Missing '{}' parameter", key)))
}

fn optional_str(input: &Value, key: &str) -> Option<String> {
    input[key]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Spawn a subagent, in the background or inline
pub struct SpawnTool {
    manager: Weak<SubagentManager>,
}

impl SpawnTool {
    pub fn new(manager: &Arc<SubagentManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to work on a focused task. In async mode (default) it runs in the \
         background and its result is announced in this conversation; in sync mode this call \
         waits for the result."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete, self-contained description of the work"
                },
                "label": {
                    "type": "string",
                    "description": "Short name for the subagent"
                },
                "model": {
                    "type": "string",
                    "description": "Model override for this subagent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["async", "sync"],
                    "description": "async: return immediately; sync: wait for the result"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, ctx: &RunContext, input: Value) -> Result<ToolResult> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(ToolResult::error("Subagent manager is no longer running"));
        };

        let task = required_str(&input, "task")?;
        let mut request = SpawnRequest::new(task);
        if let Some(label) = optional_str(&input, "label") {
            request = request.with_label(label);
        }
        if let Some(model) = optional_str(&input, "model") {
            request = request.with_model(model);
        }

        tracing::debug!(parent_id = %ctx.parent_id(), depth = ctx.depth, "spawn tool called");

        match input["mode"].as_str().unwrap_or("async") {
            "sync" => match manager.run_sync(ctx, request).await {
                Ok(outcome) => Ok(ToolResult::success(format!(
                    "Subagent {} completed after {} iterations:\n{}",
                    outcome.task_id, outcome.iterations, outcome.content
                ))),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            },
            "async" => match manager.spawn(ctx, request) {
                Ok(ack) => Ok(ToolResult::success(ack.message)),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            },
            other => Ok(ToolResult::error(format!(
                "Unknown mode '{}'. Use 'async' or 'sync'.",
                other
            ))),
        }
    }
}

/// List or cancel the caller's own subagents
pub struct SubagentsTool {
    manager: Weak<SubagentManager>,
}

impl SubagentsTool {
    pub fn new(manager: &Arc<SubagentManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }
}

#[async_trait]
impl Tool for SubagentsTool {
    fn name(&self) -> &str {
        "subagents"
    }

    fn description(&self) -> &str {
        "List the subagents you spawned, or cancel one of them by id."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "cancel"]
                },
                "task_id": {
                    "type": "string",
                    "description": "Subagent id (required for cancel)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, ctx: &RunContext, input: Value) -> Result<ToolResult> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(ToolResult::error("Subagent manager is no longer running"));
        };
        let parent_id = ctx.parent_id();

        match required_str(&input, "action")? {
            "list" => {
                let tasks = manager.list(Some(&parent_id));
                if tasks.is_empty() {
                    return Ok(ToolResult::success("No subagents."));
                }
                let mut out = String::new();
                for task in tasks {
                    let _ = writeln!(
                        out,
                        "- {} [{}] {} (depth {})",
                        task.id, task.status, task.label, task.depth
                    );
                }
                Ok(ToolResult::success(out.trim_end()))
            }
            "cancel" => {
                let task_id = required_str(&input, "task_id")?;
                if manager.cancel_child(&parent_id, task_id) {
                    Ok(ToolResult::success(format!("Cancelled subagent {}", task_id)))
                } else {
                    Ok(ToolResult::error(format!(
                        "No running subagent {} of yours. Use action 'list' to see them.",
                        task_id
                    )))
                }
            }
            other => Ok(ToolResult::error(format!(
                "Unknown action '{}'. Use 'list' or 'cancel'.",
                other
            ))),
        }
    }
}

/// Delegate a task to another named agent
pub struct DelegateTool {
    manager: Weak<DelegateManager>,
}

impl DelegateTool {
    pub fn new(manager: &Arc<DelegateManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "delegate"
    }

    fn description(&self) -> &str {
        "Delegate a task to another agent you are linked to. Sync mode (default) waits for \
         the result; async mode returns immediately and the result is announced later."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Key of the target agent"
                },
                "task": {
                    "type": "string",
                    "description": "What the target agent should do"
                },
                "context": {
                    "type": "string",
                    "description": "Background the target agent needs"
                },
                "team_task_id": {
                    "type": "string",
                    "description": "Team task this delegation belongs to (required for team members)"
                },
                "mode": {
                    "type": "string",
                    "enum": ["sync", "async"]
                }
            },
            "required": ["agent", "task"]
        })
    }

    async fn execute(&self, ctx: &RunContext, input: Value) -> Result<ToolResult> {
        let Some(manager) = self.manager.upgrade() else {
            return Ok(ToolResult::error("Delegate manager is no longer running"));
        };

        let mut opts = DelegateOptions::new(
            required_str(&input, "agent")?,
            required_str(&input, "task")?,
        );
        opts.team_task_id = optional_str(&input, "team_task_id");
        opts.context = optional_str(&input, "context");

        match input["mode"].as_str().unwrap_or("sync") {
            "sync" => match manager.delegate(ctx, opts).await {
                Ok(result) => Ok(ToolResult::success(format!(
                    "Result from '{}' (delegation {}):\n{}",
                    result.target_agent_key, result.delegation_id, result.content
                ))),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            },
            "async" => match manager.delegate_async(ctx, opts).await {
                Ok(ack) => Ok(ToolResult::success(ack.message)),
                Err(e) => Ok(ToolResult::error(e.to_string())),
            },
            other => Ok(ToolResult::error(format!(
                "Unknown mode '{}'. Use 'sync' or 'async'.",
                other
            ))),
        }
    }
}
