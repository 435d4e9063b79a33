//! Per-task filtered view over a shared [`ToolManager`]

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::context::RunContext;
use crate::llm::ToolDefinition;
use crate::tool::{ToolManager, ToolResult};

/// Immutable tool view: the shared registry plus the names this task may use.
///
/// Filtering happens at lookup time, so concurrent tasks with different
/// restrictions never touch each other's state.
#[derive(Clone)]
pub struct ToolView {
    manager: Arc<ToolManager>,
    allowed: Arc<BTreeSet<String>>,
}

impl ToolView {
    pub fn new(manager: Arc<ToolManager>, allowed: BTreeSet<String>) -> Self {
        Self {
            manager,
            allowed: Arc::new(allowed),
        }
    }

    /// A view with every registered tool visible
    pub fn unrestricted(manager: Arc<ToolManager>) -> Self {
        let allowed = manager.tool_names();
        Self::new(manager, allowed)
    }

    pub fn allowed(&self) -> &BTreeSet<String> {
        &self.allowed
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(self.manager.resolve(name))
    }

    /// Definitions for the visible tools, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.manager
            .definitions()
            .into_iter()
            .filter(|d| self.allowed.contains(&d.name))
            .collect()
    }

    /// Execute a visible tool.
    ///
    /// Calls to hidden or unknown tools, and tool errors, come back as error
    /// results so the model can see them and recover.
    pub async fn execute(&self, ctx: &RunContext, name: &str, input: JsonValue) -> ToolResult {
        if !self.is_allowed(name) {
            debug!(tool = name, "Rejected call to tool outside the task's view");
            return ToolResult::error(format!("Tool '{}' is not available", name));
        }
        match self.manager.execute(ctx, name, input).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(e.to_string()),
        }
    }
}
