//! Tool manager for registering and executing tools

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::context::RunContext;
use crate::llm::ToolDefinition;
use crate::tool::{Tool, ToolResult, ToolView};
use crate::Result;

/// Manager for registered tools
///
/// Handles tool registration, name aliases, retrieval, and execution.
pub struct ToolManager {
    /// Registered tools indexed by canonical name
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Alternative name -> canonical name
    aliases: HashMap<String, String>,
}

impl ToolManager {
    /// Create a new empty tool manager
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register a tool
    ///
    /// If a tool with the same name already exists, it will be replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Register an alternative name for a canonical tool name
    pub fn register_alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    /// Resolve an alias to its canonical name (identity for unknown names)
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Get a tool by name or alias
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(self.resolve(name)).cloned()
    }

    /// Definitions for every registered tool, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .map(|t| ToolDefinition::new(t.name(), t.description(), t.input_schema()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name or alias
    ///
    /// # Errors
    /// Returns an error if the tool is not found or execution fails
    pub async fn execute(
        &self,
        ctx: &RunContext,
        name: &str,
        input: JsonValue,
    ) -> Result<ToolResult> {
        let tool = self.get(name).ok_or_else(|| {
            crate::Error::ToolExecution(format!("Unknown tool: {}", name))
        })?;
        tool.execute(ctx, input).await
    }

    /// Check if a tool is registered (aliases resolved)
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(self.resolve(name))
    }

    /// Get the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if no tools are registered
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Canonical names of all registered tools
    pub fn tool_names(&self) -> BTreeSet<String> {
        self.tools.keys().cloned().collect()
    }

    /// Build a per-task view restricted to `allowed`
    pub fn view(self: &Arc<Self>, allowed: BTreeSet<String>) -> ToolView {
        ToolView::new(Arc::clone(self), allowed)
    }
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}
