//! Quality gate contract
//!
//! Gates are configured per source agent and evaluated against delegation
//! results. Only the pass/fail/feedback contract lives here; evaluators are
//! supplied by the host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::Result;

/// Event name a gate fires on when a delegation finishes
pub const DELEGATION_COMPLETED: &str = "delegation.completed";

/// One configured gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Event this gate listens for
    pub event: String,
    /// Evaluator kind (e.g. `command`, `agent`)
    #[serde(rename = "type")]
    pub evaluator: String,
    /// Evaluator-specific target: command line or reviewer agent key
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub block_on_failure: bool,
    #[serde(default)]
    pub max_retries: u32,
}

impl GateSpec {
    pub fn new(event: impl Into<String>, evaluator: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            evaluator: evaluator.into(),
            target: None,
            block_on_failure: false,
            max_retries: 0,
        }
    }

    pub fn blocking(mut self, max_retries: u32) -> Self {
        self.block_on_failure = true;
        self.max_retries = max_retries;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn matches(&self, event: &str) -> bool {
        self.event == event
    }
}

/// What the evaluator is asked to judge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInput {
    pub event: String,
    pub source_agent: String,
    pub target_agent: String,
    pub user_id: Option<String>,
    /// Result under review
    pub content: String,
    /// Original task text
    pub task: String,
}

/// Evaluator verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,
    pub feedback: String,
}

impl GateVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            feedback: String::new(),
        }
    }

    pub fn fail(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: feedback.into(),
        }
    }
}

/// Evaluates one gate against one result
#[async_trait]
pub trait HookEvaluator: Send + Sync {
    async fn evaluate_single_hook(
        &self,
        ctx: &RunContext,
        gate: &GateSpec,
        input: &HookInput,
    ) -> Result<GateVerdict>;
}
