//! swarm-agents: Subagent and delegation orchestration
//!
//! サブエージェントの起動・キャンセル、エージェント間の委譲、
//! 品質ゲート、結果のアナウンスを提供します。

pub mod announce;
pub mod delegate;
pub mod error;
pub mod registry;
pub mod subagent;
pub mod task;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use announce::{AnnounceItem, AnnounceQueue, AnnounceRouter, AnnounceTarget};
pub use delegate::{DelegateAck, DelegateManager, DelegateOptions, DelegateResult};
pub use error::{AgentError, Result};
pub use registry::{AbandonGuard, TaskRegistry};
pub use subagent::{SpawnAck, SpawnRequest, SubagentManager, SubagentOutcome};
pub use task::{DelegationTask, SubagentTask, TaskRecord};
pub use tools::{DelegateTool, SpawnTool, SubagentsTool};
