//! swarm-core: Multi-agent runtime core library
//!
//! LLMプロバイダ、ツールシステム、ツールアクセスポリシー、
//! メッセージバス、ストア抽象などのコア機能を提供します。

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod llm;
pub mod policy;
pub mod runner;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod tool;

pub use bus::{BusEvent, ChannelBus, InboundMessage, MessageBus};
pub use config::{Config, DelegationConfig, LlmConfig, SubagentConfig, ToolPolicyConfig};
pub use context::{OriginMeta, PeerKind, RunContext, TraceLink};
pub use error::{Error, Result};
pub use gate::{GateSpec, GateVerdict, HookEvaluator, HookInput};
pub use llm::{ChatRequest, ChatResponse, ClaudeClient, LlmProvider, Message, ToolDefinition};
pub use policy::{CallerKind, PolicyEngine, PolicyInputs, PolicyLayer};
pub use runner::{AgentRunner, RunOutput, RunRequest};
pub use status::TaskStatus;
pub use telemetry::{LogTraceSink, SpanKind, SpanRecord, SpanStatus, TraceSink};
pub use tool::{Tool, ToolManager, ToolResult, ToolView};
