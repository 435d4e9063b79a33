//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. swarm.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "swarm.toml";

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    #[serde(default)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL (optional, for custom endpoints)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Max tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: None,
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u64 {
    4096
}

/// Subagent orchestrator limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    /// Spawning is rejected once the caller depth reaches this value
    pub max_spawn_depth: u32,
    /// Running async subagents across all parents
    pub max_concurrent: usize,
    /// Running async subagents per parent
    pub max_children_per_parent: usize,
    /// Hard cap on LLM iterations per task
    pub max_iterations: usize,
    /// Keep terminal tasks visible this long before removal (0 = remove immediately)
    pub archive_after_secs: u64,
    /// Debounce window for batched announces (0 = announce immediately)
    pub announce_debounce_ms: u64,
    /// Model override for subagent runs
    pub model: Option<String>,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_spawn_depth: 1,
            max_concurrent: 8,
            max_children_per_parent: 5,
            max_iterations: 20,
            archive_after_secs: 0,
            announce_debounce_ms: 1000,
            model: None,
        }
    }
}

/// Delegate orchestrator defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    /// Max concurrent delegations into one target when the agent sets none
    pub default_max_load: usize,
    /// Max concurrent delegations over one link when the link sets none
    pub default_link_max_concurrent: usize,
    /// SQLite file for delegation history (in-memory history when unset)
    pub history_db_path: Option<String>,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            default_max_load: 5,
            default_link_max_concurrent: 3,
            history_db_path: None,
        }
    }
}

/// Provider-scoped tool policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToolPolicy {
    pub allow: Vec<String>,
}

/// Tool visibility policy (global in config, per agent in the agent store)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicyConfig {
    /// Named profile: minimal, coding, messaging, full
    pub profile: Option<String>,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub also_allow: Vec<String>,
    pub by_provider: HashMap<String, ProviderToolPolicy>,
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub subagents: SubagentConfig,

    #[serde(default)]
    pub delegation: DelegationConfig,

    #[serde(default)]
    pub tools: ToolPolicyConfig,
}

impl Config {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let var_name = &after[..end];
                    if let Ok(env_value) = std::env::var(var_name) {
                        result.push_str(&env_value);
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // 閉じ括弧がない場合はそのまま残す
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        result.push_str(rest);
        result
    }

    /// TOML 設定ファイルから設定を読み込む
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&toml_content)?;

        // 既存の環境変数で上書き（環境変数が優先）
        cfg.apply_env_overrides();

        Ok(cfg)
    }

    /// Parse a TOML document after `${VAR}` expansion
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `./swarm.toml` があればそれを使い、なければ環境変数のみで構築します。
    pub fn load() -> Result<Self> {
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            return Self::from_toml_file(DEFAULT_CONFIG_FILE);
        }
        Self::from_env()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        if cfg.llm.api_key.is_empty() {
            return Err(Error::Config("LLM_API_KEY not set".to_string()));
        }
        Ok(cfg)
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        if let Some(api_key) = env_non_empty("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Some(model) = env_non_empty("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(base_url) = env_non_empty("LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }

        if let Some(depth) = env_parse("SUBAGENT_MAX_DEPTH") {
            self.subagents.max_spawn_depth = depth;
        }
        if let Some(max) = env_parse("SUBAGENT_MAX_CONCURRENT") {
            self.subagents.max_concurrent = max;
        }
        if let Some(max) = env_parse("SUBAGENT_MAX_CHILDREN") {
            self.subagents.max_children_per_parent = max;
        }
        if let Some(secs) = env_parse("SUBAGENT_ARCHIVE_AFTER_SECS") {
            self.subagents.archive_after_secs = secs;
        }

        if let Some(load) = env_parse("DELEGATION_MAX_LOAD") {
            self.delegation.default_max_load = load;
        }
        if let Some(path) = env_non_empty("DELEGATION_HISTORY_DB") {
            self.delegation.history_db_path = Some(path);
        }
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_non_empty(key).and_then(|v| v.trim().parse().ok())
}
