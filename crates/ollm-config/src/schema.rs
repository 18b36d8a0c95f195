// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub loop_detection: LoopConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "ollama" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Backend host URL.  Defaults to the local Ollama endpoint.
    pub host: Option<String>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Context window in tokens; the ceiling the context manager enforces
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    /// Abort a streaming read when no bytes arrive for this many seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_context_size() -> u32 {
    8192
}
fn default_read_timeout_secs() -> u64 {
    120
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            name: "llama3.2".into(),
            host: None,
            temperature: Some(0.2),
            max_tokens: Some(4096),
            context_size: default_context_size(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Strategy used when compressing the active context.
///
/// `Truncate` drops the oldest messages without a model call.  `Summarize`
/// replaces them with a model-written summary.  `Hybrid` (default) summarises
/// and falls back to dropping when the summary alone still exceeds the
/// target.  Whatever the strategy, the configured preserve-recent tail is
/// never rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStrategy {
    Truncate,
    Summarize,
    #[default]
    Hybrid,
}

impl std::fmt::Display for CompressionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionStrategy::Truncate => write!(f, "truncate"),
            CompressionStrategy::Summarize => write!(f, "summarize"),
            CompressionStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token fraction at which compression triggers before the next model call
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: f32,
    /// Token fraction at which a snapshot is taken and the aggressive
    /// (truncate) strategy is used regardless of `strategy`
    #[serde(default = "default_pre_overflow_threshold")]
    pub pre_overflow_threshold: f32,
    /// Token budget whose suffix of the window is never rewritten by
    /// compression.  The boundary is snapped to a message boundary, extended
    /// backwards over tool-result messages so results are never orphaned
    /// from their calls.
    #[serde(default = "default_preserve_recent_tokens")]
    pub preserve_recent_tokens: usize,
    /// Fraction of the context window compression aims for
    #[serde(default = "default_target_fraction")]
    pub target_fraction: f32,
    /// Upper bound on the summary the model is asked to produce
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default)]
    pub strategy: CompressionStrategy,
    /// Rolling window of context snapshots kept for recovery
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Model used for summarisation; the conversation model when unset
    #[serde(default)]
    pub summary_model: Option<String>,
}

fn default_compression_threshold() -> f32 {
    0.8
}
fn default_pre_overflow_threshold() -> f32 {
    0.95
}
fn default_preserve_recent_tokens() -> usize {
    1024
}
fn default_target_fraction() -> f32 {
    0.5
}
fn default_summary_max_tokens() -> u32 {
    1024
}
fn default_max_snapshots() -> usize {
    5
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            compression_threshold: default_compression_threshold(),
            pre_overflow_threshold: default_pre_overflow_threshold(),
            preserve_recent_tokens: default_preserve_recent_tokens(),
            target_fraction: default_target_fraction(),
            summary_max_tokens: default_summary_max_tokens(),
            strategy: CompressionStrategy::default(),
            max_snapshots: default_max_snapshots(),
            summary_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum tool-use iterations within one user request
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Number of consecutive identical fingerprints that trips detection
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,
    #[serde(default = "default_true")]
    pub detect_tool_repetition: bool,
    #[serde(default = "default_true")]
    pub detect_output_repetition: bool,
    /// Per-turn wall-clock soft cap in seconds; 0 disables it.  Crossing the
    /// cap emits a warning, it never aborts the turn.
    #[serde(default)]
    pub turn_soft_cap_secs: u64,
}

fn default_max_turns() -> u32 {
    50
}
fn default_repeat_threshold() -> usize {
    5
}

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            repeat_threshold: default_repeat_threshold(),
            detect_tool_repetition: true,
            detect_output_repetition: true,
            turn_soft_cap_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Every modifying or dangerous call pauses for approval
    AlwaysAsk,
    /// Safe tools run without prompting; others ask
    AutoApproveSafe,
    /// No prompts at all
    Yolo,
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalMode::AlwaysAsk => write!(f, "always-ask"),
            ApprovalMode::AutoApproveSafe => write!(f, "auto-approve-safe"),
            ApprovalMode::Yolo => write!(f, "yolo"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_approval_mode")]
    pub approval_mode: ApprovalMode,
    /// Maximum tool calls executed concurrently within one assistant turn
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Timeout in seconds for a single tool call
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Byte cap on a single tool result; the tail beyond it is dropped with
    /// an annotation
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: usize,
    /// Extra environment variable names (glob patterns) allowed through to
    /// tool subprocesses, on top of the built-in allow list
    #[serde(default)]
    pub env_allow: Vec<String>,
    /// Extra deny patterns, on top of the built-in deny list
    #[serde(default)]
    pub env_deny: Vec<String>,
    /// Drop the built-in allow/deny defaults entirely and use only the lists
    /// above.  The defaults stay in effect unless this is set.
    #[serde(default)]
    pub env_clear_defaults: bool,
}

fn default_approval_mode() -> ApprovalMode {
    ApprovalMode::AutoApproveSafe
}
fn default_parallelism() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_output_cap_bytes() -> usize {
    20_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            approval_mode: default_approval_mode(),
            parallelism: default_parallelism(),
            timeout_secs: default_tool_timeout_secs(),
            output_cap_bytes: default_output_cap_bytes(),
            env_allow: Vec::new(),
            env_deny: Vec::new(),
            env_clear_defaults: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session data directory; `~/.ollm/session-data` when unset
    #[serde(default)]
    pub data_dir: Option<std::path::PathBuf>,
    /// Oldest sessions beyond this count are deleted on startup
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_sessions() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionConfig {
    /// Resolve the session data directory, falling back to
    /// `~/.ollm/session-data`.
    pub fn resolved_data_dir(&self) -> std::path::PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".ollm")
            .join("session-data")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
