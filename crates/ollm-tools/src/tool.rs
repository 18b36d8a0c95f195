// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// How much damage a tool can do.  Drives the approval policy: `Safe` tools
/// may run unprompted, `Dangerous` tools prompt in every mode except yolo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Danger {
    Safe,
    Modifying,
    Dangerous,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// Failure classification for a tool call that did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Schema validation failed; nothing ran
    BadArgs,
    /// The approval callback refused the call
    Denied,
    /// Execution exceeded the per-tool timeout
    Timeout,
    /// The tool ran and reported failure
    Error,
    /// The tool implementation panicked or crashed
    Internal,
    /// The turn was cancelled while the call was in flight
    Cancelled,
}

/// The result of executing (or failing to execute) a tool.
///
/// `llm_content` is the text fed back to the model as a tool message;
/// `return_display` is the optional human-facing rendering.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub llm_content: String,
    pub return_display: Option<String>,
    pub status: ToolStatus,
    pub error_kind: Option<ErrorKind>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            llm_content: content.into(),
            return_display: None,
            status: ToolStatus::Ok,
            error_kind: None,
        }
    }

    pub fn ok_with_display(content: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            llm_content: content.into(),
            return_display: Some(display.into()),
            status: ToolStatus::Ok,
            error_kind: None,
        }
    }

    pub fn err(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            llm_content: msg.into(),
            return_display: None,
            status: ToolStatus::Error,
            error_kind: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// Per-invocation execution context handed to every tool.
///
/// `env` is the sanitized map subprocess tools must use for their children;
/// they never read the parent environment directly.  Cancellation is
/// cooperative: tools observe `cancel` at their own suspension points.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub env: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    pub workdir: Option<PathBuf>,
    /// Per-call execution budget in seconds
    pub timeout_secs: u64,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            cancel: CancellationToken::new(),
            workdir: None,
            timeout_secs: 30,
        }
    }
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments object
    fn parameters_schema(&self) -> Value;
    fn danger(&self) -> Danger;
    /// Execute the tool.  Failures should be reported via [`ToolResult::err`];
    /// only a panic is treated as an internal fault by the executor.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_result_has_no_error_kind() {
        let r = ToolResult::ok("fine");
        assert_eq!(r.status, ToolStatus::Ok);
        assert!(r.error_kind.is_none());
        assert!(!r.is_error());
    }

    #[test]
    fn err_result_carries_kind_and_message() {
        let r = ToolResult::err(ErrorKind::Timeout, "timed out after 5s");
        assert!(r.is_error());
        assert_eq!(r.error_kind, Some(ErrorKind::Timeout));
        assert!(r.llm_content.contains("timed out"));
    }

    #[test]
    fn display_variant_kept_separately() {
        let r = ToolResult::ok_with_display("raw", "pretty");
        assert_eq!(r.llm_content, "raw");
        assert_eq!(r.return_display.as_deref(), Some("pretty"));
    }

    #[test]
    fn error_kind_serialises_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::BadArgs).unwrap(),
            "\"bad_args\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::Timeout).unwrap(),
            "\"timeout\""
        );
    }

    #[test]
    fn danger_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Danger::Modifying).unwrap(), "\"modifying\"");
    }
}
