// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content part in a message.
///
/// Images carry their payload as a base64 string plus a MIME type; tool
/// results link back to the call that produced them via `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Image {
        /// Base64-encoded payload
        data: String,
        mime: String,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

/// A single message in the conversation history.
///
/// This struct is the on-disk session format as well as the in-memory one —
/// the serialized shape is a compatibility contract for resume and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn text_message(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![Part::ToolResult {
                tool_call_id: tool_call_id.into(),
                content: content.into(),
            }],
            timestamp: Utc::now(),
        }
    }

    pub fn with_parts(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            timestamp: Utc::now(),
        }
    }

    /// Return the plain text of this message, if it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [Part::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// Concatenation of all textual content (text parts and tool-result
    /// content); image payloads are skipped.
    pub fn visible_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::ToolResult { content, .. } => Some(content.as_str()),
                Part::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Sampling and sizing options forwarded with every completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub context_size: Option<u32>,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub options: ChatOptions,
}

// ─── Streaming events ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

/// A single streamed event from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// The model wants to call a tool
    ToolCall {
        /// Parallel-tool-call index; providers that do not interleave
        /// always use 0, 1, 2, …
        index: u32,
        /// Opaque call id from the provider; may be empty, in which case the
        /// consumer synthesises one
        id: String,
        name: String,
        /// Accumulated JSON arguments (may arrive across multiple deltas)
        arguments: String,
    },
    /// The stream finished
    Finish(FinishReason),
    /// A stream-level error; terminal for the turn
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
