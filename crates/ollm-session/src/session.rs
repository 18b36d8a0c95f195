// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use ollm_model::Message;

/// Cumulative counters kept alongside the conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub token_count: u64,
    pub compression_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub llm_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_display: Option<String>,
}

/// One completed tool invocation, as recorded in the session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Opaque call identifier from the model
    pub id: String,
    pub name: String,
    pub args: Value,
    pub result: ToolCallResult,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
}

/// The root aggregate: one conversation, as serialized to disk.
///
/// The JSON shape of this struct is a compatibility contract for resume and
/// export — field names are camelCase and timestamps are ISO-8601 UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub metadata: SessionMetadata,
}

impl SessionRecord {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            start_time: now,
            last_activity: now,
            model: model.into(),
            provider: provider.into(),
            messages: Vec::new(),
            tool_calls: Vec::new(),
            metadata: SessionMetadata::default(),
        }
    }

    /// Append a message, advancing `last_activity` monotonically.
    pub fn push_message(&mut self, msg: Message) {
        self.touch();
        self.messages.push(msg);
    }

    pub fn push_tool_call(&mut self, record: ToolCallRecord) {
        self.touch();
        self.tool_calls.push(record);
    }

    fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.session_id.clone(),
            start_time: self.start_time,
            last_activity: self.last_activity,
            model: self.model.clone(),
            message_count: self.messages.len(),
            token_count: self.metadata.token_count,
        }
    }
}

/// Lightweight listing entry for the sessions view.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub model: String,
    pub message_count: usize,
    pub token_count: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
