// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use ollm_config::CompressionStrategy;
use ollm_tools::ToolCall;

use crate::loop_detect::LoopPattern;

/// Structured events pushed to the caller-provided notification channel
/// during a turn.  The core never renders UI; consumers decide how each
/// event is displayed.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A turn began processing a user input
    TurnStarted { session_id: String },
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// The model has requested a tool call
    ToolStarted { call: ToolCall },
    /// A tool call finished (successfully or not)
    ToolCompleted {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// The active context was compressed; statistics for the UI
    CompressionApplied {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompressionStrategy,
        /// The pipeline fell back to truncation after a summarization failure
        fell_back: bool,
    },
    /// A runaway pattern tripped the loop detector; the turn was aborted
    LoopDetected(LoopPattern),
    /// The provider stream failed; the turn ended with an error
    ProviderError(String),
    /// A non-fatal condition the caller may want to surface
    Warning(String),
    /// The turn was cancelled; any streamed text is carried along
    Aborted { partial_text: String },
    /// The agent finished processing the current user turn
    TurnCompleted,
}
