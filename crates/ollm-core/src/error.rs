// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use ollm_session::SessionError;

use crate::loop_detect::LoopPattern;

/// Structural failures of the conversation core.
///
/// Recoverable conditions — a tool failing, a compression falling back to
/// truncation, a denied approval — are data, not errors: they flow back to
/// the model as tool results or into notifications.  Only conditions that
/// end or invalidate a turn surface here.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The active context exceeds the model maximum even after compression
    /// escalation.
    #[error("context overflow: {current} tokens exceeds the {max} token window")]
    ContextOverflow { current: usize, max: usize },
    /// The window failed pre-send validation and could not be repaired.
    #[error("invalid context: {0}")]
    InvalidContext(String),
    /// A compression result violated its invariants or the pipeline failed
    /// past its fallback.
    #[error("compression failed: {0}")]
    CompressionFailed(String),
    #[error("loop detected: {0}")]
    LoopDetected(LoopPattern),
    /// Streaming failure, connection loss, or protocol error from the
    /// provider adapter.
    #[error("provider error: {0}")]
    Provider(String),
    #[error("cancelled")]
    Cancelled,
}
