// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::tool::Danger;

/// Outcome of an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Denied,
    /// Approve this call and every future call of the same tool within the
    /// session.  Never applies to `Danger::Dangerous` tools, which re-prompt
    /// each time outside yolo mode.
    ApprovedAlways,
}

/// Caller-supplied approval callback.  The core never renders UI; the
/// enclosing CLI decides how to ask.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, tool_name: &str, args: &Value, danger: Danger) -> Decision;
}

/// Handler that approves everything.  Used by tests and headless runs where
/// the operator opted out of prompting.
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn request_approval(&self, _tool_name: &str, _args: &Value, _danger: Danger) -> Decision {
        Decision::Approved
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
