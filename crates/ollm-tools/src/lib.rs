// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
mod approval;
pub mod builtin;
mod env;
mod executor;
mod registry;
mod tool;

pub use approval::{ApprovalHandler, AutoApprove, Decision};
pub use env::EnvRules;
pub use executor::{ExecutorConfig, ToolExecutor};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Danger, ErrorKind, Tool, ToolCall, ToolContext, ToolResult, ToolStatus};
