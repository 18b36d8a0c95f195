// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
mod env;
mod loader;
mod schema;

pub use env::{apply_env_overrides, apply_env_overrides_from};
pub use loader::load;
pub use schema::{
    ApprovalMode, CompressionStrategy, Config, ContextConfig, LoopConfig, ModelConfig,
    SessionConfig, ToolsConfig,
};
