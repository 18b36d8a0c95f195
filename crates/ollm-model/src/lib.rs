// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod ollama;
mod provider;
mod types;

pub use mock::{EchoProvider, ScriptedProvider};
pub use ollama::OllamaProvider;
pub use provider::{EventStream, ModelInfo, Provider, StreamingFormat};
pub use types::{
    ChatOptions, ChatRequest, FinishReason, Message, Part, Role, StreamEvent, ToolSchema,
};
