// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{ChatRequest, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Wire framing a provider streams its events in.  Informational only — the
/// adapter does the parsing either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingFormat {
    Ndjson,
    Sse,
}

/// One model known to a provider.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    /// Context window in tokens, when the backend reports one
    pub context_window: Option<u32>,
}

/// The adapter contract the conversation core consumes.
///
/// A provider turns a [`ChatRequest`] into an asynchronous sequence of
/// [`StreamEvent`]s.  Cancellation is driven by the consumer dropping the
/// stream; adapters must not require polling to completion.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream>;

    /// List models available from this backend.  Consumed by the external
    /// model manager, not by the core itself.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    fn streaming_format(&self) -> StreamingFormat {
        StreamingFormat::Ndjson
    }
}
