// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{EventStream, StreamingFormat},
    ChatRequest, FinishReason, Role, StreamEvent,
};

/// Deterministic mock provider.  Echoes the last user message back as the
/// assistant response.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl crate::Provider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.visible_text())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Finish(FinishReason::Stop)),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `chat_stream` pops the next
/// event script from the front of the queue.  This lets tests specify exact
/// event sequences – including tool calls – without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// The last [`ChatRequest`] seen by this provider.
    /// Written on each `chat_stream` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
    /// Running count of `chat_stream` invocations.
    pub calls: Arc<Mutex<u32>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of response scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`StreamEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            StreamEvent::TextDelta(r),
            StreamEvent::Finish(FinishReason::Stop),
        ]])
    }

    /// Convenience: provider that returns a tool call followed, on the next
    /// call, by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::Finish(FinishReason::ToolCalls),
            ],
            vec![
                StreamEvent::TextDelta(final_text.into()),
                StreamEvent::Finish(FinishReason::Stop),
            ],
        ])
    }
}

#[async_trait]
impl crate::Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }
    fn streaming_format(&self) -> StreamingFormat {
        StreamingFormat::Ndjson
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    StreamEvent::TextDelta("[no more scripts]".into()),
                    StreamEvent::Finish(FinishReason::Stop),
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
