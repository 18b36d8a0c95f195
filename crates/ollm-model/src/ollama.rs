// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming adapter for Ollama-compatible backends.
//!
//! Speaks the `/api/chat` NDJSON wire format: one JSON object per line,
//! `"done": true` on the final object.  Tool calls arrive complete in a
//! single object (Ollama does not split arguments across deltas) and carry
//! no call id, so the adapter synthesises one per call.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{EventStream, ModelInfo, StreamingFormat},
    ChatRequest, FinishReason, Message, Part, Role, StreamEvent,
};

pub const DEFAULT_HOST: &str = "http://127.0.0.1:11434";

pub struct OllamaProvider {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(host: Option<&str>, model: impl Into<String>) -> Self {
        let host = host.unwrap_or(DEFAULT_HOST).trim_end_matches('/').to_string();
        Self {
            host,
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn streaming_format(&self) -> StreamingFormat {
        StreamingFormat::Ndjson
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.host);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        if !resp.status().is_success() {
            bail!("ollama error {}: listing models", resp.status());
        }
        let body: Value = resp.json().await.context("parsing /api/tags response")?;
        let mut models = Vec::new();
        if let Some(list) = body["models"].as_array() {
            for item in list {
                if let Some(name) = item["name"].as_str() {
                    models.push(ModelInfo {
                        name: name.to_string(),
                        context_window: None,
                    });
                }
            }
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut options = serde_json::Map::new();
        if let Some(t) = req.options.temperature {
            options.insert("temperature".into(), json!(t));
        }
        if let Some(n) = req.options.max_tokens {
            options.insert("num_predict".into(), json!(n));
        }
        if let Some(n) = req.options.context_size {
            options.insert("num_ctx".into(), json!(n));
        }

        let mut body = json!({
            "model": self.model,
            "messages": build_chat_messages(&req.messages),
            "stream": true,
            "options": Value::Object(options),
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending chat request"
        );

        let url = format!("{}/api/chat", self.host);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("ollama error {status}: {text}");
        }

        // NDJSON objects can be split across TCP packets.  Keep a line buffer
        // across chunks; emit events only for complete lines.  The second
        // scan-state field numbers tool calls so each gets a distinct
        // synthetic id within the response.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan((String::new(), 0u32), |(buf, tool_seq), chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_lines(buf, tool_seq)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Serialise conversation messages into the Ollama chat format.
///
/// Text parts concatenate into `content`; image parts populate the
/// `images` array; a tool-result part becomes a `tool`-role message.
fn build_chat_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let mut text_chunks: Vec<&str> = Vec::new();
        let mut images: Vec<&str> = Vec::new();
        for part in &msg.parts {
            match part {
                Part::Text { text } => text_chunks.push(text),
                Part::Image { data, .. } => images.push(data),
                Part::ToolResult { content, .. } => text_chunks.push(content),
            }
        }
        let mut m = json!({
            "role": role,
            "content": text_chunks.join("\n"),
        });
        if !images.is_empty() {
            m["images"] = json!(images);
        }
        out.push(m);
    }
    out
}

/// Drain all complete `\n`-terminated NDJSON lines from `buf`.
///
/// A trailing incomplete line is left in `buf` so the next TCP chunk can
/// extend it.
fn drain_complete_lines(buf: &mut String, tool_seq: &mut u32) -> Vec<anyhow::Result<StreamEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if line.trim().is_empty() {
            continue;
        }
        events.extend(parse_chat_line(&line, tool_seq));
    }
    events
}

/// Parse a single complete NDJSON line into zero or more [`StreamEvent`]s.
fn parse_chat_line(line: &str, tool_seq: &mut u32) -> Vec<anyhow::Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return vec![Err(anyhow::anyhow!("malformed NDJSON line: {e}"))];
        }
    };

    if let Some(err) = v["error"].as_str() {
        return vec![Ok(StreamEvent::Error(err.to_string()))];
    }

    let mut events = Vec::new();

    if let Some(content) = v["message"]["content"].as_str() {
        if !content.is_empty() {
            events.push(Ok(StreamEvent::TextDelta(content.to_string())));
        }
    }

    if let Some(calls) = v["message"]["tool_calls"].as_array() {
        for call in calls {
            let name = call["function"]["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let arguments = call["function"]["arguments"].to_string();
            let index = *tool_seq;
            *tool_seq += 1;
            events.push(Ok(StreamEvent::ToolCall {
                index,
                id: format!("call_{index}"),
                name: name.to_string(),
                arguments,
            }));
        }
    }

    if v["done"].as_bool() == Some(true) {
        let reason = match v["done_reason"].as_str() {
            Some("length") => FinishReason::Length,
            _ if *tool_seq > 0 => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        };
        events.push(Ok(StreamEvent::Finish(reason)));
    }

    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
