// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use ollm_config::CompressionStrategy;
use ollm_model::{ChatOptions, ChatRequest, Message, Part, Provider, Role, StreamEvent};

use crate::context::Tokenizer;

// ─── Summarization prompt ─────────────────────────────────────────────────────

const SUMMARIZE_PROMPT: &str = "\
You are a context compaction assistant. Write a self-contained summary of the \
conversation history below; it will replace that history to free up context \
space. Preserve everything needed to continue correctly: named entities (people, \
files, commands, URLs), decisions made and why, open questions, and tool outputs \
that remain relevant. Be information-dense and keep the summary well under the \
length of the original.";

// ─── Request / outcome types ──────────────────────────────────────────────────

/// What the context manager asks the pipeline to do.
#[derive(Debug, Clone)]
pub struct CompressionRequest {
    pub strategy: CompressionStrategy,
    /// Index of the first preserved-tail message in the window
    pub tail_start: usize,
    /// Token count the compressed window should come in under
    pub target_tokens: usize,
    /// Bound on the summary the model is asked for
    pub summary_max_tokens: u32,
}

/// What the pipeline returns.
#[derive(Debug)]
pub enum CompressionOutcome {
    Applied {
        window: Vec<Message>,
        original_tokens: usize,
        candidate_tokens: usize,
        strategy_used: CompressionStrategy,
        /// Summarization failed and the pipeline silently fell back to
        /// truncation
        fell_back: bool,
    },
    /// The candidate would have more tokens than the input; nothing was
    /// produced and the caller decides escalation.
    Inflated {
        original_tokens: usize,
        candidate_tokens: usize,
    },
}

/// The compression pipeline: builds a smaller candidate window, guarded so
/// that a "compression" can never grow the context.
pub struct Compressor {
    provider: Arc<dyn Provider>,
    /// Distinct summarization provider, when the configuration names one
    summary_provider: Option<Arc<dyn Provider>>,
}

impl Compressor {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            summary_provider: None,
        }
    }

    pub fn with_summary_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.summary_provider = Some(provider);
        self
    }

    fn summarizer(&self) -> &Arc<dyn Provider> {
        self.summary_provider.as_ref().unwrap_or(&self.provider)
    }

    /// Compress `window` according to the request.
    ///
    /// The window layout is `[system, middle..., tail...]` with the tail
    /// beginning at `req.tail_start`; only the middle is ever rewritten.
    /// Provider failures and empty summaries silently degrade to the
    /// truncate strategy, which needs no model call and always produces a
    /// candidate.
    pub async fn compress(
        &self,
        window: &[Message],
        tokenizer: &dyn Tokenizer,
        req: &CompressionRequest,
    ) -> CompressionOutcome {
        let original_tokens: usize = window.iter().map(|m| tokenizer.count(m)).sum();

        let (candidate, strategy_used, fell_back) = match req.strategy {
            CompressionStrategy::Truncate => (
                self.truncate(window, tokenizer, req),
                CompressionStrategy::Truncate,
                false,
            ),
            CompressionStrategy::Summarize | CompressionStrategy::Hybrid => {
                match self.summarize_middle(window, req).await {
                    Ok(summary) => {
                        let with_summary = rebuild(window, req.tail_start, Some(&summary));
                        let tokens: usize =
                            with_summary.iter().map(|m| tokenizer.count(m)).sum();
                        if req.strategy == CompressionStrategy::Hybrid
                            && tokens > req.target_tokens
                        {
                            // The summary alone still exceeds the target;
                            // drop the oldest content instead.
                            (
                                self.truncate(window, tokenizer, req),
                                CompressionStrategy::Hybrid,
                                false,
                            )
                        } else {
                            (with_summary, req.strategy, false)
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "summarization failed; falling back to truncate");
                        (
                            self.truncate(window, tokenizer, req),
                            CompressionStrategy::Truncate,
                            true,
                        )
                    }
                }
            }
        };

        // Inflation guard: recount, and refuse to return a bigger window.
        let candidate_tokens: usize = candidate.iter().map(|m| tokenizer.count(m)).sum();
        if candidate_tokens > original_tokens {
            debug!(
                original_tokens,
                candidate_tokens, "compression would inflate the context"
            );
            return CompressionOutcome::Inflated {
                original_tokens,
                candidate_tokens,
            };
        }

        CompressionOutcome::Applied {
            window: candidate,
            original_tokens,
            candidate_tokens,
            strategy_used,
            fell_back,
        }
    }

    /// Drop the oldest middle messages until the window fits the target (or
    /// the middle is gone).  No model call.
    fn truncate(
        &self,
        window: &[Message],
        tokenizer: &dyn Tokenizer,
        req: &CompressionRequest,
    ) -> Vec<Message> {
        let system = &window[0];
        let middle = &window[1..req.tail_start];
        let tail = &window[req.tail_start..];

        let fixed: usize = tokenizer.count(system) + tail.iter().map(|m| tokenizer.count(m)).sum::<usize>();
        let mut kept: Vec<&Message> = middle.iter().collect();
        let mut total = fixed + kept.iter().map(|m| tokenizer.count(m)).sum::<usize>();
        while total > req.target_tokens && !kept.is_empty() {
            let dropped = kept.remove(0);
            total -= tokenizer.count(dropped);
        }

        let mut out = Vec::with_capacity(1 + kept.len() + tail.len());
        out.push(system.clone());
        out.extend(kept.into_iter().cloned());
        out.extend(tail.iter().cloned());
        out
    }

    /// Ask the model for a summary of the middle messages.
    async fn summarize_middle(
        &self,
        window: &[Message],
        req: &CompressionRequest,
    ) -> anyhow::Result<String> {
        let middle = &window[1..req.tail_start];
        if middle.is_empty() {
            anyhow::bail!("nothing to summarize");
        }
        let history = serialize_history(middle);
        let prompt = format!("{SUMMARIZE_PROMPT}\n\n---\n\n{history}");

        let request = ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            options: ChatOptions {
                max_tokens: Some(req.summary_max_tokens),
                ..ChatOptions::default()
            },
        };

        let mut stream = self.summarizer().chat_stream(request).await?;
        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(delta) => summary.push_str(&delta),
                StreamEvent::Error(e) => anyhow::bail!("summarization stream error: {e}"),
                StreamEvent::Finish(_) => break,
                StreamEvent::ToolCall { .. } => {}
            }
        }

        if summary.trim().is_empty() {
            anyhow::bail!("summarization produced an empty summary");
        }
        Ok(summary)
    }
}

/// Rebuild a window as `[system, summary?, tail...]`.
fn rebuild(window: &[Message], tail_start: usize, summary: Option<&str>) -> Vec<Message> {
    let mut out = Vec::with_capacity(2 + window.len() - tail_start);
    out.push(window[0].clone());
    if let Some(s) = summary {
        out.push(Message::assistant(s));
    }
    out.extend(window[tail_start..].iter().cloned());
    out
}

/// Serialise messages into plain text for the summarization prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let text = m
                .parts
                .iter()
                .map(|p| match p {
                    Part::Text { text } => text.clone(),
                    Part::Image { mime, .. } => format!("[image: {mime}]"),
                    Part::ToolResult {
                        tool_call_id,
                        content,
                    } => format!("[tool_result {tool_call_id}: {content}]"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
