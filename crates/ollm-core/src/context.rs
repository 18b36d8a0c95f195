// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use ollm_config::ContextConfig;
use ollm_model::{Message, Part, Role};

use crate::error::CoreError;

// ─── Token counting ───────────────────────────────────────────────────────────

/// Deterministic token estimator for a message.
///
/// The default heuristic is fast and provider-independent; a provider that
/// exposes an exact counter can install its own implementation — nothing
/// else in the core assumes the heuristic.
pub trait Tokenizer: Send + Sync {
    fn count(&self, msg: &Message) -> usize;
}

/// ~4 characters per token for text, a fixed per-part overhead, and a flat
/// estimate for images.
pub struct HeuristicTokenizer;

const CHARS_PER_TOKEN: usize = 4;
const PART_OVERHEAD_TOKENS: usize = 4;
const IMAGE_TOKENS: usize = 768;

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, msg: &Message) -> usize {
        msg.parts
            .iter()
            .map(|p| {
                PART_OVERHEAD_TOKENS
                    + match p {
                        Part::Text { text } => text.len() / CHARS_PER_TOKEN,
                        Part::ToolResult { content, .. } => content.len() / CHARS_PER_TOKEN,
                        Part::Image { .. } => IMAGE_TOKENS,
                    }
            })
            .sum::<usize>()
            .max(1)
    }
}

// ─── Context entries and snapshots ────────────────────────────────────────────

/// A keyed block of dynamic context injected into the system prompt every
/// turn.  Entries are never stored in session history.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub key: String,
    pub text: String,
    pub priority: i32,
    pub source: String,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: ContextEntry,
    /// Insertion order, for deterministic priority tie-breaking
    seq: u64,
}

/// Immutable capture of the active window and its counters.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub token_count: usize,
    pub compression_count: u32,
}

/// When the manager wants compression to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Usage crossed the normal threshold
    Normal,
    /// Usage crossed the pre-overflow threshold: snapshot first, compress
    /// aggressively
    PreOverflow,
}

// ─── Context manager ──────────────────────────────────────────────────────────

/// Owns the active message window — the ordered sequence that would be sent
/// to the provider on the next turn.
///
/// Invariants maintained here:
/// - the first element is always the system message;
/// - the cached token total tracks every mutation;
/// - a compression result is applied only if it leaves the system message
///   untouched, keeps the preserve-recent tail byte-identical, and fits the
///   window.
pub struct ContextManager {
    tokenizer: Arc<dyn Tokenizer>,
    config: ContextConfig,
    max_tokens: usize,
    messages: Vec<Message>,
    /// Cached per-message token counts, index-aligned with `messages`
    counts: Vec<usize>,
    total: usize,
    /// Pristine system message kept for pre-send repair
    system: Message,
    entries: Vec<StoredEntry>,
    next_seq: u64,
    snapshots: VecDeque<Snapshot>,
    compression_count: u32,
}

impl ContextManager {
    pub fn new(
        system: Message,
        max_tokens: usize,
        config: ContextConfig,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let mut mgr = Self {
            tokenizer,
            config,
            max_tokens,
            messages: Vec::new(),
            counts: Vec::new(),
            total: 0,
            system: system.clone(),
            entries: Vec::new(),
            next_seq: 0,
            snapshots: VecDeque::new(),
            compression_count: 0,
        };
        mgr.push(system);
        mgr
    }

    pub fn push(&mut self, msg: Message) {
        let tokens = self.tokenizer.count(&msg);
        self.total += tokens;
        self.counts.push(tokens);
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn total_tokens(&self) -> usize {
        self.total
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn compression_count(&self) -> u32 {
        self.compression_count
    }

    /// Adopt a persisted compression count (session resume).
    pub fn set_compression_count(&mut self, count: u32) {
        self.compression_count = count;
    }

    pub fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        Arc::clone(&self.tokenizer)
    }

    /// Fraction of the window consumed (0.0–1.0+)
    pub fn usage(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        self.total as f32 / self.max_tokens as f32
    }

    /// Token count compression should aim for.
    pub fn target_tokens(&self) -> usize {
        (self.max_tokens as f32 * self.config.target_fraction) as usize
    }

    /// Whether compression should run before the next provider call.
    pub fn trigger(&self) -> Option<Trigger> {
        let usage = self.usage();
        if usage >= self.config.pre_overflow_threshold {
            Some(Trigger::PreOverflow)
        } else if usage >= self.config.compression_threshold {
            Some(Trigger::Normal)
        } else {
            None
        }
    }

    /// Replace the whole window (resume, snapshot restore).  The first
    /// message becomes the pristine system copy when it has the system role.
    pub fn replace_window(&mut self, messages: Vec<Message>) {
        if let Some(first) = messages.first() {
            if first.role == Role::System {
                self.system = first.clone();
            }
        }
        self.counts = messages.iter().map(|m| self.tokenizer.count(m)).collect();
        self.total = self.counts.iter().sum();
        self.messages = messages;
    }

    // ── Preserve-recent boundary ──────────────────────────────────────────────

    /// Index of the first message of the preserved tail.
    ///
    /// The tail is the shortest suffix whose token sum reaches the
    /// preserve-recent budget, cut at a message boundary.  The boundary then
    /// moves further back over tool-result messages so a result is never
    /// separated from the assistant message that requested it.  The system
    /// message (index 0) is never part of the tail.
    pub fn tail_start(&self) -> usize {
        let budget = self.config.preserve_recent_tokens;
        let mut start = self.messages.len();
        let mut sum = 0usize;
        while start > 1 && sum < budget {
            start -= 1;
            sum += self.counts[start];
        }
        while start > 1 && self.messages[start].role == Role::Tool {
            start -= 1;
        }
        start
    }

    /// The messages compression must keep verbatim.
    pub fn preserved_tail(&self) -> &[Message] {
        &self.messages[self.tail_start()..]
    }

    // ── Compression application ───────────────────────────────────────────────

    /// Validate and adopt a compressed window.
    ///
    /// Rejects the candidate (keeping the current window and leaving the
    /// compression count alone) unless all three invariants hold:
    /// 1. the system message is unchanged;
    /// 2. the preserve-recent tail is identical;
    /// 3. the new total fits the window.
    pub fn apply_compression(&mut self, window: Vec<Message>) -> Result<(), CoreError> {
        if window.first() != self.messages.first() {
            return Err(CoreError::CompressionFailed(
                "candidate window altered the system message".into(),
            ));
        }

        let tail = self.preserved_tail();
        if window.len() < tail.len() || &window[window.len() - tail.len()..] != tail {
            return Err(CoreError::CompressionFailed(
                "candidate window rewrote the preserved tail".into(),
            ));
        }

        let counts: Vec<usize> = window.iter().map(|m| self.tokenizer.count(m)).collect();
        let total: usize = counts.iter().sum();
        if total > self.max_tokens {
            return Err(CoreError::CompressionFailed(format!(
                "candidate window still oversize: {total} > {}",
                self.max_tokens
            )));
        }

        debug!(
            tokens_before = self.total,
            tokens_after = total,
            "applying compressed window"
        );
        self.messages = window;
        self.counts = counts;
        self.total = total;
        self.compression_count += 1;
        Ok(())
    }

    // ── Dynamic context entries ───────────────────────────────────────────────

    /// Insert or replace a keyed entry.
    pub fn add_entry(&mut self, entry: ContextEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.entry.key == entry.key) {
            existing.entry = entry;
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(StoredEntry { entry, seq });
    }

    /// Remove an entry by key; `false` when no such key existed.
    pub fn remove_entry(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.entry.key != key);
        self.entries.len() != before
    }

    pub fn entries(&self) -> Vec<&ContextEntry> {
        self.entries.iter().map(|e| &e.entry).collect()
    }

    /// Deterministic system-prompt suffix: entries in descending priority,
    /// ties broken by insertion order.
    pub fn system_suffix(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let mut ordered: Vec<&StoredEntry> = self.entries.iter().collect();
        ordered.sort_by(|a, b| b.entry.priority.cmp(&a.entry.priority).then(a.seq.cmp(&b.seq)));
        Some(
            ordered
                .iter()
                .map(|e| e.entry.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
    }

    /// The window as it should be sent to the provider: the stored messages
    /// with the entry suffix folded into the system message text.
    pub fn assemble(&self) -> Vec<Message> {
        let mut out = self.messages.clone();
        if let Some(suffix) = self.system_suffix() {
            if let Some(first) = out.first_mut() {
                if first.role == Role::System {
                    if let Some(Part::Text { text }) = first.parts.first_mut() {
                        text.push_str("\n\n");
                        text.push_str(&suffix);
                    }
                }
            }
        }
        out
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Capture the current window; oldest snapshots roll off beyond the
    /// configured maximum.
    pub fn snapshot(&mut self) -> String {
        let snap = Snapshot {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            messages: self.messages.clone(),
            token_count: self.total,
            compression_count: self.compression_count,
        };
        let id = snap.id.clone();
        self.snapshots.push_back(snap);
        while self.snapshots.len() > self.config.max_snapshots.max(1) {
            self.snapshots.pop_front();
        }
        debug!(snapshot_id = %id, "captured context snapshot");
        id
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Replace the active window and counters from a snapshot, atomically.
    pub fn restore(&mut self, snapshot_id: &str) -> Result<(), CoreError> {
        let snap = self
            .snapshots
            .iter()
            .find(|s| s.id == snapshot_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidContext(format!("unknown snapshot {snapshot_id}")))?;
        self.replace_window(snap.messages);
        self.compression_count = snap.compression_count;
        Ok(())
    }

    // ── Pre-send validation ───────────────────────────────────────────────────

    /// Ensure the window is safe to send: well-formed messages and a system
    /// message in front.  A missing system message is repaired from the
    /// pristine copy; anything else fails the turn.
    pub fn validate_pre_send(&mut self) -> Result<(), CoreError> {
        if self.messages.first().map(|m| m.role) != Some(Role::System) {
            warn!("window lost its system message; reinserting");
            let sys = self.system.clone();
            let tokens = self.tokenizer.count(&sys);
            self.messages.insert(0, sys);
            self.counts.insert(0, tokens);
            self.total += tokens;
        }

        for (i, msg) in self.messages.iter().enumerate() {
            if msg.parts.is_empty() {
                return Err(CoreError::InvalidContext(format!(
                    "message {i} has no parts"
                )));
            }
            for part in &msg.parts {
                if let Part::ToolResult { tool_call_id, .. } = part {
                    if tool_call_id.is_empty() {
                        return Err(CoreError::InvalidContext(format!(
                            "message {i} has a tool result without a call id"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
