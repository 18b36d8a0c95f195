// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ollm_config::{CompressionStrategy, Config};
use ollm_model::{ChatOptions, ChatRequest, Message, Provider, Role, StreamEvent};
use ollm_session::{CallStatus, SessionRecord, SessionStore, ToolCallRecord, ToolCallResult};
use ollm_tools::{EnvRules, ToolCall, ToolContext, ToolExecutor, ToolResult};

use crate::{
    compress::{CompressionOutcome, CompressionRequest, Compressor},
    context::{ContextEntry, ContextManager, HeuristicTokenizer, Trigger},
    error::CoreError,
    events::Notification,
    loop_detect::{LoopDetector, LoopPattern},
};

/// Orchestrates one conversation: assembles the prompt, streams the model,
/// dispatches tool calls, feeds results back, and keeps the session store,
/// context manager, and loop detector in agreement.
///
/// One runtime drives one session; one turn runs at a time.
pub struct ConversationRuntime {
    provider: Arc<dyn Provider>,
    executor: Arc<ToolExecutor>,
    store: SessionStore,
    session_id: String,
    context: ContextManager,
    detector: LoopDetector,
    compressor: Compressor,
    config: Arc<Config>,
    env_rules: EnvRules,
    /// Sanitized once at construction; handed to every tool subprocess
    sanitized_env: BTreeMap<String, String>,
    /// Raw parent environment, kept only to know which values to redact
    raw_env: Vec<(String, String)>,
}

impl ConversationRuntime {
    /// Start a new session.
    pub fn new(
        provider: Arc<dyn Provider>,
        executor: Arc<ToolExecutor>,
        mut store: SessionStore,
        config: Arc<Config>,
        system_prompt: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let session_id = store.create(&config.model.name, &config.model.provider)?;
        if let Err(e) = store.enforce_retention(config.session.max_sessions) {
            warn!(error = %e, "session retention sweep failed");
        }

        let system = Message::system(system_prompt.into());
        store.append_message(&session_id, system.clone())?;

        let env_rules = EnvRules::new(
            &config.tools.env_allow,
            &config.tools.env_deny,
            config.tools.env_clear_defaults,
        );
        let raw_env: Vec<(String, String)> = std::env::vars().collect();
        let sanitized_env = env_rules.sanitize(raw_env.iter().cloned());

        let context = ContextManager::new(
            system,
            config.model.context_size as usize,
            config.context.clone(),
            Arc::new(HeuristicTokenizer),
        );
        let detector = LoopDetector::new(config.loop_detection.clone());
        let compressor = Compressor::new(Arc::clone(&provider));

        let mut runtime = Self {
            provider,
            executor,
            store,
            session_id,
            context,
            detector,
            compressor,
            config,
            env_rules,
            sanitized_env,
            raw_env,
        };
        runtime.flush_session();
        Ok(runtime)
    }

    /// Reopen a persisted session and continue it.
    pub fn resume(
        provider: Arc<dyn Provider>,
        executor: Arc<ToolExecutor>,
        mut store: SessionStore,
        config: Arc<Config>,
        session_id: &str,
    ) -> Result<Self, CoreError> {
        let record = store.load(session_id)?.clone();

        let env_rules = EnvRules::new(
            &config.tools.env_allow,
            &config.tools.env_deny,
            config.tools.env_clear_defaults,
        );
        let raw_env: Vec<(String, String)> = std::env::vars().collect();
        let sanitized_env = env_rules.sanitize(raw_env.iter().cloned());

        let system = record
            .messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned()
            .unwrap_or_else(|| Message::system("You are a helpful assistant."));
        let mut context = ContextManager::new(
            system,
            config.model.context_size as usize,
            config.context.clone(),
            Arc::new(HeuristicTokenizer),
        );
        context.replace_window(record.messages.clone());
        context.set_compression_count(record.metadata.compression_count);

        let detector = LoopDetector::new(config.loop_detection.clone());
        let compressor = Compressor::new(Arc::clone(&provider));

        Ok(Self {
            provider,
            executor,
            store,
            session_id: session_id.to_string(),
            context,
            detector,
            compressor,
            config,
            env_rules,
            sanitized_env,
            raw_env,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        self.store.get(&self.session_id)
    }

    pub fn context(&self) -> &ContextManager {
        &self.context
    }

    /// Register a dynamic context entry included in every turn.
    pub fn add_context_entry(&mut self, entry: ContextEntry) {
        self.context.add_entry(entry);
    }

    pub fn remove_context_entry(&mut self, key: &str) -> bool {
        self.context.remove_entry(key)
    }

    /// Capture a context snapshot on demand.
    pub fn snapshot(&mut self) -> String {
        self.context.snapshot()
    }

    /// Restore a snapshot, replacing the active window and updating the
    /// session store to match.
    pub fn restore_snapshot(&mut self, snapshot_id: &str) -> Result<(), CoreError> {
        self.context.restore(snapshot_id)?;
        self.store
            .replace_messages(&self.session_id, self.context.messages().to_vec())?;
        self.sync_metadata();
        self.flush_session();
        Ok(())
    }

    /// Pre-load history (e.g. piped conversation input) without submitting.
    /// System messages are skipped; the runtime's own system message stays.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        for msg in messages {
            if msg.role == Role::System {
                continue;
            }
            self.record_message(msg);
        }
    }

    // ── The turn loop ─────────────────────────────────────────────────────────

    /// Process one user input to its final assistant message, streaming
    /// notifications along the way.  Cancellation is honoured at every
    /// suspension point and is not an error.
    pub async fn submit(
        &mut self,
        input: &str,
        tx: &mpsc::Sender<Notification>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        if cancel.is_cancelled() {
            let _ = tx
                .send(Notification::Aborted {
                    partial_text: String::new(),
                })
                .await;
            return Ok(());
        }

        // A new top-level user message resets loop-detection state.
        self.detector.reset();
        let _ = tx
            .send(Notification::TurnStarted {
                session_id: self.session_id.clone(),
            })
            .await;

        self.record_message(Message::user(input));

        let turn_started = std::time::Instant::now();
        let mut soft_cap_warned = false;
        let mut partial_text = String::new();

        loop {
            // Each provider round — the initial one and every tool-use
            // iteration — counts as one turn toward the loop detector.
            self.detector.begin_turn();
            if let Some(pattern) = self.detector.check() {
                self.abort_for_loop(pattern, tx).await;
                self.flush_session();
                return Ok(());
            }

            let soft_cap = self.config.loop_detection.turn_soft_cap_secs;
            if soft_cap > 0 && !soft_cap_warned && turn_started.elapsed().as_secs() > soft_cap {
                soft_cap_warned = true;
                let _ = tx
                    .send(Notification::Warning(format!(
                        "turn has been running for over {soft_cap}s"
                    )))
                    .await;
            }

            self.ensure_fits(tx).await?;
            self.context.validate_pre_send()?;

            let mut round_text = String::new();
            let streamed = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.stream_turn(tx, &mut round_text) => Some(result),
            };

            let (text, tool_calls) = match streamed {
                None => {
                    // Cancelled mid-stream: commit what we have, no error.
                    partial_text.push_str(&round_text);
                    if !partial_text.is_empty() {
                        self.record_message(Message::assistant(partial_text.clone()));
                    }
                    let _ = tx.send(Notification::Aborted { partial_text }).await;
                    self.flush_session();
                    return Ok(());
                }
                Some(Err(e)) => {
                    let msg = match &e {
                        CoreError::Provider(m) => m.clone(),
                        other => other.to_string(),
                    };
                    partial_text.push_str(&round_text);
                    if !partial_text.is_empty() {
                        self.record_message(Message::assistant(format!(
                            "{partial_text}\n[interrupted]"
                        )));
                    }
                    let _ = tx.send(Notification::ProviderError(msg)).await;
                    self.flush_session();
                    return Err(e);
                }
                Some(Ok(calls)) => (round_text, calls),
            };

            if !text.is_empty() {
                partial_text.push_str(&text);
                self.record_message(Message::assistant(text.clone()));
                self.detector.record_output(&text);
            }

            if tool_calls.is_empty() {
                let _ = tx.send(Notification::TurnCompleted).await;
                self.flush_session();
                return Ok(());
            }

            // Phase 1: record placeholder assistant messages so the
            // conversation shows the calls before their results.
            for call in &tool_calls {
                let _ = tx
                    .send(Notification::ToolStarted { call: call.clone() })
                    .await;
                self.record_message(Message::assistant(format!(
                    "[tool_call: {}({})]",
                    call.name, call.args
                )));
            }

            // Phase 2: run the batch; results come back in call order.
            let ctx = ToolContext {
                env: self.sanitized_env.clone(),
                cancel: cancel.clone(),
                workdir: None,
                timeout_secs: self.config.tools.timeout_secs,
            };
            let results = self.executor.run_batch(&tool_calls, &ctx).await;

            // Phase 3: feed results back, in the model's emission order.
            for (call, result) in tool_calls.iter().zip(results.iter()) {
                let output = if result.is_error() {
                    self.redact(&result.llm_content)
                } else {
                    result.llm_content.clone()
                };
                let _ = tx
                    .send(Notification::ToolCompleted {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        output: output.clone(),
                        is_error: result.is_error(),
                    })
                    .await;
                self.record_message(Message::tool_result(call.id.as_str(), output.as_str()));
                self.record_tool_call(call, result, output);
                self.detector.record_tool_call(&call.name, &call.args);
            }

            self.flush_session();

            if cancel.is_cancelled() {
                let _ = tx.send(Notification::Aborted { partial_text }).await;
                return Ok(());
            }
        }
    }

    /// One provider round: send the assembled context, consume the event
    /// stream, return any tool calls.
    ///
    /// Text accumulates into the caller's buffer so that whatever streamed
    /// before an error or a cancellation survives and can be committed.
    async fn stream_turn(
        &mut self,
        tx: &mpsc::Sender<Notification>,
        text: &mut String,
    ) -> Result<Vec<ToolCall>, CoreError> {
        let tools: Vec<ollm_model::ToolSchema> = self
            .executor
            .registry()
            .schemas()
            .into_iter()
            .map(|s| ollm_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let request = ChatRequest {
            messages: self.context.assemble(),
            tools,
            options: ChatOptions {
                temperature: self.config.model.temperature,
                max_tokens: self.config.model.max_tokens,
                context_size: Some(self.config.model.context_size),
            },
        };

        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            "calling provider"
        );
        let mut stream = self
            .provider
            .chat_stream(request)
            .await
            .map_err(|e| CoreError::Provider(self.redact(&e.to_string())))?;

        let read_timeout =
            std::time::Duration::from_secs(self.config.model.read_timeout_secs.max(1));
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        loop {
            let next = tokio::time::timeout(read_timeout, stream.next())
                .await
                .map_err(|_| {
                    CoreError::Provider(format!(
                        "no data from provider for {}s",
                        read_timeout.as_secs()
                    ))
                })?;
            let Some(event) = next else {
                // Stream ended without a finish event; treat as finished.
                break;
            };
            match event.map_err(|e| CoreError::Provider(self.redact(&e.to_string())))? {
                StreamEvent::TextDelta(delta) if !delta.is_empty() => {
                    text.push_str(&delta);
                    let _ = tx.send(Notification::TextDelta(delta)).await;
                }
                StreamEvent::TextDelta(_) => {}
                StreamEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let entry = pending.entry(index).or_default();
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                StreamEvent::Finish(_) => break,
                StreamEvent::Error(e) => {
                    return Err(CoreError::Provider(self.redact(&e)));
                }
            }
        }

        if !text.is_empty() {
            let _ = tx.send(Notification::TextComplete(text.clone())).await;
        }

        // Assemble accumulated tool calls ordered by their stream index.  A
        // call without a name cannot be dispatched and is dropped; a missing
        // id gets a synthetic one so its result can still be linked.
        let mut ordered: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        ordered.sort_by_key(|(index, _)| *index);
        let mut calls = Vec::new();
        for (i, (_, entry)) in ordered.into_iter().enumerate() {
            if entry.name.is_empty() {
                warn!(call_id = %entry.id, "dropping tool call with no name");
                continue;
            }
            calls.push(entry.finish(i));
        }

        Ok(calls)
    }

    // ── Compression ───────────────────────────────────────────────────────────

    /// Compress the window when usage crossed a threshold, escalating
    /// summarize → truncate on inflation.  On terminal failure the turn
    /// aborts only if the window no longer fits at all.
    async fn ensure_fits(&mut self, tx: &mpsc::Sender<Notification>) -> Result<(), CoreError> {
        let Some(trigger) = self.context.trigger() else {
            return Ok(());
        };

        if trigger == Trigger::PreOverflow {
            self.context.snapshot();
        }
        let strategy = match trigger {
            Trigger::PreOverflow => CompressionStrategy::Truncate,
            Trigger::Normal => self.config.context.strategy,
        };

        let tokens_before = self.context.total_tokens();
        let tokenizer = self.context.tokenizer();
        let mut request = CompressionRequest {
            strategy,
            tail_start: self.context.tail_start(),
            target_tokens: self.context.target_tokens(),
            summary_max_tokens: self.config.context.summary_max_tokens,
        };

        loop {
            let outcome = self
                .compressor
                .compress(self.context.messages(), tokenizer.as_ref(), &request)
                .await;
            match outcome {
                CompressionOutcome::Applied {
                    window,
                    strategy_used,
                    fell_back,
                    ..
                } => {
                    return match self.context.apply_compression(window) {
                        Ok(()) => {
                            self.sync_metadata();
                            let _ = tx
                                .send(Notification::CompressionApplied {
                                    tokens_before,
                                    tokens_after: self.context.total_tokens(),
                                    strategy: strategy_used,
                                    fell_back,
                                })
                                .await;
                            Ok(())
                        }
                        Err(e) => self.compression_terminal(tx, e.to_string()).await,
                    };
                }
                CompressionOutcome::Inflated {
                    original_tokens,
                    candidate_tokens,
                } => {
                    if request.strategy != CompressionStrategy::Truncate {
                        debug!(
                            original_tokens,
                            candidate_tokens, "compression inflated; escalating to truncate"
                        );
                        request.strategy = CompressionStrategy::Truncate;
                        continue;
                    }
                    return self
                        .compression_terminal(
                            tx,
                            format!(
                                "inflation even when truncating ({original_tokens} -> {candidate_tokens})"
                            ),
                        )
                        .await;
                }
            }
        }
    }

    /// Terminal compression failure: abort iff the context exceeds the
    /// window, otherwise warn and carry on.
    async fn compression_terminal(
        &mut self,
        tx: &mpsc::Sender<Notification>,
        reason: String,
    ) -> Result<(), CoreError> {
        let current = self.context.total_tokens();
        let max = self.context.max_tokens();
        if current > max {
            return Err(CoreError::ContextOverflow { current, max });
        }
        warn!(reason = %reason, "compression failed; continuing with the current window");
        let _ = tx
            .send(Notification::Warning(format!("compression failed: {reason}")))
            .await;
        Ok(())
    }

    // ── Bookkeeping ───────────────────────────────────────────────────────────

    /// Append to both the session store and the active context.  A store
    /// failure is logged and retried on the next flush; the in-memory state
    /// stays authoritative.
    fn record_message(&mut self, msg: Message) {
        if let Err(e) = self.store.append_message(&self.session_id, msg.clone()) {
            warn!(error = %e, "failed to append message to session store");
        }
        self.context.push(msg);
        self.sync_metadata();
    }

    fn record_tool_call(&mut self, call: &ToolCall, result: &ToolResult, output: String) {
        let record = ToolCallRecord {
            id: call.id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
            result: ToolCallResult {
                llm_content: output,
                return_display: result.return_display.clone(),
            },
            status: if result.is_error() {
                CallStatus::Error
            } else {
                CallStatus::Ok
            },
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.store.append_tool_call(&self.session_id, record) {
            warn!(error = %e, "failed to append tool call to session store");
        }
    }

    fn sync_metadata(&mut self) {
        let _ = self.store.set_metadata(
            &self.session_id,
            self.context.total_tokens() as u64,
            self.context.compression_count(),
        );
    }

    fn flush_session(&mut self) {
        if let Err(e) = self.store.flush(&self.session_id) {
            warn!(error = %e, "session flush failed; will retry on next flush");
        }
    }

    async fn abort_for_loop(&mut self, pattern: LoopPattern, tx: &mpsc::Sender<Notification>) {
        warn!(pattern = %pattern, "aborting turn: loop detected");
        self.record_message(Message::system(format!(
            "Turn aborted: {pattern}. The request was stopped to prevent a runaway loop; \
             wait for new user input before retrying."
        )));
        let _ = tx.send(Notification::LoopDetected(pattern)).await;
    }

    /// Strip secret values (per the environment deny rules) from a string
    /// before it reaches logs or notifications.
    fn redact(&self, text: &str) -> String {
        self.env_rules
            .redact(text, self.raw_env.iter().map(|(k, v)| (k, v)))
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    /// Resolve to a dispatchable call.  Arguments always become a JSON
    /// object: empty or unparsable buffers turn into `{}` so a malformed
    /// model emission degrades to a schema-validation error instead of
    /// poisoning the turn.
    fn finish(self, position: usize) -> ToolCall {
        let args = if self.args_buf.trim().is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        error = %e,
                        "tool call arguments are not valid JSON; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        let id = if self.id.is_empty() {
            format!("call_synthetic_{position}")
        } else {
            self.id
        };
        ToolCall {
            id,
            name: self.name,
            args,
        }
    }
}
