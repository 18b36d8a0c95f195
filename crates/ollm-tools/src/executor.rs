// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use ollm_config::{ApprovalMode, ToolsConfig};

use crate::{
    approval::{ApprovalHandler, Decision},
    registry::ToolRegistry,
    tool::{Danger, ErrorKind, Tool, ToolCall, ToolContext, ToolResult},
};

/// Extra seconds granted beyond the per-tool timeout before the executor
/// hard-cancels the task.  Subprocess tools use this window to run their own
/// SIGTERM → grace → SIGKILL sequence and report a proper timeout result;
/// only tools that ignore their deadline entirely hit the outer bound.
const TERMINATION_GRACE_SECS: u64 = 3;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub approval_mode: ApprovalMode,
    /// Maximum tool calls running concurrently within one batch
    pub parallelism: usize,
    pub timeout_secs: u64,
    /// Byte cap applied to each result's model-facing content
    pub output_cap_bytes: usize,
}

impl From<&ToolsConfig> for ExecutorConfig {
    fn from(cfg: &ToolsConfig) -> Self {
        Self {
            approval_mode: cfg.approval_mode,
            parallelism: cfg.parallelism.max(1),
            timeout_secs: cfg.timeout_secs,
            output_cap_bytes: cfg.output_cap_bytes,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ToolsConfig::default())
    }
}

/// Validates, approves, and runs tool calls.
///
/// One executor serves a session.  Approval prompts are sequential (a user
/// can only answer one question at a time); execution of approved calls fans
/// out to tasks bounded by the parallelism cap.  Results always come back in
/// call order, regardless of completion order.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalHandler>,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    /// Tools the user approved with "always" for the rest of the session.
    remembered: Mutex<HashSet<String>>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalHandler>,
        config: ExecutorConfig,
    ) -> Self {
        let permits = config.parallelism.max(1);
        Self {
            registry,
            approval,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            remembered: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run a batch of calls as emitted by the model in one assistant turn.
    ///
    /// The returned vector is index-aligned with `calls`.
    pub async fn run_batch(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        // Tools read their deadline from the context; pin it to this
        // executor's configuration so the outer bound is always the longer.
        let mut ctx = ctx.clone();
        ctx.timeout_secs = self.config.timeout_secs;
        let ctx = &ctx;
        // Phase 1: validation and approval, sequentially and in call order.
        // A call that fails here never reaches a worker task.
        let mut ready: Vec<Option<Arc<dyn Tool>>> = Vec::with_capacity(calls.len());
        let mut results: Vec<Option<ToolResult>> = Vec::with_capacity(calls.len());
        for call in calls {
            match self.admit(call).await {
                Ok(tool) => {
                    ready.push(Some(tool));
                    results.push(None);
                }
                Err(res) => {
                    ready.push(None);
                    results.push(Some(res));
                }
            }
        }

        // Phase 2: execute admitted calls concurrently under the cap.
        let mut tasks = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            let Some(tool) = ready[i].take() else {
                tasks.push(None);
                continue;
            };
            let call = call.clone();
            let ctx = ctx.clone();
            let sem = Arc::clone(&self.semaphore);
            let timeout_secs = self.config.timeout_secs;
            tasks.push(Some(tokio::spawn(async move {
                // An acquire error only happens when the semaphore is closed,
                // which this executor never does.
                let _permit = sem.acquire_owned().await;
                if ctx.cancel.is_cancelled() {
                    return ToolResult::err(ErrorKind::Cancelled, "cancelled before start");
                }
                debug!(tool = %call.name, call_id = %call.id, "executing tool");
                match tokio::time::timeout(
                    std::time::Duration::from_secs(timeout_secs + TERMINATION_GRACE_SECS),
                    tool.execute(&call, &ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => ToolResult::err(
                        ErrorKind::Timeout,
                        format!("tool `{}` timed out after {timeout_secs}s", call.name),
                    ),
                }
            })));
        }

        // Phase 3: collect in call order.
        for (i, task) in tasks.into_iter().enumerate() {
            let Some(task) = task else { continue };
            let result = match task.await {
                Ok(r) => r,
                Err(e) => {
                    warn!(tool = %calls[i].name, error = %e, "tool task crashed");
                    ToolResult::err(
                        ErrorKind::Internal,
                        format!("tool `{}` crashed: {e}", calls[i].name),
                    )
                }
            };
            results[i] = Some(self.cap_output(result));
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| ToolResult::err(ErrorKind::Internal, "missing result")))
            .collect()
    }

    /// Resolve, validate, and approve a single call.  `Err` carries the
    /// result to report instead of running.
    async fn admit(&self, call: &ToolCall) -> Result<Arc<dyn Tool>, ToolResult> {
        let Some(tool) = self.registry.get(&call.name) else {
            return Err(ToolResult::err(
                ErrorKind::Error,
                format!("unknown tool: {}", call.name),
            ));
        };

        if let Err(violations) = self.registry.validate(call) {
            return Err(ToolResult::err(
                ErrorKind::BadArgs,
                format!("invalid arguments for `{}`: {violations}", call.name),
            ));
        }

        if !self.needs_prompt(tool.as_ref()) {
            return Ok(tool);
        }
        match self
            .approval
            .request_approval(call.name.as_str(), &call.args, tool.danger())
            .await
        {
            Decision::Approved => Ok(tool),
            Decision::ApprovedAlways => {
                // "Always" never extends to dangerous tools; those re-prompt
                // each call outside yolo mode.
                if tool.danger() != Danger::Dangerous {
                    self.remembered
                        .lock()
                        .expect("remembered approvals lock poisoned")
                        .insert(call.name.clone());
                }
                Ok(tool)
            }
            Decision::Denied => Err(ToolResult::err(
                ErrorKind::Denied,
                format!("user denied execution of `{}`", call.name),
            )),
        }
    }

    fn needs_prompt(&self, tool: &dyn Tool) -> bool {
        let remembered = self
            .remembered
            .lock()
            .expect("remembered approvals lock poisoned")
            .contains(tool.name());
        match self.config.approval_mode {
            ApprovalMode::Yolo => false,
            // Dangerous tools re-prompt every time outside yolo.
            _ if tool.danger() == Danger::Dangerous => true,
            ApprovalMode::AlwaysAsk => !remembered,
            ApprovalMode::AutoApproveSafe => tool.danger() != Danger::Safe && !remembered,
        }
    }

    /// Enforce the per-tool output byte cap: the tail beyond the cap is
    /// dropped and the result annotated.
    fn cap_output(&self, mut result: ToolResult) -> ToolResult {
        let cap = self.config.output_cap_bytes;
        if cap == 0 || result.llm_content.len() <= cap {
            return result;
        }
        let omitted = result.llm_content.len() - cap;
        let mut cut = cap;
        while !result.llm_content.is_char_boundary(cut) {
            cut -= 1;
        }
        result.llm_content.truncate(cut);
        result
            .llm_content
            .push_str(&format!("\n[... output truncated: {omitted} bytes over the cap ...]"));
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    /// Scripted approval handler: pops decisions front-to-back, defaulting
    /// to `Denied` when exhausted.  Records every prompt it saw.
    struct Scripted {
        decisions: Mutex<Vec<Decision>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(decisions: Vec<Decision>) -> Self {
            Self {
                decisions: Mutex::new(decisions),
                prompts: Mutex::new(Vec::new()),
            }
        }
        fn prompt_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ApprovalHandler for Scripted {
        async fn request_approval(&self, tool_name: &str, _args: &Value, _danger: Danger) -> Decision {
            self.prompts.lock().unwrap().push(tool_name.to_string());
            let mut d = self.decisions.lock().unwrap();
            if d.is_empty() {
                Decision::Denied
            } else {
                d.remove(0)
            }
        }
    }

    struct StubTool {
        name: &'static str,
        danger: Danger,
        reply: String,
        delay_ms: u64,
        panics: bool,
    }

    impl StubTool {
        fn safe(name: &'static str, reply: &str) -> Self {
            Self {
                name,
                danger: Danger::Safe,
                reply: reply.into(),
                delay_ms: 0,
                panics: false,
            }
        }
        fn modifying(name: &'static str) -> Self {
            Self {
                name,
                danger: Danger::Modifying,
                reply: "changed".into(),
                delay_ms: 0,
                panics: false,
            }
        }
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test stub"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn danger(&self) -> Danger {
            self.danger
        }
        async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> ToolResult {
            if self.panics {
                panic!("stub tool panic");
            }
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            ToolResult::ok(self.reply.clone())
        }
    }

    fn executor_with(
        tools: Vec<StubTool>,
        approval: Scripted,
        mode: ApprovalMode,
    ) -> ToolExecutor {
        let mut reg = ToolRegistry::new();
        for t in tools {
            reg.register(t);
        }
        ToolExecutor::new(
            Arc::new(reg),
            Arc::new(approval),
            ExecutorConfig {
                approval_mode: mode,
                parallelism: 4,
                timeout_secs: 1,
                output_cap_bytes: 20_000,
            },
        )
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            args: json!({}),
        }
    }

    // ── Happy path and ordering ───────────────────────────────────────────────

    #[tokio::test]
    async fn single_safe_call_runs_without_prompt() {
        let ex = executor_with(
            vec![StubTool::safe("probe", "42")],
            Scripted::new(vec![]),
            ApprovalMode::AutoApproveSafe,
        );
        let out = ex.run_batch(&[call("1", "probe")], &ToolContext::default()).await;
        assert_eq!(out.len(), 1);
        assert!(!out[0].is_error());
        assert_eq!(out[0].llm_content, "42");
    }

    #[tokio::test]
    async fn results_come_back_in_call_order_not_completion_order() {
        let slow = StubTool {
            name: "slow",
            danger: Danger::Safe,
            reply: "slow-done".into(),
            delay_ms: 150,
            panics: false,
        };
        let fast = StubTool::safe("fast", "fast-done");
        let ex = executor_with(vec![slow, fast], Scripted::new(vec![]), ApprovalMode::Yolo);
        let out = ex
            .run_batch(
                &[call("a", "slow"), call("b", "fast")],
                &ToolContext::default(),
            )
            .await;
        assert_eq!(out[0].llm_content, "slow-done");
        assert_eq!(out[1].llm_content, "fast-done");
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn schema_violation_reports_bad_args_without_running() {
        struct StrictTool;
        #[async_trait]
        impl Tool for StrictTool {
            fn name(&self) -> &str {
                "strict"
            }
            fn description(&self) -> &str {
                "wants a string"
            }
            fn parameters_schema(&self) -> Value {
                json!({
                    "type": "object",
                    "properties": { "s": { "type": "string" } },
                    "required": ["s"]
                })
            }
            fn danger(&self) -> Danger {
                Danger::Safe
            }
            async fn execute(&self, _c: &ToolCall, _x: &ToolContext) -> ToolResult {
                panic!("must not run on bad args");
            }
        }
        let mut reg = ToolRegistry::new();
        reg.register(StrictTool);
        let ex = ToolExecutor::new(
            Arc::new(reg),
            Arc::new(Scripted::new(vec![])),
            ExecutorConfig::default(),
        );
        let out = ex.run_batch(&[call("1", "strict")], &ToolContext::default()).await;
        assert!(out[0].is_error());
        assert_eq!(out[0].error_kind, Some(ErrorKind::BadArgs));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let ex = executor_with(vec![], Scripted::new(vec![]), ApprovalMode::Yolo);
        let out = ex.run_batch(&[call("1", "ghost")], &ToolContext::default()).await;
        assert!(out[0].is_error());
        assert!(out[0].llm_content.contains("unknown tool"));
    }

    // ── Approval policy ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn denied_modifying_call_reports_denied() {
        let ex = executor_with(
            vec![StubTool::modifying("writer")],
            Scripted::new(vec![Decision::Denied]),
            ApprovalMode::AutoApproveSafe,
        );
        let out = ex.run_batch(&[call("1", "writer")], &ToolContext::default()).await;
        assert!(out[0].is_error());
        assert_eq!(out[0].error_kind, Some(ErrorKind::Denied));
    }

    #[tokio::test]
    async fn yolo_never_prompts() {
        let approval = Scripted::new(vec![]);
        let ex = executor_with(
            vec![StubTool {
                name: "danger",
                danger: Danger::Dangerous,
                reply: "boom".into(),
                delay_ms: 0,
                panics: false,
            }],
            approval,
            ApprovalMode::Yolo,
        );
        let out = ex.run_batch(&[call("1", "danger")], &ToolContext::default()).await;
        assert!(!out[0].is_error());
    }

    #[tokio::test]
    async fn approved_always_suppresses_future_prompts_for_modifying_tool() {
        let approval = Scripted::new(vec![Decision::ApprovedAlways]);
        let mut reg = ToolRegistry::new();
        reg.register(StubTool::modifying("writer"));
        let ex = ToolExecutor::new(
            Arc::new(reg),
            Arc::new(approval),
            ExecutorConfig {
                approval_mode: ApprovalMode::AutoApproveSafe,
                ..ExecutorConfig::default()
            },
        );
        let ctx = ToolContext::default();
        let out1 = ex.run_batch(&[call("1", "writer")], &ctx).await;
        assert!(!out1[0].is_error());
        // Second call: scripted decisions are exhausted, so a prompt would be
        // denied — the call only succeeds if no prompt happened.
        let out2 = ex.run_batch(&[call("2", "writer")], &ctx).await;
        assert!(!out2[0].is_error(), "remembered approval must skip the prompt");
    }

    #[tokio::test]
    async fn always_ask_prompts_safe_tools_too() {
        let approval = Scripted::new(vec![Decision::Approved]);
        let mut reg = ToolRegistry::new();
        reg.register(StubTool::safe("probe", "ok"));
        let ex = ToolExecutor::new(
            Arc::new(reg),
            Arc::new(approval),
            ExecutorConfig {
                approval_mode: ApprovalMode::AlwaysAsk,
                ..ExecutorConfig::default()
            },
        );
        let out = ex.run_batch(&[call("1", "probe")], &ToolContext::default()).await;
        assert!(!out[0].is_error());
    }

    // ── Failure containment ───────────────────────────────────────────────────

    #[tokio::test]
    async fn timeout_reports_timeout_kind() {
        let ex = executor_with(
            vec![StubTool {
                name: "sleeper",
                danger: Danger::Safe,
                reply: "never".into(),
                delay_ms: 5_000,
                panics: false,
            }],
            Scripted::new(vec![]),
            ApprovalMode::Yolo,
        );
        let out = ex.run_batch(&[call("1", "sleeper")], &ToolContext::default()).await;
        assert!(out[0].is_error());
        assert_eq!(out[0].error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn panicking_tool_reports_internal_error() {
        let ex = executor_with(
            vec![StubTool {
                name: "bomb",
                danger: Danger::Safe,
                reply: String::new(),
                delay_ms: 0,
                panics: true,
            }],
            Scripted::new(vec![]),
            ApprovalMode::Yolo,
        );
        let out = ex.run_batch(&[call("1", "bomb")], &ToolContext::default()).await;
        assert!(out[0].is_error());
        assert_eq!(out[0].error_kind, Some(ErrorKind::Internal));
    }

    #[tokio::test]
    async fn one_panic_does_not_poison_siblings() {
        let ex = executor_with(
            vec![
                StubTool {
                    name: "bomb",
                    danger: Danger::Safe,
                    reply: String::new(),
                    delay_ms: 0,
                    panics: true,
                },
                StubTool::safe("probe", "alive"),
            ],
            Scripted::new(vec![]),
            ApprovalMode::Yolo,
        );
        let out = ex
            .run_batch(
                &[call("a", "bomb"), call("b", "probe")],
                &ToolContext::default(),
            )
            .await;
        assert!(out[0].is_error());
        assert_eq!(out[1].llm_content, "alive");
    }

    // ── Output cap ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_output_truncated_with_annotation() {
        let big = "x".repeat(1000);
        let mut reg = ToolRegistry::new();
        reg.register(StubTool::safe("bigmouth", &big));
        let ex = ToolExecutor::new(
            Arc::new(reg),
            Arc::new(Scripted::new(vec![])),
            ExecutorConfig {
                approval_mode: ApprovalMode::Yolo,
                parallelism: 1,
                timeout_secs: 5,
                output_cap_bytes: 100,
            },
        );
        let out = ex.run_batch(&[call("1", "bigmouth")], &ToolContext::default()).await;
        assert!(out[0].llm_content.len() < 1000);
        assert!(out[0].llm_content.contains("truncated"));
        assert!(out[0].llm_content.starts_with("xxx"), "head must be kept");
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits_execution() {
        let ctx = ToolContext::default();
        ctx.cancel.cancel();
        let ex = executor_with(
            vec![StubTool::safe("probe", "ok")],
            Scripted::new(vec![]),
            ApprovalMode::Yolo,
        );
        let out = ex.run_batch(&[call("1", "probe")], &ctx).await;
        assert_eq!(out[0].error_kind, Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn prompt_records_tool_name() {
        let approval = Arc::new(Scripted::new(vec![Decision::Approved]));
        let mut reg = ToolRegistry::new();
        reg.register(StubTool::modifying("writer"));
        let handler: Arc<dyn ApprovalHandler> = Arc::clone(&approval) as Arc<dyn ApprovalHandler>;
        let ex = ToolExecutor::new(
            Arc::new(reg),
            handler,
            ExecutorConfig {
                approval_mode: ApprovalMode::AutoApproveSafe,
                ..ExecutorConfig::default()
            },
        );
        let _ = ex.run_batch(&[call("1", "writer")], &ToolContext::default()).await;
        assert_eq!(approval.prompt_count(), 1);
    }
}
