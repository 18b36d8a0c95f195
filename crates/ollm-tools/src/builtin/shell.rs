// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
#[cfg(unix)]
use libc;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::tool::{Danger, ErrorKind, Tool, ToolCall, ToolContext, ToolResult};

/// Grace period between SIGTERM and SIGKILL when a command overruns its
/// timeout or the turn is cancelled.
const KILL_GRACE_SECS: u64 = 2;

/// Built-in tool that runs a shell command in a subprocess.
///
/// The subprocess sees only the sanitized environment from the tool context,
/// never the parent environment.
#[derive(Default)]
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required and can be any bash one-liner.\n\
         Prefer non-interactive commands; avoid commands that require a TTY.\n\
         Long output is truncated to fit the context budget."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete bash one-liner to execute."
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn danger(&self) -> Danger {
        Danger::Modifying
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => {
                return ToolResult::err(
                    ErrorKind::BadArgs,
                    "missing required 'command' argument",
                );
            }
        };
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(ctx.timeout_secs);

        debug!(cmd = %command, "executing shell tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        // The subprocess gets exactly the sanitized environment — nothing
        // inherited from the parent process.
        cmd.env_clear();
        cmd.envs(&ctx.env);
        // `stdin(Stdio::null())` keeps the subprocess away from the
        // controlling terminal; `kill_on_drop(true)` is the backstop if this
        // future is dropped while the child is still running.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // setsid() detaches the child from the controlling terminal so it
        // cannot open /dev/tty behind our back.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        if let Some(wd) = call.args.get("workdir").and_then(|v| v.as_str()) {
            cmd.current_dir(wd);
        } else if let Some(wd) = &ctx.workdir {
            cmd.current_dir(wd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::err(ErrorKind::Error, format!("spawn error: {e}")),
        };

        // Drain both pipes concurrently with the wait so a chatty command
        // cannot deadlock on a full pipe buffer.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => match status {
                Ok(s) => s,
                Err(e) => return ToolResult::err(ErrorKind::Error, format!("wait error: {e}")),
            },
            _ = tokio::time::sleep(std::time::Duration::from_secs(timeout)) => {
                terminate(&mut child).await;
                return ToolResult::err(
                    ErrorKind::Timeout,
                    format!("timeout after {timeout}s"),
                );
            }
            _ = ctx.cancel.cancelled() => {
                terminate(&mut child).await;
                return ToolResult::err(ErrorKind::Cancelled, "cancelled");
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        let mut content = String::new();
        if !stdout.is_empty() {
            content.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&stderr);
        }

        let code = status.code().unwrap_or(-1);
        if code == 0 {
            if content.is_empty() {
                content = "[exit 0]".into();
            }
            ToolResult::ok(content)
        } else if code == 1 {
            // Exit code 1 is the Unix convention for "no matches" (grep/rg),
            // "condition false" (test/[), and similar non-fatal empty results.
            let out = if content.is_empty() {
                "[exit 1]".to_string()
            } else {
                format!("[exit 1]\n{content}")
            };
            ToolResult::ok(out)
        } else {
            ToolResult::err(ErrorKind::Error, format!("[exit {code}]\n{content}"))
        }
    }
}

/// Stop a subprocess: SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let grace = std::time::Duration::from_secs(KILL_GRACE_SECS);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
