// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Danger, ErrorKind, Tool, ToolCall, ToolContext, ToolResult};

/// Built-in tool that reads a UTF-8 text file, optionally a line window of it.
///
/// Runs in-process; no subprocess and no environment involved.
#[derive(Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file and return its content.\n\
         Use 'offset' (1-based line number) and 'limit' (line count) to read\n\
         a window of a large file instead of the whole thing."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to read"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "First line to return, 1-based (optional)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Number of lines to return (optional)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn danger(&self) -> Danger {
        Danger::Safe
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolResult {
        let Some(path) = call.args.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::err(ErrorKind::BadArgs, "missing required 'path' argument");
        };
        let offset = call
            .args
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);

        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::err(ErrorKind::Error, format!("cannot read {path}: {e}"));
            }
        };

        match (offset, limit) {
            (None, None) => ToolResult::ok(content),
            _ => {
                let start = offset.unwrap_or(1).saturating_sub(1);
                let lines: Vec<&str> = content.lines().collect();
                if start >= lines.len() {
                    return ToolResult::err(
                        ErrorKind::Error,
                        format!("offset {} past end of file ({} lines)", start + 1, lines.len()),
                    );
                }
                let end = limit
                    .map(|n| (start + n).min(lines.len()))
                    .unwrap_or(lines.len());
                let window = lines[start..end].join("\n");
                let note = format!("[lines {}-{} of {}]\n", start + 1, end, lines.len());
                ToolResult::ok(format!("{note}{window}"))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "1".into(),
            name: "read_file".into(),
            args,
        }
    }

    fn temp_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[tokio::test]
    async fn reads_whole_file() {
        let f = temp_file("alpha\nbeta\ngamma\n");
        let t = ReadFileTool;
        let out = t
            .execute(
                &call(json!({"path": f.path().to_str().unwrap()})),
                &ToolContext::default(),
            )
            .await;
        assert!(!out.is_error());
        assert!(out.llm_content.contains("alpha"));
        assert!(out.llm_content.contains("gamma"));
    }

    #[tokio::test]
    async fn offset_and_limit_select_window() {
        let f = temp_file("l1\nl2\nl3\nl4\nl5\n");
        let t = ReadFileTool;
        let out = t
            .execute(
                &call(json!({
                    "path": f.path().to_str().unwrap(),
                    "offset": 2,
                    "limit": 2
                })),
                &ToolContext::default(),
            )
            .await;
        assert!(!out.is_error());
        assert!(out.llm_content.contains("l2"));
        assert!(out.llm_content.contains("l3"));
        assert!(!out.llm_content.contains("l4"));
        assert!(out.llm_content.contains("[lines 2-3 of 5]"));
    }

    #[tokio::test]
    async fn offset_past_end_is_error() {
        let f = temp_file("only\n");
        let t = ReadFileTool;
        let out = t
            .execute(
                &call(json!({"path": f.path().to_str().unwrap(), "offset": 10})),
                &ToolContext::default(),
            )
            .await;
        assert!(out.is_error());
        assert!(out.llm_content.contains("past end"));
    }

    #[tokio::test]
    async fn missing_file_is_error_not_panic() {
        let t = ReadFileTool;
        let out = t
            .execute(
                &call(json!({"path": "/nonexistent/ollm/file.txt"})),
                &ToolContext::default(),
            )
            .await;
        assert!(out.is_error());
        assert_eq!(out.error_kind, Some(ErrorKind::Error));
    }

    #[test]
    fn read_file_is_safe() {
        assert_eq!(ReadFileTool.danger(), Danger::Safe);
    }
}
