// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;

use serde_json::Value;
use sha2::{Digest, Sha256};

use ollm_config::LoopConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    TurnLimit,
    ToolRepetition,
    OutputRepetition,
}

/// A detected runaway pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopPattern {
    pub kind: LoopKind,
    pub details: String,
    pub count: u32,
}

impl std::fmt::Display for LoopPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            LoopKind::TurnLimit => {
                write!(f, "turn limit exceeded after {} turns", self.count)
            }
            LoopKind::ToolRepetition => write!(
                f,
                "tool `{}` called {} times with identical arguments",
                self.details, self.count
            ),
            LoopKind::OutputRepetition => {
                write!(f, "identical output produced {} times in a row", self.count)
            }
        }
    }
}

/// Watches the conversation for runaway agent loops.
///
/// Holds only fingerprints — never message bodies.  State resets when the
/// user sends a new top-level message.
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopConfig,
    turns: u32,
    /// `(tool name, fingerprint)` of the most recent tool calls
    tool_window: VecDeque<(String, String)>,
    output_window: VecDeque<String>,
}

impl LoopDetector {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            turns: 0,
            tool_window: VecDeque::new(),
            output_window: VecDeque::new(),
        }
    }

    /// Count one tool-use iteration toward the turn limit.
    pub fn begin_turn(&mut self) {
        self.turns += 1;
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }

    pub fn record_tool_call(&mut self, name: &str, args: &Value) {
        let fp = fingerprint(name, args);
        self.tool_window.push_back((name.to_string(), fp));
        while self.tool_window.len() > self.config.repeat_threshold {
            self.tool_window.pop_front();
        }
    }

    pub fn record_output(&mut self, text: &str) {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        self.output_window.push_back(hex::encode(hasher.finalize()));
        while self.output_window.len() > self.config.repeat_threshold {
            self.output_window.pop_front();
        }
    }

    /// Report the first tripped detection condition, if any.
    pub fn check(&self) -> Option<LoopPattern> {
        if self.turns > self.config.max_turns {
            return Some(LoopPattern {
                kind: LoopKind::TurnLimit,
                details: format!("max_turns = {}", self.config.max_turns),
                count: self.turns,
            });
        }

        let threshold = self.config.repeat_threshold;
        if self.config.detect_tool_repetition && threshold > 0 && self.tool_window.len() == threshold
        {
            let (first_name, first_fp) = &self.tool_window[0];
            if self.tool_window.iter().all(|(_, fp)| fp == first_fp) {
                return Some(LoopPattern {
                    kind: LoopKind::ToolRepetition,
                    details: first_name.clone(),
                    count: threshold as u32,
                });
            }
        }

        if self.config.detect_output_repetition
            && threshold > 0
            && self.output_window.len() == threshold
        {
            let first = &self.output_window[0];
            if self.output_window.iter().all(|fp| fp == first) {
                return Some(LoopPattern {
                    kind: LoopKind::OutputRepetition,
                    details: String::new(),
                    count: threshold as u32,
                });
            }
        }

        None
    }

    /// Forget everything; called when the user sends a new top-level message.
    pub fn reset(&mut self) {
        self.turns = 0;
        self.tool_window.clear();
        self.output_window.clear();
    }
}

/// Stable content hash of a tool call: name plus canonicalized arguments.
fn fingerprint(name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0]);
    hasher.update(canonicalize(args).as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a JSON value with all object keys sorted recursively, so that
/// argument objects hash identically regardless of key order.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonicalize(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn config(max_turns: u32, repeat_threshold: usize) -> LoopConfig {
        LoopConfig {
            max_turns,
            repeat_threshold,
            ..LoopConfig::default()
        }
    }

    // ── Canonicalization ──────────────────────────────────────────────────────

    #[test]
    fn key_order_does_not_change_the_fingerprint() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(fingerprint("t", &a), fingerprint("t", &b));
    }

    #[test]
    fn different_values_change_the_fingerprint() {
        assert_ne!(
            fingerprint("t", &json!({"a": 1})),
            fingerprint("t", &json!({"a": 2}))
        );
    }

    #[test]
    fn tool_name_is_part_of_the_fingerprint() {
        let args = json!({"a": 1});
        assert_ne!(fingerprint("x", &args), fingerprint("y", &args));
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(
            fingerprint("t", &json!([1, 2])),
            fingerprint("t", &json!([2, 1]))
        );
    }

    // ── Turn limit ────────────────────────────────────────────────────────────

    #[test]
    fn no_detection_at_or_under_max_turns() {
        let mut d = LoopDetector::new(config(3, 5));
        for _ in 0..3 {
            d.begin_turn();
        }
        assert!(d.check().is_none());
    }

    #[test]
    fn detection_fires_past_max_turns() {
        let mut d = LoopDetector::new(config(3, 5));
        for _ in 0..4 {
            d.begin_turn();
        }
        let p = d.check().expect("must trip");
        assert_eq!(p.kind, LoopKind::TurnLimit);
        assert_eq!(p.count, 4);
    }

    // ── Tool repetition ───────────────────────────────────────────────────────

    #[test]
    fn identical_tool_calls_trip_at_threshold() {
        let mut d = LoopDetector::new(config(50, 3));
        for _ in 0..2 {
            d.record_tool_call("shell", &json!({"command": "ls"}));
            assert!(d.check().is_none(), "must not fire before the threshold");
        }
        d.record_tool_call("shell", &json!({"command": "ls"}));
        let p = d.check().expect("must trip on the last one");
        assert_eq!(p.kind, LoopKind::ToolRepetition);
        assert_eq!(p.details, "shell");
        assert_eq!(p.count, 3);
    }

    #[test]
    fn differing_arguments_do_not_trip() {
        let mut d = LoopDetector::new(config(50, 3));
        d.record_tool_call("shell", &json!({"command": "ls"}));
        d.record_tool_call("shell", &json!({"command": "pwd"}));
        d.record_tool_call("shell", &json!({"command": "ls"}));
        assert!(d.check().is_none());
    }

    #[test]
    fn a_break_in_the_run_resets_the_window() {
        let mut d = LoopDetector::new(config(50, 3));
        d.record_tool_call("shell", &json!({"c": 1}));
        d.record_tool_call("shell", &json!({"c": 1}));
        d.record_tool_call("shell", &json!({"c": 2}));
        d.record_tool_call("shell", &json!({"c": 1}));
        d.record_tool_call("shell", &json!({"c": 1}));
        assert!(d.check().is_none(), "run of 2 after a break must not trip");
    }

    #[test]
    fn tool_detection_can_be_disabled() {
        let mut cfg = config(50, 2);
        cfg.detect_tool_repetition = false;
        let mut d = LoopDetector::new(cfg);
        d.record_tool_call("shell", &json!({}));
        d.record_tool_call("shell", &json!({}));
        assert!(d.check().is_none());
    }

    // ── Output repetition ─────────────────────────────────────────────────────

    #[test]
    fn identical_outputs_trip_at_threshold() {
        let mut d = LoopDetector::new(config(50, 3));
        d.record_output("same answer");
        d.record_output("same answer");
        assert!(d.check().is_none());
        d.record_output("same answer");
        let p = d.check().expect("must trip");
        assert_eq!(p.kind, LoopKind::OutputRepetition);
    }

    #[test]
    fn varied_outputs_do_not_trip() {
        let mut d = LoopDetector::new(config(50, 3));
        d.record_output("a");
        d.record_output("b");
        d.record_output("a");
        assert!(d.check().is_none());
    }

    #[test]
    fn output_detection_can_be_disabled() {
        let mut cfg = config(50, 2);
        cfg.detect_output_repetition = false;
        let mut d = LoopDetector::new(cfg);
        d.record_output("x");
        d.record_output("x");
        assert!(d.check().is_none());
    }

    // ── Reset ─────────────────────────────────────────────────────────────────

    #[test]
    fn reset_clears_all_state() {
        let mut d = LoopDetector::new(config(2, 2));
        d.begin_turn();
        d.begin_turn();
        d.begin_turn();
        d.record_tool_call("t", &json!({}));
        d.record_tool_call("t", &json!({}));
        assert!(d.check().is_some());
        d.reset();
        assert!(d.check().is_none());
        assert_eq!(d.turns(), 0);
    }

    // ── Property tests ────────────────────────────────────────────────────────

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// For any run of ≥ threshold identical tool fingerprints, detection
        /// fires exactly on the last one of the first qualifying run.
        #[test]
        fn tool_repetition_fires_on_the_last(
            threshold in 2usize..6,
            run_len in 0usize..10,
            command in "[a-z]{1,8}",
        ) {
            let mut d = LoopDetector::new(config(1000, threshold));
            let mut fired_at = None;
            for i in 0..run_len {
                d.record_tool_call("shell", &json!({"command": command.clone()}));
                if d.check().is_some() && fired_at.is_none() {
                    fired_at = Some(i + 1);
                }
            }
            if run_len >= threshold {
                prop_assert_eq!(fired_at, Some(threshold));
            } else {
                prop_assert_eq!(fired_at, None);
            }
        }

        /// Analogous guarantee for output fingerprints.
        #[test]
        fn output_repetition_fires_on_the_last(
            threshold in 2usize..6,
            run_len in 0usize..10,
            text in "[ -~]{1,16}",
        ) {
            let mut d = LoopDetector::new(config(1000, threshold));
            let mut fired_at = None;
            for i in 0..run_len {
                d.record_output(&text);
                if d.check().is_some() && fired_at.is_none() {
                    fired_at = Some(i + 1);
                }
            }
            if run_len >= threshold {
                prop_assert_eq!(fired_at, Some(threshold));
            } else {
                prop_assert_eq!(fired_at, None);
            }
        }

        /// The turn counter trips detection exactly when it passes max_turns.
        #[test]
        fn turn_limit_fires_when_exceeded(max_turns in 1u32..20, extra in 0u32..5) {
            let mut d = LoopDetector::new(config(max_turns, 99));
            for _ in 0..max_turns {
                d.begin_turn();
                prop_assert!(d.check().is_none());
            }
            for _ in 0..extra {
                d.begin_turn();
                let fired_turn_limit = matches!(
                    d.check(),
                    Some(LoopPattern { kind: LoopKind::TurnLimit, .. })
                );
                prop_assert!(fired_turn_limit);
            }
        }
    }
}
