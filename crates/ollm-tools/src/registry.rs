// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::Validator;
use tracing::warn;

use crate::tool::{Tool, ToolCall};

/// A tool schema as handed to the provider – mirrors
/// `ollm_model::ToolSchema` but keeps this crate independent from the model
/// crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools, keyed by name.
///
/// Each tool's parameter schema is compiled once at registration; argument
/// validation runs against the compiled form before any approval prompt or
/// subprocess.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    validators: HashMap<String, Validator>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            validators: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_boxed(Box::new(tool));
    }

    pub fn register_boxed(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        match jsonschema::validator_for(&tool.parameters_schema()) {
            Ok(v) => {
                self.validators.insert(name.clone(), v);
            }
            Err(e) => {
                // A broken schema disables validation for that tool only.
                warn!(tool = %name, error = %e, "invalid parameter schema; arguments will not be validated");
            }
        }
        self.tools.insert(name, Arc::from(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Produce schemas for all registered tools, sorted by name so the
    /// request payload is deterministic.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Validate a call's arguments against the tool's compiled schema.
    ///
    /// `Err` carries a human-readable list of violations for the model.
    pub fn validate(&self, call: &ToolCall) -> Result<(), String> {
        let Some(validator) = self.validators.get(&call.name) else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(&call.args)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
