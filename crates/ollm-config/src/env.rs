// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use tracing::warn;

use crate::Config;

/// Apply `OLLM_*` environment overrides from the process environment.
///
/// These take priority over every config file layer; the CLI flags applied
/// by the caller afterwards take priority over both.
pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, std::env::vars());
}

/// Pure form of [`apply_env_overrides`] used by tests: overrides are read
/// from the supplied iterator rather than the process environment.
pub fn apply_env_overrides_from(
    config: &mut Config,
    vars: impl IntoIterator<Item = (String, String)>,
) {
    for (name, value) in vars {
        match name.as_str() {
            "OLLM_MODEL" => config.model.name = value,
            "OLLM_PROVIDER" => config.model.provider = value,
            "OLLM_HOST" => config.model.host = Some(value),
            "OLLM_TEMPERATURE" => match value.parse::<f32>() {
                Ok(t) => config.model.temperature = Some(t),
                Err(_) => warn!(value = %value, "ignoring unparsable OLLM_TEMPERATURE"),
            },
            "OLLM_MAX_TOKENS" => match value.parse::<u32>() {
                Ok(n) => config.model.max_tokens = Some(n),
                Err(_) => warn!(value = %value, "ignoring unparsable OLLM_MAX_TOKENS"),
            },
            "OLLM_CONTEXT_SIZE" => match value.parse::<u32>() {
                Ok(n) => config.model.context_size = n,
                Err(_) => warn!(value = %value, "ignoring unparsable OLLM_CONTEXT_SIZE"),
            },
            _ => {}
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
