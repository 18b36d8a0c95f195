// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ollm_config::ApprovalMode;

/// A local-LLM command-line assistant.
///
/// With no subcommand, reads user turns from stdin (one per line) and
/// streams assistant output to stdout.
#[derive(Parser, Debug)]
#[command(name = "ollm", version, about)]
pub struct Cli {
    /// Explicit config file path (merged over the discovered layers)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Model name override
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Provider override: "ollama" or "mock"
    #[arg(long)]
    pub provider: Option<String>,

    /// Backend host URL override
    #[arg(long)]
    pub host: Option<String>,

    /// Tool approval mode override
    #[arg(long, value_enum)]
    pub approval: Option<ApprovalMode>,

    /// Resume a persisted session instead of starting a new one
    #[arg(long)]
    pub resume: Option<String>,

    /// Log to stderr (also honours the OLLM_LOG env filter)
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List persisted sessions, newest first
    Sessions {
        /// Show at most this many entries
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the resolved configuration and exit
    ShowConfig,
}
