// Copyright (c) 2024-2026 ollm contributors
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::io::{BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use ollm_core::{ConversationRuntime, Notification};
use ollm_model::{EchoProvider, OllamaProvider, Provider};
use ollm_session::SessionStore;
use ollm_tools::builtin::{ReadFileTool, ShellTool};
use ollm_tools::{
    ApprovalHandler, Danger, Decision, ExecutorConfig, ToolExecutor, ToolRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ollm_config::load(cli.config.as_deref())?;
    ollm_config::apply_env_overrides(&mut config);
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }
    if let Some(provider) = &cli.provider {
        config.model.provider = provider.clone();
    }
    if let Some(host) = &cli.host {
        config.model.host = Some(host.clone());
    }
    if let Some(mode) = cli.approval {
        config.tools.approval_mode = mode;
    }

    match &cli.command {
        Some(Commands::Sessions { limit }) => {
            let store = SessionStore::open(config.session.resolved_data_dir())?;
            for summary in store.list()?.into_iter().take(*limit) {
                println!(
                    "{}  {}  {}  {} messages, {} tokens",
                    summary.id,
                    summary.last_activity.format("%Y-%m-%d %H:%M"),
                    summary.model,
                    summary.message_count,
                    summary.token_count,
                );
            }
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        None => run(cli, config).await,
    }
}

async fn run(cli: Cli, config: ollm_config::Config) -> anyhow::Result<()> {
    let provider: Arc<dyn Provider> = match config.model.provider.as_str() {
        "mock" => Arc::new(EchoProvider),
        _ => Arc::new(OllamaProvider::new(
            config.model.host.as_deref(),
            config.model.name.clone(),
        )),
    };

    let mut registry = ToolRegistry::new();
    registry.register(ShellTool);
    registry.register(ReadFileTool);
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(registry),
        Arc::new(StderrApproval),
        ExecutorConfig::from(&config.tools),
    ));

    let store = SessionStore::open(config.session.resolved_data_dir())?;
    let config = Arc::new(config);
    let mut runtime = match &cli.resume {
        Some(id) => ConversationRuntime::resume(provider, executor, store, config, id)?,
        None => ConversationRuntime::new(
            provider,
            executor,
            store,
            config,
            "You are a helpful assistant running on the user's own machine. \
             Prefer tools over guessing when the user asks about local files.",
        )?,
    };
    eprintln!("session {}", runtime.session_id());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" || input == "/exit" {
            break;
        }

        let (tx, rx) = mpsc::channel(256);
        let printer = tokio::spawn(print_events(rx));
        let cancel = CancellationToken::new();
        if let Err(e) = runtime.submit(input, &tx, &cancel).await {
            eprintln!("error: {e}");
        }
        drop(tx);
        let _ = printer.await;
    }
    Ok(())
}

/// Render notifications for a plain terminal: assistant text to stdout,
/// everything else to stderr.
async fn print_events(mut rx: mpsc::Receiver<Notification>) {
    while let Some(event) = rx.recv().await {
        match event {
            Notification::TextDelta(delta) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            Notification::TextComplete(_) => println!(),
            Notification::ToolStarted { call } => {
                eprintln!("[tool {} {}]", call.name, call.args);
            }
            Notification::ToolCompleted {
                tool_name,
                is_error,
                ..
            } => {
                let status = if is_error { "failed" } else { "ok" };
                eprintln!("[tool {tool_name} {status}]");
            }
            Notification::CompressionApplied {
                tokens_before,
                tokens_after,
                ..
            } => {
                eprintln!("[context compressed {tokens_before} -> {tokens_after} tokens]");
            }
            Notification::LoopDetected(pattern) => eprintln!("[loop detected: {pattern}]"),
            Notification::ProviderError(e) => eprintln!("[provider error: {e}]"),
            Notification::Warning(w) => eprintln!("[warning: {w}]"),
            Notification::Aborted { .. } => eprintln!("[aborted]"),
            Notification::TurnStarted { .. } | Notification::TurnCompleted => {}
        }
    }
}

/// Approval prompt on stderr, answer read from stdin.
struct StderrApproval;

#[async_trait]
impl ApprovalHandler for StderrApproval {
    async fn request_approval(&self, tool_name: &str, args: &Value, danger: Danger) -> Decision {
        let tool = tool_name.to_string();
        let args = args.to_string();
        tokio::task::spawn_blocking(move || {
            eprint!("approve {tool} ({danger:?}) {args}? [y/N/a] ");
            let mut answer = String::new();
            if std::io::stdin().read_line(&mut answer).is_err() {
                return Decision::Denied;
            }
            match answer.trim() {
                "y" | "Y" | "yes" => Decision::Approved,
                "a" | "A" | "always" => Decision::ApprovedAlways,
                _ => Decision::Denied,
            }
        })
        .await
        .unwrap_or(Decision::Denied)
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env("OLLM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
