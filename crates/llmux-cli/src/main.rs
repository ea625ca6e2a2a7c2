//! CLI entry point for llmux.
//!
//! This binary provides the `llmux` command: `ask`, `stream` and `tokens`
//! send a prompt through the provider multiplexer, `status` reports which
//! backends are configured.

mod cli;
mod helpers;
mod tools;

use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use llmux_engine::{EngineConfig, EventBus, Gen, Multiplexer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cli::{Cli, Commands, PromptArgs};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before the subscriber reads RUST_LOG.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    helpers::init_tracing(cli.verbose, cli.log_json);
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded environment file");
    }

    let config = EngineConfig::from_env();
    let bus = EventBus::default();
    let mux = Multiplexer::from_config(&config, bus.clone())
        .context("failed to set up provider multiplexer")?;
    info!(default_provider = mux.default_provider(), "llmux ready");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Commands::Ask(args) => cmd_ask(&mux, &bus, &args, &cancel).await,
        Commands::Stream(args) => cmd_stream(&mux, &bus, &args, &cancel).await,
        Commands::Tokens(args) => cmd_tokens(&mux, &args, &cancel).await,
        Commands::Status { provider } => cmd_status(&mux, provider.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: ask
// ---------------------------------------------------------------------------

async fn cmd_ask(
    mux: &Multiplexer,
    bus: &EventBus,
    args: &PromptArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let prompt = helpers::build_prompt(args)?;
    let done = CancellationToken::new();
    let printer = helpers::spawn_event_printer(bus, args.usage, done.clone());

    let answer = mux
        .generate(&prompt, cancel)
        .await
        .context("generation failed")?;
    println!("{answer}");

    settle(printer, done).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: stream
// ---------------------------------------------------------------------------

async fn cmd_stream(
    mux: &Multiplexer,
    bus: &EventBus,
    args: &PromptArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let prompt = helpers::build_prompt(args)?;
    let done = CancellationToken::new();
    let printer = helpers::spawn_event_printer(bus, args.usage, done.clone());

    let mut stream = mux
        .generate_stream(&prompt, cancel)
        .await
        .context("failed to open stream")?;

    let mut stdout = std::io::stdout();
    while let Some(chunk) = stream.recv().await {
        let chunk = chunk.context("stream failed")?;
        if !chunk.thinking.is_empty() {
            eprint!("{}", chunk.thinking);
        }
        for call in &chunk.tool_calls {
            eprintln!("\n[tool] {}({})", call.name, call.arguments.to_json_string());
        }
        if !chunk.text.is_empty() {
            write!(stdout, "{}", chunk.text)?;
            stdout.flush()?;
        }
    }
    writeln!(stdout)?;

    settle(printer, done).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: tokens
// ---------------------------------------------------------------------------

async fn cmd_tokens(
    mux: &Multiplexer,
    args: &PromptArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let prompt = helpers::build_prompt(args)?;
    let usage = mux
        .count_tokens(&prompt, cancel)
        .await
        .context("token count failed")?;
    println!("{}", serde_json::to_string_pretty(&usage)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(mux: &Multiplexer, provider: Option<&str>) -> Result<()> {
    let names: Vec<String> = match provider {
        Some(name) => vec![mux.canonicalize(name)?],
        None => mux.providers().into_iter().map(str::to_owned).collect(),
    };

    println!();
    println!("  llmux v{}", env!("CARGO_PKG_VERSION"));
    println!("  default provider: {}", mux.default_provider());
    println!();
    for name in names {
        let status = match mux.resolve(&name) {
            Ok((_, backend)) => backend.status(),
            Err(e) => {
                println!("  [!] {name:<10} {e}");
                continue;
            }
        };
        let mark = if status.configured { "+" } else { "-" };
        println!(
            "  [{mark}] {name:<10} {:<28} {}",
            status.model, status.message
        );
    }
    println!();
    Ok(())
}

/// Stop the event printer once it has flushed queued events.
async fn settle(printer: JoinHandle<()>, done: CancellationToken) {
    done.cancel();
    if let Err(e) = printer.await {
        debug!(error = %e, "event printer ended abnormally");
    }
}
