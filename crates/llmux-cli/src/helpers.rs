//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, prompt assembly, and the bus listener
//! that echoes notifications to stderr.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use llmux_engine::{Event, EventBus, Media, NotificationKind, Prompt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::PromptArgs;
use crate::tools;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Prompt assembly
// ---------------------------------------------------------------------------

/// Build a [`Prompt`] from command-line options.
pub fn build_prompt(args: &PromptArgs) -> Result<Prompt> {
    let text = if args.text == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read prompt from stdin")?;
        buf
    } else {
        args.text.clone()
    };

    let mut prompt = Prompt::new(text).with_max_tool_iterations(args.max_tool_iterations);
    if let Some(provider) = &args.provider {
        prompt = prompt.with_provider(provider);
    }
    if let Some(model) = &args.model {
        prompt = prompt.with_model(model);
    }
    if let Some(instruction) = &args.instruction {
        prompt = prompt.with_instruction(instruction);
    }
    for path in &args.attachments {
        prompt = prompt.with_media(load_media(path)?);
    }
    if args.tools {
        prompt = tools::register(prompt);
    }
    Ok(prompt)
}

fn load_media(path: &Path) -> Result<Media> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Media::new(mime_type_for(path), data))
}

/// MIME type from a file extension.  Unknown extensions are sent as
/// `application/octet-stream`.
pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Event listener
// ---------------------------------------------------------------------------

/// Echo bus events to stderr until `done` fires, then flush what is queued.
pub fn spawn_event_printer(
    bus: &EventBus,
    show_usage: bool,
    done: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Ok(event) => print_event(&event, show_usage),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event printer fell behind");
                    }
                    Err(RecvError::Closed) => return,
                },
                _ = done.cancelled() => break,
            }
        }
        while let Ok(event) = rx.try_recv() {
            print_event(&event, show_usage);
        }
    })
}

fn print_event(event: &Event, show_usage: bool) {
    match event {
        Event::Notification { kind, message, .. } => {
            let tag = match kind {
                NotificationKind::Info => "info",
                NotificationKind::Warning => "warning",
                NotificationKind::Thought => "thought",
            };
            eprintln!("[{tag}] {message}");
        }
        Event::TokenUsage {
            provider, usage, ..
        } if show_usage => {
            eprintln!(
                "[usage] {provider}: input={} output={} total={} cached={}",
                usage.input, usage.output, usage.total, usage.cached
            );
        }
        Event::TokenUsage { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_follow_extensions() {
        assert_eq!(mime_type_for(Path::new("a/photo.JPG")), "image/jpeg");
        assert_eq!(mime_type_for(Path::new("report.pdf")), "application/pdf");
        assert_eq!(mime_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn prompt_carries_options() {
        let args = PromptArgs {
            text: "hello".into(),
            provider: Some("claude".into()),
            model: Some("claude-sonnet-4-5".into()),
            instruction: Some("be brief".into()),
            attachments: Vec::new(),
            max_tool_iterations: 3,
            tools: true,
            usage: false,
        };
        let prompt = build_prompt(&args).unwrap();
        assert_eq!(prompt.text, "hello");
        assert_eq!(prompt.provider, "claude");
        assert_eq!(prompt.model_name, "claude-sonnet-4-5");
        assert_eq!(prompt.tool_iteration_limit(), 3);
        assert_eq!(prompt.functions.len(), 2);
        assert_eq!(prompt.handlers.len(), 2);
    }
}
