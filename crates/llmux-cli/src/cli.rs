//! CLI argument definitions for llmux.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// llmux -- one prompt, any model backend.
#[derive(Parser)]
#[command(
    name = "llmux",
    version,
    about = "llmux -- agentic generation over Gemini, OpenAI, Anthropic, Ollama and LM Studio",
    long_about = "Sends a prompt through the llmux engine. The model may call the built-in \
                  demo tools before answering. Provider credentials are read from the \
                  environment (or a .env file)."
)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a complete answer.
    Ask(PromptArgs),

    /// Stream the answer as it is produced.
    Stream(PromptArgs),

    /// Count the prompt's input tokens.
    Tokens(PromptArgs),

    /// Show provider configuration.
    Status {
        /// Provider to report on; every registered provider when omitted.
        #[arg(long, short)]
        provider: Option<String>,
    },
}

/// Options shared by every subcommand that sends a prompt.
#[derive(Args)]
pub struct PromptArgs {
    /// Prompt text. Use `-` to read it from stdin.
    pub text: String,

    /// Provider key or alias (genai, openai, anthropic, ollama, lmstudio, ...).
    #[arg(long, short)]
    pub provider: Option<String>,

    /// Model name; the provider's default when omitted.
    #[arg(long, short)]
    pub model: Option<String>,

    /// System instruction.
    #[arg(long, short)]
    pub instruction: Option<String>,

    /// Attach a file (image or document) to the prompt. Repeatable.
    #[arg(long = "attach", short = 'a')]
    pub attachments: Vec<PathBuf>,

    /// Tool-loop budget; 0 or less uses the default.
    #[arg(long, default_value_t = 0)]
    pub max_tool_iterations: i32,

    /// Offer the built-in demo tools (current_time, viewImage).
    #[arg(long)]
    pub tools: bool,

    /// Print token usage events to stderr.
    #[arg(long)]
    pub usage: bool,
}
