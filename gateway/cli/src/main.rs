//! Gateway CLI
//!
//! Command-line front end for the multi-provider gateway: list providers,
//! send a message to one or several of them, and read stored conversations.
//!
//! # Usage
//!
//! ```bash
//! # Ask one provider; the reply streams to stdout
//! gateway send -p openai "Explain lifetimes in one paragraph"
//!
//! # Ask several providers at once, continuing a named conversation
//! gateway send --conversation rust-chat -p openai -p anthropic -p ollama "And borrowing?"
//!
//! # Show what is stored
//! gateway history rust-chat
//! ```
//!
//! Ctrl-C during `send` cancels every in-flight dispatch of the
//! conversation; the cancelled replies are kept as failed messages.
//!
//! # Environment Variables
//!
//! - `GATEWAY_CONFIG`: path to the config file
//! - `<PROVIDER>_API_KEY`: credential for a provider (e.g. `OPENAI_API_KEY`)
//! - `RUST_LOG`: log filter (logs go to stderr)

mod render;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gateway_core::{
    default_config_path, load_config_from_path, ConfigOverrides, ConversationId, DispatchTarget,
    FanOutSummary, GatewayEvent, GatewayService, ProviderId,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::render::ReplyPrinter;

/// Multi-provider conversational AI gateway
#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Directory for conversation history
    #[arg(long, value_name = "DIR", global = true)]
    history_dir: Option<PathBuf>,

    /// Keep history in memory only
    #[arg(long, global = true)]
    in_memory: bool,

    /// Overall deadline per provider request, in seconds
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// System prompt prepended to every request
    #[arg(long, value_name = "TEXT", global = true)]
    system_prompt: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured providers
    Providers,

    /// Send a message to one or more providers
    Send {
        /// Conversation to continue (a fresh one if omitted)
        #[arg(long = "conversation", value_name = "ID")]
        conversation: Option<String>,

        /// Target provider; repeat for fan-out
        #[arg(short = 'p', long = "provider", value_name = "ID", required = true)]
        providers: Vec<String>,

        /// Message text
        text: String,
    },

    /// Print a stored conversation
    History {
        /// Conversation id
        conversation: String,
    },

    /// List stored conversations
    Conversations,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("gateway_core=warn".parse()?)
                .add_directive("gateway_cli=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    overrides(&args).apply(&mut config);

    tracing::debug!(source = %config.source(), "Configuration loaded");

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(run(args, config))
}

fn overrides(args: &Args) -> ConfigOverrides {
    let mut overrides = ConfigOverrides::new();
    if let Some(ref dir) = args.history_dir {
        overrides = overrides.with_history_dir(dir.clone());
    }
    if args.in_memory {
        overrides = overrides.with_in_memory_history();
    }
    if let Some(secs) = args.timeout {
        overrides = overrides.with_request_timeout_secs(secs);
    }
    if let Some(ref prompt) = args.system_prompt {
        overrides = overrides.with_system_prompt(prompt.clone());
    }
    overrides
}

async fn run(args: Args, config: gateway_core::GatewayConfig) -> Result<()> {
    let service = GatewayService::from_config(config).context("Failed to start gateway")?;

    match args.command {
        Command::Providers => {
            for provider in service.registry().providers() {
                println!("{}", render::provider_row(&provider));
            }
            Ok(())
        }
        Command::Send {
            conversation,
            providers,
            text,
        } => {
            let conversation = conversation.map_or_else(ConversationId::ephemeral, ConversationId::new);
            let providers: Vec<ProviderId> = providers.into_iter().map(ProviderId::new).collect();
            let summary = send(&service, conversation.clone(), providers, text).await?;

            eprintln!("{}", render::summary_line(&summary));
            eprintln!("conversation: {conversation}");
            if summary.dispatched > 0 && summary.succeeded == 0 {
                bail!("no provider answered");
            }
            Ok(())
        }
        Command::History { conversation } => {
            let id = ConversationId::new(conversation);
            let messages = service.history().load(&id).await?;
            if messages.is_empty() {
                bail!("no conversation named {id}");
            }
            for message in &messages {
                println!("{}", render::transcript_entry(message));
            }
            Ok(())
        }
        Command::Conversations => {
            for id in service.history().conversations().await? {
                println!("{id}");
            }
            Ok(())
        }
    }
}

/// Send and render until the fan-out completes
///
/// Events drive the live output. Anything they missed (a lagging
/// subscriber drops events) is printed from the stored conversation once
/// the send is over.
async fn send(
    service: &GatewayService,
    conversation: ConversationId,
    providers: Vec<ProviderId>,
    text: String,
) -> Result<FanOutSummary> {
    let before = service.history().load(&conversation).await?.len();
    let mut printer = ReplyPrinter::new(providers.len());
    let target = DispatchTarget::from(providers);
    let mut events = service.subscribe();
    let mut done = service.send_message(conversation.clone(), target, text);

    let mut stdout = tokio::io::stdout();
    let mut finished = None;

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!(conversation = %conversation, "Interrupted, cancelling");
                service.cancel_conversation(&conversation);
            }
            event = events.recv() => match event {
                Ok(
                    GatewayEvent::MessageStateChanged { conversation_id, message }
                    | GatewayEvent::Tagged { conversation_id, message, .. },
                ) if conversation_id == conversation => {
                    if let Some(text) = printer.render(&message) {
                        stdout.write_all(text.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                }
                Ok(GatewayEvent::AllComplete { conversation_id, .. }) if conversation_id == conversation => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged, replies will be read back from history");
                }
                Err(RecvError::Closed) => break,
            },
            joined = &mut done => {
                finished = Some(joined);
                break;
            }
        }
    }

    let summary = match finished {
        Some(joined) => joined,
        None => done.await,
    }
    .context("Send task failed")??;

    let stored = service.history().load(&conversation).await?;
    for message in stored.iter().skip(before) {
        if let Some(text) = printer.render(message) {
            stdout.write_all(text.as_bytes()).await?;
        }
    }
    stdout.flush().await?;

    Ok(summary)
}
