//! # chorus
//!
//! Terminal client for a shared conversation between one human and several
//! AI agents. Wires settings, telemetry, the HTTP completion provider and the
//! turn-taking engine together.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};

use chorus_core::conversation::{Agent, Author, Roster};
use chorus_engine::{Conversation, ConversationEvent, EngineConfig, StreamOutcome};
use chorus_llm::HttpCompletionProvider;
use chorus_settings::{load_settings, load_settings_from_path};
use chorus_telemetry::{init_telemetry, MetricsRecorder, TelemetryConfig};

/// Shared conversation between a human and several AI agents.
#[derive(Parser, Debug)]
#[command(name = "chorus", about = "Shared conversation between a human and several AI agents")]
struct Cli {
    /// Participant as `Name:tag:model[:deliberate]`. Repeat for each agent.
    #[arg(long = "agent", required = true)]
    agents: Vec<String>,

    /// Settings file (defaults to ~/.chorus/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Completion endpoint (overrides settings).
    #[arg(long)]
    endpoint: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

/// Parse `Name:tag:model[:deliberate]`. The model may itself contain colons.
fn parse_agent(arg: &str) -> Result<Agent> {
    let mut parts: Vec<&str> = arg.split(':').map(str::trim).collect();
    let deliberate = parts.len() > 3 && parts.last().is_some_and(|p| p.eq_ignore_ascii_case("deliberate"));
    if deliberate {
        parts.pop();
    }
    if parts.len() < 3 {
        bail!("agent `{arg}` must look like Name:tag:model[:deliberate]");
    }
    let name = parts[0];
    let tag = parts[1].trim_start_matches('@');
    let model = parts[2..].join(":");
    if name.is_empty() || tag.is_empty() || model.is_empty() {
        bail!("agent `{arg}` has an empty field");
    }
    let agent = Agent::new(name, tag, model);
    Ok(if deliberate { agent.deliberate() } else { agent })
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Say(String),
    Pause,
    Resume,
    Stop,
    Status,
    New,
    Quit,
    Unknown(String),
    Empty,
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        match line {
            "/pause" => Self::Pause,
            "/resume" => Self::Resume,
            "/stop" => Self::Stop,
            "/status" => Self::Status,
            "/new" => Self::New,
            "/quit" | "/exit" => Self::Quit,
            cmd if cmd.starts_with('/') => Self::Unknown(cmd.to_string()),
            text => Self::Say(text.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    if let Some(endpoint) = cli.endpoint {
        settings.provider.endpoint = endpoint;
    }

    let telemetry = init_telemetry(TelemetryConfig::from_levels(
        &settings.logging.level,
        settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        cli.json_logs || settings.logging.json,
    ));
    let metrics = telemetry.metrics();

    let agents = cli
        .agents
        .iter()
        .map(|arg| parse_agent(arg))
        .collect::<Result<Vec<_>>>()?;
    let roster = Roster::new(agents);

    let provider = HttpCompletionProvider::with_connect_timeout(
        settings.provider.endpoint.clone(),
        settings.provider.api_key.clone().map(SecretString::from),
        Duration::from_millis(settings.provider.connect_timeout_ms),
    )
    .context("Failed to build completion client")?;
    tracing::info!(endpoint = %provider.endpoint(), agents = roster.len(), "chorus ready");

    let conversation = Conversation::new(
        roster.clone(),
        Arc::new(provider),
        EngineConfig::from_settings(&settings),
        metrics.clone(),
    );
    let printer = tokio::spawn(print_events(conversation.subscribe(), roster));

    println!("Type a message, or /pause /resume /stop /status /new /quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match Input::parse(&line) {
            Input::Empty => {}
            Input::Say(text) => {
                conversation.post_human(text).await;
            }
            Input::Pause => conversation.pause(),
            Input::Resume => conversation.resume().await,
            Input::Stop => conversation.stop(),
            Input::New => {
                conversation.switch_conversation();
                println!("-- new conversation --");
            }
            Input::Status => print_status(&conversation, metrics.as_deref()).await,
            Input::Quit => break,
            Input::Unknown(cmd) => println!("unknown command: {cmd}"),
        }
    }

    conversation.stop();
    drop(conversation);
    printer.abort();
    tracing::info!("Shutting down");
    Ok(())
}

async fn print_status(conversation: &Conversation, metrics: Option<&MetricsRecorder>) {
    let roster = conversation.roster();
    let name = |id: &chorus_core::ids::AgentId| {
        roster
            .get(id)
            .map_or_else(|| id.to_string(), |a| a.name.clone())
    };
    match conversation.status().await {
        Ok(snap) => {
            let list = |ids: &[chorus_core::ids::AgentId]| {
                ids.iter().map(|id| name(id)).collect::<Vec<_>>().join(", ")
            };
            println!("paused:    {}", conversation.is_paused());
            println!("speaking:  {}", list(&snap.streaming));
            println!("pending:   {}", list(&snap.pending));
            let queued: Vec<String> = snap
                .queued
                .iter()
                .map(|(id, priority)| format!("{} ({priority})", name(id)))
                .collect();
            println!("queued:    {}", queued.join(", "));
            for agent in roster.iter() {
                println!("  {:<12} silent rounds: {}", agent.name, snap.silence_of(&agent.id));
            }
        }
        Err(e) => println!("status unavailable: {e}"),
    }
    if let Some(m) = metrics {
        println!(
            "turns: {}  retries: {}",
            m.counter_get("scheduler.dispatched", &[]),
            m.counter_get("turn.retries", &[])
        );
    }
}

async fn print_events(mut events: broadcast::Receiver<ConversationEvent>, roster: Roster) {
    let name = |id: &chorus_core::ids::AgentId| {
        roster
            .get(id)
            .map_or_else(|| id.to_string(), |a| a.name.clone())
    };
    let mut stdout = std::io::stdout();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "display fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            ConversationEvent::TurnStarted { agent_id } => {
                let _ = write!(stdout, "\n{}: ", name(&agent_id));
            }
            ConversationEvent::Token { text, .. } => {
                let _ = write!(stdout, "{text}");
            }
            ConversationEvent::TurnCompleted { outcome, .. } => {
                let suffix = match outcome {
                    StreamOutcome::Aborted => " [stopped]",
                    StreamOutcome::TimedOut => " [timed out]",
                    _ => "",
                };
                let _ = writeln!(stdout, "{suffix}");
            }
            ConversationEvent::TurnRetrying { agent_id, attempt, .. } => {
                let _ = writeln!(stdout, "\n({} is retrying, attempt {attempt})", name(&agent_id));
            }
            ConversationEvent::TurnFailed { agent_id, error } => {
                let _ = writeln!(stdout, "\n({} failed: {})", name(&agent_id), error.message());
            }
            ConversationEvent::MessagePosted(message) if message.author == Author::System => {
                let _ = writeln!(stdout, "* {}", message.text);
            }
            ConversationEvent::Paused => {
                let _ = writeln!(stdout, "-- paused --");
            }
            ConversationEvent::Resumed => {
                let _ = writeln!(stdout, "-- resumed --");
            }
            ConversationEvent::Stopped => {
                let _ = writeln!(stdout, "-- stopped --");
            }
            ConversationEvent::MessagePosted(_) => {}
        }
        let _ = stdout.flush();
    }
}
