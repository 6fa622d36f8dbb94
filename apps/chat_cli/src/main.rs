use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_config, load_config_from},
    AssistantApi, ConversationEngine, ConversationView, DirectChatApi, EngineConfig, EngineDependencies,
    EngineEvent, PushChannelClient, Surface, WebSocketTransport,
};
use shared::domain::{Author, Message, SessionId, UserId};
use storage::{KeyValueStore, MemoryStore, SqliteStore};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal front end for assistant and direct conversations")]
struct Args {
    /// TOML file read instead of `chat_engine.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep sessions in memory only.
    #[arg(long)]
    ephemeral: bool,
    #[command(subcommand)]
    surface: SurfaceArg,
}

#[derive(Subcommand, Debug)]
enum SurfaceArg {
    /// Question/answer sessions with the assistant backend.
    Assistant,
    /// One-to-one conversation with another user.
    Direct {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        peer: i64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config_from(path).with_context(|| format!("failed to read {}", path.display()))?,
        None => load_config(),
    };
    let store: Arc<dyn KeyValueStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::new(&config.database_url).await?)
    };

    let (surface, dependencies) = build_surface(&args.surface, &config)?;
    let engine = ConversationEngine::open(surface, config, store, dependencies).await;
    let mut events = engine.subscribe_events();
    engine.start().await;
    print_view(&engine.snapshot().await);
    println!("commands: /new /refresh /sessions /switch <id> /quit");

    let mut lines = BufReader::new(stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(&engine, line.trim()).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: dropped engine events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn build_surface(arg: &SurfaceArg, config: &EngineConfig) -> Result<(Surface, EngineDependencies)> {
    match *arg {
        SurfaceArg::Assistant => {
            let api = Arc::new(AssistantApi::new(config.assistant_base_url.clone()));
            Ok((
                Surface::Assistant,
                EngineDependencies {
                    history: api.clone(),
                    outbound: api.clone(),
                    status: Some(api),
                    push: None,
                },
            ))
        }
        SurfaceArg::Direct { user, peer } => {
            let (current_user, peer) = (UserId(user), UserId(peer));
            let api = Arc::new(DirectChatApi::new(config.server_url.clone(), current_user, peer));
            let transport = WebSocketTransport::new(&config.push_url, config.push_retry_delays.clone())?;
            Ok((
                Surface::Direct { current_user, peer },
                EngineDependencies {
                    history: api.clone(),
                    outbound: api,
                    status: None,
                    push: Some(PushChannelClient::new(Arc::new(transport))),
                },
            ))
        }
    }
}

/// Returns `false` when the user asked to leave.
async fn handle_line(engine: &Arc<ConversationEngine>, line: &str) -> bool {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("", _) => {}
        ("/quit", _) => return false,
        ("/new", _) => match engine.create_session().await {
            Ok(id) => println!("* created {id}"),
            Err(err) => println!("! {err}"),
        },
        ("/refresh", _) => {
            if let Err(err) = engine.refresh_history().await {
                println!("! refresh failed: {err}");
            }
        }
        ("/sessions", _) => print_sessions(&engine.snapshot().await),
        ("/switch", id) => {
            if !engine.select_session(&SessionId::from(id.trim())).await {
                println!("! no session {}", id.trim());
            }
        }
        _ => {
            if let Err(err) = engine.send(line).await {
                println!("! {err}");
            }
        }
    }
    true
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::SessionsChanged(view) => print_view(view),
        EngineEvent::StatusChanged(status) => println!("* backend {:?}", status.state),
        EngineEvent::PushStateChanged(state) => println!("* push {state:?}"),
        EngineEvent::Error(message) => println!("! {message}"),
    }
}

fn print_view(view: &ConversationView) {
    if view.loading {
        println!("* loading history...");
        return;
    }
    let Some(active) = view.active_summary() else {
        println!("* no session selected");
        return;
    };
    println!("== {} ({})", active.title, active.id);
    for message in view.messages.iter().rev().take(10).rev() {
        println!("{}", render_message(message));
    }
    if let Some(sync_error) = &view.sync_error {
        println!("* sync: {sync_error}");
    }
}

fn print_sessions(view: &ConversationView) {
    for summary in &view.sessions {
        let marker = if view.active_session.as_ref() == Some(&summary.id) { '>' } else { ' ' };
        println!(
            "{marker} {} {} ({} messages)",
            summary.id, summary.title, summary.message_count
        );
    }
}

fn render_message(message: &Message) -> String {
    let who = match message.author {
        Author::Role { role } => format!("{role:?}").to_lowercase(),
        Author::Direct { sender_id, .. } => format!("user {sender_id}"),
    };
    let pending = if message.pending { " (sending)" } else { "" };
    format!("[{}] {who}: {}{pending}", message.timestamp.format("%H:%M"), message.content)
}
