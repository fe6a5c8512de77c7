//! # Chat Avatar Client - Terminal Entry Point
//!
//! Runs the chat client against a chat server from the terminal.
//!
//! ## What it does:
//! - Loads configuration (defaults, `APP_*` environment variables, `.env`)
//! - Connects the message channel and requests the welcome message
//! - Reads user input from stdin, one message per line
//! - Plays reply audio and prints the avatar's mouth state as it changes
//!
//! ## Commands:
//! - `/stop`: interrupt the reply in progress
//! - `/history`: fetch this session's history from the server
//! - `/quit`: leave
//!
//! ## Environment Variables:
//! - `CHAT_SERVER_URL`: overrides `channel.address`
//! - `RUST_LOG`: log filter, defaults to `chat_avatar_client=debug`

use std::sync::{Arc, RwLock};

use anyhow::Result;
use chat_avatar_client::audio::{PlaybackAnalyzer, PlaybackEvent, RodioBackend};
use chat_avatar_client::channel::{ChannelManager, WsConnector};
use chat_avatar_client::clock::TokioClock;
use chat_avatar_client::config::AppConfig;
use chat_avatar_client::controller::ChatController;
use chat_avatar_client::state::{ChatStore, Role};
use chat_avatar_client::storage::FileStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Single-threaded runtime: the channel, the analyzer and the store share one event loop.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting chat-avatar-client v{}", env!("CARGO_PKG_VERSION"));
    info!("Chat server: {}", config.channel.address);

    let clock = Arc::new(TokioClock::current());
    let channel = ChannelManager::new(Arc::new(WsConnector::current()), clock.clone(), &config.channel);
    let analyzer = PlaybackAnalyzer::new(Arc::new(RodioBackend::new()), clock, &config.playback);
    let persistence = Arc::new(FileStore::new(&config.storage.path));
    let store = Arc::new(RwLock::new(ChatStore::new(persistence, &config.input)));

    let controller = ChatController::new(channel, analyzer, store, config.channel.address.clone());
    spawn_playback_printer(&controller);

    if let Err(e) = controller.start().await {
        error!("Could not connect to {}: {}", config.channel.address, e);
        return Err(e.into());
    }

    tokio::select! {
        result = input_loop(&controller) => {
            if let Err(e) = result {
                error!("Input error: {}", e);
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received");
        }
    }

    controller.shutdown();
    info!("Client stopped");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_avatar_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Read stdin line by line until EOF or `/quit`.
async fn input_loop(controller: &ChatController) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0;

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/quit" => break,
            "/stop" => controller.stop_speaking(),
            "/history" => controller.request_history(),
            _ => {
                if !controller.send_user_message(&line) {
                    warn!("Message not sent (empty, too long, not connected or a reply is pending)");
                }
            }
        }

        printed = print_new_messages(controller, printed);
    }

    Ok(())
}

/// Print log entries from `from` onwards that are no longer streaming.
fn print_new_messages(controller: &ChatController, from: usize) -> usize {
    let store = controller.store().read().unwrap_or_else(|e| e.into_inner());
    let mut next = from;

    for entry in store.messages().iter().skip(from) {
        if entry.streaming {
            break;
        }
        let speaker = match entry.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("[{}] {}: {}", entry.timestamp.format("%H:%M:%S"), speaker, entry.content);
        next += 1;
    }

    if store.show_history() {
        for record in store.history() {
            println!("  (history) {}: {}", record.role, record.content);
        }
    }

    next
}

/// Print playback lifecycle and mouth changes.
fn spawn_playback_printer(controller: &ChatController) {
    let mut events = controller.analyzer().subscribe();
    let analyzer = controller.analyzer().clone();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PlaybackEvent::Started { id }) => info!("Speaking ({})", id),
                Ok(PlaybackEvent::Finished { .. }) => info!("Done speaking"),
                Ok(PlaybackEvent::Stopped { .. }) => info!("Speech interrupted"),
                Ok(PlaybackEvent::Failed { reason, .. }) => warn!("Speech failed: {}", reason),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} playback events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
            info!("Mouth: {}", analyzer.mouth_state());
        }
    });
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
