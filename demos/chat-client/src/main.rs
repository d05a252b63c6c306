//! Terminal chat client built on the tether session coordinator.
//!
//! Run the relay first, then:
//!   cargo run -p tether-chat-client -- --identity alice --thread general
//!
//! Commands: `/switch <thread>`, `/retry`, `/cancel`, `/status`, `/quit`.
//! Any other line is sent to the active thread.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_client::navigation::SwitchOptions;
use tether_client::{
    ChatSession, FileStore, KeyValueStore, MemoryStore, RestBackend, SessionConfig, ViewMessage,
    WsTransport,
};
use tether_core::Identity;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether-chat", about = "Terminal chat client")]
struct Args {
    /// Base URL of the REST API.
    #[arg(long, env = "TETHER_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,
    /// WebSocket endpoint.
    #[arg(long, env = "TETHER_WS", default_value = "ws://127.0.0.1:8080/ws")]
    ws: String,
    #[arg(long, env = "TETHER_IDENTITY")]
    identity: Identity,
    /// Thread to open on start.
    #[arg(long)]
    thread: Option<String>,
    /// TOML session config.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Persist the credential here instead of in memory.
    #[arg(long)]
    store: Option<PathBuf>,
}

fn render(message: &ViewMessage) -> String {
    let marker = if message.is_pending() { "…" } else { " " };
    format!(
        "{} {} [{:?}] {}",
        message.timestamp().format("%H:%M:%S"),
        marker,
        message.role(),
        message.content()
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tether_client=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let backend = Arc::new(RestBackend::new(&args.server));
    let store: Arc<dyn KeyValueStore> = match &args.store {
        Some(path) => Arc::new(FileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let session = ChatSession::new(
        config,
        Arc::new(WsTransport::new(&args.ws)),
        backend.clone(),
        backend.clone(),
        store,
    );

    let auth = session.start().await;
    if auth.identity() != Some(&args.identity) {
        let token = backend
            .login(&args.identity)
            .await
            .context("login failed")?;
        session.login(token).await?;
    }
    println!("Logged in as {}", args.identity);

    if let Some(thread) = args.thread {
        match session.switch_to_thread(thread, SwitchOptions::default()).await {
            Ok(data) => println!("== {} ==", data.title),
            Err(e) => eprintln!("could not open thread: {e}"),
        }
    }

    let mut revisions = session.subscribe_messages();
    let mut printed = 0usize;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = session.messages();
                let confirmed: Vec<_> = view.iter().filter(|m| !m.is_pending()).collect();
                // Reprint when the view shrank (thread switch).
                if confirmed.len() < printed {
                    printed = 0;
                }
                for message in confirmed.iter().skip(printed) {
                    println!("{}", render(message));
                }
                printed = confirmed.len();
            }

            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line.split_once(' ').unwrap_or((line, "")) {
                    ("/quit", _) => break,
                    ("/switch", target) if !target.is_empty() => {
                        match session.switch_to_thread(target, SwitchOptions::default()).await {
                            Ok(data) => {
                                printed = 0;
                                println!("== {} ==", data.title);
                            }
                            Err(e) => eprintln!("switch failed: {e}"),
                        }
                    }
                    ("/retry", _) => {
                        for failed in session.failed_sends() {
                            if let Err(e) = session.retry_send(&failed.temp_id) {
                                eprintln!("retry failed: {e}");
                            }
                        }
                        if let Err(e) = session.retry_last_failed().await {
                            tracing::debug!(error = %e, "no failed switch to retry");
                        }
                    }
                    ("/cancel", _) => {
                        if !session.cancel_loading() {
                            println!("nothing loading");
                        }
                    }
                    ("/status", _) => println!("{:#?}", session.snapshot()),
                    ("", _) => {}
                    _ => {
                        if let Err(e) = session.send_message(line) {
                            eprintln!("not sent: {e}");
                        }
                    }
                }
            }
        }
    }

    session.shutdown();
    Ok(())
}
