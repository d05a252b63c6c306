//! Relay backend for tether clients.
//!
//! Speaks the frame protocol over WebSocket and serves the REST endpoints
//! the client uses for login, token refresh and thread loading. Tokens are
//! unsigned; this is for local development only.
//!
//! Run:
//!   cargo run -p tether-relay-server -- --port 8080 --token-lifetime 60
//!
//! Then:
//!   curl -X POST localhost:8080/auth/login -H 'content-type: application/json' -d '{"identity":"alice"}'
//!   curl localhost:8080/threads/general

mod server;

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tether-relay", about = "Relay backend for tether clients")]
struct Args {
    #[arg(long, env = "TETHER_PORT", default_value_t = 8080)]
    port: u16,
    /// Lifetime of issued tokens, in seconds.
    #[arg(long, default_value_t = 300)]
    token_lifetime: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tether_relay=info".parse()?))
        .init();

    let args = Args::parse();
    let addr: SocketAddr = ([127, 0, 0, 1], args.port).into();
    tracing::info!("Starting relay on {} (tokens live {}s)", addr, args.token_lifetime);

    server::run(addr, Duration::from_secs(args.token_lifetime)).await
}
