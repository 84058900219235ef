use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use claude_bridge::config::Config;
use claude_bridge::proxy::{app, AppState};

#[derive(Parser)]
#[command(name = "claude-bridge")]
#[command(about = "Anthropic Messages API adapter for OpenAI-compatible backends", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(
        short,
        long,
        env = "CLAUDE_BRIDGE_CONFIG",
        default_value = "~/.claude-bridge/config.json"
    )]
    config: String,

    /// Server host
    #[arg(long, env = "CLAUDE_BRIDGE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, env = "CLAUDE_BRIDGE_PORT", default_value = "3456")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "claude_bridge=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = Config::load(&config_path)?;
    tracing::info!("Upstream base URL: {}", config.base_url());

    let state = AppState { config };
    let router = app(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!("claude-bridge listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
