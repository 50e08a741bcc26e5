use anyhow::{Context, Result};
use axum::{Json, Router, routing::get};
use clap::Parser;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use relay_exchange::config::DEFAULT_CONFIG_FILE;
use relay_exchange::{Exchange, ExchangeConfig, FileConfig, load_config};

mod chat;

/// Span maker that tags every request with a unique id.
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay-exchange")]
#[command(about = "Real-time relay exchange over websockets and long-polling")]
struct Args {
    /// Config file (defaults to ./relay-exchange.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the HTTP server
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Regenerate the client script on every request
    #[arg(long)]
    no_script_cache: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "relay_exchange=debug,tower_http=debug"
    } else {
        "relay_exchange=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut file_config: FileConfig = load_config(&config_path)
        .extract()
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if args.no_script_cache {
        file_config.script.cache_enabled = false;
    }

    let exchange = Exchange::builder(ExchangeConfig::from_file(&file_config))
        .relay::<chat::Chat>()
        .context("Failed to register relays")?
        .build();

    let base_path = file_config.server.base_path.trim_end_matches('/').to_string();
    let relay_routes = relay_exchange::routes(exchange.clone());
    let app = if base_path.is_empty() {
        Router::new().merge(relay_routes)
    } else {
        Router::new().nest(&base_path, relay_routes)
    };
    let app = app
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", file_config.server.host, file_config.server.port)
        .parse::<SocketAddr>()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Relay exchange listening on http://{}", actual_addr);
    info!("  POST   {}/negotiate", base_path);
    info!("  GET    {}/ws?connectionId=", base_path);
    info!("  GET    {}/longpoll?connectionId=", base_path);
    info!("  POST   {}/call?connectionId=", base_path);
    info!("  GET    {}/client.js", base_path);
    for relay in exchange.relays().iter() {
        info!(relay = relay.name(), methods = ?relay.method_names(), "relay available");
    }

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
