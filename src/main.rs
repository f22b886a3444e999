//! Chain Push Relay
//!
//! Connects to the upstream event stream, relays transaction receipts to
//! subscribed devices and serves the subscription API.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chain_push_relay::relay::RELAY_CHANNEL_CAPACITY;
use chain_push_relay::{
    frame_forwarder, ApiServer, ApiServerConfig, DispatcherConfig, EventStreamClient, ExpoConfig,
    ExpoPushProvider, FileSnapshotStore, NotificationDispatcher, RegistryConfig, Relay,
    RelayContext, RelayMetrics, StreamClientConfig, SubscriptionRegistry, WebSocketSource,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Chain Push Relay - blockchain events to mobile push notifications
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:3000")]
    api_addr: String,

    /// Upstream event stream endpoint (ws:// or wss://)
    #[arg(long, env = "EVENT_STREAM_URL")]
    stream_url: String,

    /// Subscription snapshot file
    #[arg(long, env = "SNAPSHOT_PATH", default_value = "subscriptions.json")]
    snapshot_path: String,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, env = "RECONNECT_DELAY_MS", default_value = "5000")]
    reconnect_delay_ms: u64,

    /// Reconnect attempts before giving up
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value = "10")]
    max_reconnect_attempts: u32,

    /// Expo push endpoint
    #[arg(long, env = "EXPO_ENDPOINT", default_value = chain_push_relay::notify::DEFAULT_EXPO_ENDPOINT)]
    expo_endpoint: String,

    /// Expo access token for enhanced push security
    #[arg(long, env = "EXPO_ACCESS_TOKEN")]
    expo_access_token: Option<String>,

    /// Timeout for a single push delivery in seconds
    #[arg(long, env = "PUSH_TIMEOUT_SECS", default_value = "10")]
    push_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!(
        version = chain_push_relay::VERSION,
        api_addr = %args.api_addr,
        stream_url = %args.stream_url,
        snapshot = %args.snapshot_path,
        "Starting chain push relay"
    );

    let rest_addr: SocketAddr = args
        .api_addr
        .parse()
        .with_context(|| format!("invalid API address '{}'", args.api_addr))?;

    // Subscription registry, restored from the last snapshot
    let store = Arc::new(FileSnapshotStore::new(&args.snapshot_path));
    let registry = SubscriptionRegistry::new(store, RegistryConfig::default());
    let restored = registry
        .load()
        .await
        .context("failed to restore subscription snapshot")?;
    info!(subscriptions = restored, "Registry ready");

    let metrics = Arc::new(RelayMetrics::new().context("failed to register metrics")?);

    // Delivery
    let push_timeout = Duration::from_secs(args.push_timeout_secs);
    let provider = ExpoPushProvider::new(ExpoConfig {
        endpoint: args.expo_endpoint.clone(),
        access_token: args.expo_access_token.clone(),
        request_timeout: push_timeout,
    })
    .context("failed to build push client")?;
    let dispatcher = NotificationDispatcher::new(
        DispatcherConfig {
            send_timeout: push_timeout,
        },
        registry.clone(),
        Arc::new(provider),
        metrics.clone(),
    );

    // Event stream feeding the relay
    let stream = EventStreamClient::new(
        StreamClientConfig {
            url: args.stream_url.clone(),
            reconnect_delay: Duration::from_millis(args.reconnect_delay_ms),
            max_reconnect_attempts: args.max_reconnect_attempts,
            ..Default::default()
        },
        Arc::new(WebSocketSource::new()),
    );
    let (frame_tx, frame_rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    stream.on_data(frame_forwarder(frame_tx, metrics.clone()));

    let cancel = CancellationToken::new();
    let relay = Relay::new(dispatcher.clone(), metrics.clone());
    let relay_task = tokio::spawn(relay.run(frame_rx, cancel.clone()));

    spawn_event_logger(&registry, cancel.clone());

    let context = RelayContext::new(registry, dispatcher, stream.clone(), metrics);
    stream.connect();

    // API server until ctrl-c
    let server = ApiServer::new(ApiServerConfig { rest_addr }, context);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown requested");
        let _ = shutdown.send(());
    });

    server.run().await.context("API server failed")?;

    stream.disconnect();
    cancel.cancel();
    let _ = relay_task.await;

    info!("Relay shutdown complete");
    Ok(())
}

/// Log registry events at debug level until cancelled
fn spawn_event_logger(registry: &SubscriptionRegistry, cancel: CancellationToken) {
    let mut events = registry.subscribe_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => tracing::debug!(device_token = %event.device_token(), "{}", event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Registry event logger lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tungstenite=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
