//! # hapi-relay
//!
//! Relay binary: watches a HAPI server's session event stream and pushes
//! approval requests, task completions and new agent messages to the
//! console and configured webhooks.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use relay_client::{ClientConfig, HapiClient};
use relay_core::OutputLevel;
use relay_engine::{
    ConsoleObserver, EngineConfig, Notifier, ReconcileEngine, SessionCache, WebhookObserver,
};
use relay_settings::{load_settings_from_path, settings_path, RelaySettings};
use relay_store::{Database, UserStateRepo};
use relay_telemetry::{init_telemetry, TelemetryConfig};

/// HAPI notification relay.
#[derive(Parser, Debug)]
#[command(name = "hapi-relay", about = "Relay HAPI session events as notifications")]
struct Cli {
    /// Settings file (default: ~/.hapi-relay/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Notification level: silence, simple or detail (overrides settings).
    #[arg(long)]
    output_level: Option<OutputLevel>,

    /// Check that the server is reachable, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(level) = cli.output_level {
        settings.output_level = level;
    }

    let telemetry = TelemetryConfig::from_level_name(&settings.log_level, settings.json_logs);
    let _ = init_telemetry(&telemetry);
    settings.validate().context("Invalid settings")?;

    let client_config = ClientConfig::new(settings.endpoint.clone(), settings.access_token.clone())
        .with_proxy(settings.proxy_url.clone())
        .with_token_lifetime(settings.jwt_lifetime(), settings.refresh_margin());
    let client = Arc::new(HapiClient::new(client_config).context("Failed to build HTTP client")?);

    if cli.check {
        let healthy = client.health().await;
        info!(endpoint = client.endpoint(), healthy, "health check");
        std::process::exit(i32::from(!healthy));
    }

    run(settings, client).await
}

async fn run(settings: RelaySettings, client: Arc<HapiClient>) -> Result<()> {
    let notifier = Arc::new(Notifier::new(settings.notify_chunk_len));
    notifier.register(Arc::new(ConsoleObserver));
    register_observers(&notifier, &settings)?;

    let cache = SessionCache::new();
    match client.fetch_sessions().await {
        Ok(sessions) => {
            info!(count = sessions.len(), "sessions loaded");
            cache.replace_all(sessions);
        }
        Err(e) => warn!(error = %e, "initial session listing failed, starting empty"),
    }

    let engine = ReconcileEngine::new(
        client.clone(),
        cache,
        notifier.clone(),
        EngineConfig {
            debounce: settings.debounce(),
            ..EngineConfig::default()
        },
    );
    let loaded = engine.load_existing_pending().await;
    engine.start(settings.output_level);

    info!(
        endpoint = client.endpoint(),
        level = %settings.output_level,
        pending = loaded,
        observers = notifier.observer_count(),
        "relay running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    engine.stop().await;
    client.close();

    let stats = engine.stats();
    info!(
        events = stats.events_handled,
        notifications = stats.notifications,
        connects = stats.connects,
        "Shutdown complete"
    );
    Ok(())
}

/// Webhooks from settings plus every known user with an http(s) target.
fn register_observers(notifier: &Notifier, settings: &RelaySettings) -> Result<()> {
    let http = reqwest::Client::new();
    for (i, url) in settings.webhooks.iter().enumerate() {
        notifier.register(Arc::new(WebhookObserver::new(
            format!("webhook-{}", i + 1),
            url.clone(),
            http.clone(),
        )));
    }

    let db = Database::open(Path::new(&settings.store_path))
        .with_context(|| format!("Failed to open store at {}", settings.store_path))?;
    let users = UserStateRepo::new(db)
        .load_all()
        .context("Failed to read user preferences")?;
    for (user_id, state) in users {
        if let Some(url) = state.webhook_url() {
            notifier.register(Arc::new(WebhookObserver::new(
                format!("user:{user_id}"),
                url,
                http.clone(),
            )));
        }
    }
    Ok(())
}
