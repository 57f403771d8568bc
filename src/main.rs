//! callwire - Presence Hub Server
//!
//! Startet den WebSocket-Hub, über den Clients sich anmelden und
//! Call-Signale austauschen.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use callwire::auth::{ClaimedIdentity, IdentitySource, KeyRegistry};
use callwire::config::HubConfig;
use callwire::hub::{serve, HubState, PresenceHub};
use callwire::signaling::UserId;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// callwire - Presence Hub für P2P Voice Calls
#[derive(Parser, Debug)]
#[command(name = "callwire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind-Adresse des Hubs
    #[arg(short, long, default_value = "0.0.0.0:8787", env = "CALLWIRE_BIND")]
    bind: SocketAddr,

    /// Log-Filter, falls RUST_LOG nicht gesetzt ist
    #[arg(short, long, default_value = "callwire=info,webrtc=warn", env = "CALLWIRE_LOG_LEVEL")]
    log_level: String,

    /// JSON-Datei mit registrierten Public Keys (`{"userId": "base64key"}`)
    #[arg(short, long, value_name = "FILE", env = "CALLWIRE_KEYS")]
    keys: Option<PathBuf>,

    /// Behauptete Identität ohne Signaturprüfung übernehmen (nur Entwicklung)
    #[arg(long, env = "CALLWIRE_INSECURE_IDENTITY")]
    insecure_identity: bool,

    /// Frist für das Hello nach dem Verbindungsaufbau (Sekunden)
    #[arg(long, default_value_t = 10, env = "CALLWIRE_ADMISSION_TIMEOUT")]
    admission_timeout: u64,

    /// Ausgangs-Queue pro Verbindung
    #[arg(long, default_value_t = 256, env = "CALLWIRE_OUTBOUND_QUEUE")]
    outbound_queue: usize,

    /// Erlaubte Uhrenabweichung für signierte Hellos (Sekunden)
    #[arg(long, default_value_t = 60, env = "CALLWIRE_MAX_CLOCK_SKEW")]
    max_clock_skew: u64,
}

impl Args {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            bind: self.bind,
            admission_timeout: Duration::from_secs(self.admission_timeout),
            outbound_queue: self.outbound_queue,
            max_clock_skew: Duration::from_secs(self.max_clock_skew),
            insecure_identity: self.insecure_identity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("callwire hub v{}", env!("CARGO_PKG_VERSION"));

    let config = args.hub_config();
    let identity = identity_source(&args, &config)?;

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    let state = HubState::new(
        Arc::new(PresenceHub::new(config.outbound_queue)),
        identity,
        &config,
    );
    let shutdown = state.shutdown.clone();

    let server = tokio::spawn(serve(listener, state));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, closing connections...");
    shutdown.cancel();

    server
        .await
        .context("Hub task panicked")?
        .context("Hub stopped with an error")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn identity_source(args: &Args, config: &HubConfig) -> Result<Arc<dyn IdentitySource>> {
    if config.insecure_identity {
        tracing::warn!("Insecure identity mode: hellos are admitted without signature check");
        return Ok(Arc::new(ClaimedIdentity));
    }

    let registry = KeyRegistry::new(config.max_clock_skew);
    match &args.keys {
        Some(path) => {
            let count = load_keys(&registry, path)?;
            tracing::info!("Loaded {} registered keys from {}", count, path.display());
        }
        None => tracing::warn!("No key file given, every hello will be rejected"),
    }
    Ok(Arc::new(registry))
}

/// Lädt `{"userId": "base64key"}` in die Registry
fn load_keys(registry: &KeyRegistry, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    let entries: HashMap<String, String> =
        serde_json::from_str(&raw).context("Key file is not a JSON object of strings")?;

    for (user_id, key) in &entries {
        registry
            .register_base64(UserId::new(user_id.as_str()), key)
            .with_context(|| format!("Invalid public key for {}", user_id))?;
    }
    Ok(entries.len())
}

/// Wartet auf Ctrl+C oder SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
