//! Application entry point.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use coinage_watcher::app::{RefreshTrigger, WatcherConfig, WatcherState, spawn_refresh_worker};
use coinage_watcher::domain::{ConfigError, Network, Session, SubscriptionTier, TxStatus};
use coinage_watcher::infra::{HttpClientConfig, HttpCoinageClient};

/// Application configuration
struct Config {
    api_url: String,
    api_token: Option<SecretString>,
    user_id: String,
    network: Network,
    /// Unset until the plan is known; no silent refreshes run without it
    tier: Option<SubscriptionTier>,
    /// Deposit transactions to poll until they settle
    watch_deposits: Vec<String>,
    watcher: WatcherConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let api_url = required("COINAGE_API_URL")?;
        let user_id = required("COINAGE_USER_ID")?;

        let api_token = env::var("COINAGE_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);

        let network = match env::var("COINAGE_NETWORK").ok().filter(|v| !v.is_empty()) {
            Some(v) => v.parse::<Network>().map_err(|message| ConfigError::Invalid {
                var: "COINAGE_NETWORK".to_string(),
                message,
            })?,
            None => Network::default(),
        };

        let tier = env::var("COINAGE_TIER")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse::<SubscriptionTier>()
                    .map_err(|message| ConfigError::Invalid {
                        var: "COINAGE_TIER".to_string(),
                        message,
                    })
            })
            .transpose()?;

        let watch_deposits = env::var("WATCH_DEPOSIT_TX")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            api_url,
            api_token,
            user_id,
            network,
            tier,
            watch_deposits,
            watcher: WatcherConfig::from_env(),
        })
    }

    fn session(&self) -> Session {
        let session = Session::new(self.user_id.clone(), self.network);
        match self.tier {
            Some(tier) => session.with_tier(tier),
            None => session,
        }
    }
}

fn required(var: &str) -> Result<String> {
    let value = env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Missing(var.to_string()))?;
    Ok(value)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Coinage watcher v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let mut http_config = HttpClientConfig::new(config.api_url.clone())
        .with_timeout(config.watcher.scheduler.fetch_timeout);
    if let Some(token) = config.api_token.clone() {
        http_config = http_config.with_token(token);
    } else {
        warn!("COINAGE_API_TOKEN not set, requests are unauthenticated");
    }
    let client = Arc::new(
        HttpCoinageClient::new(http_config).context("Failed to create Coinage API client")?,
    );
    info!(url = %config.api_url, "Coinage API client created");

    let state = WatcherState::with_backend(client, config.watcher.clone());

    let mut changes_rx = state.notifier.subscribe();
    let signal_task = tokio::spawn(async move {
        loop {
            match changes_rx.recv().await {
                Ok(signal) => info!(
                    user_id = %signal.user_id,
                    emitted = signal.emitted,
                    "Notifications changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification signal receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    state
        .scheduler
        .set_session(Some(config.session()))
        .context("Invalid session configuration")?;

    let worker = if config.watcher.scheduler.enabled {
        info!(tier = ?config.tier, "Starting balance refresh worker");
        Some(spawn_refresh_worker(Arc::clone(&state.scheduler)))
    } else {
        info!("Refresh worker disabled, loading balances once");
        if let Err(e) = state.scheduler.trigger(RefreshTrigger::Initial).await {
            error!(error = %e, "Initial balance load failed");
        }
        None
    };

    for tx_id in &config.watch_deposits {
        let handle = state.poller.poll(tx_id);
        tokio::spawn(async move {
            let session = handle.wait_terminal().await;
            match session.status {
                TxStatus::Confirmed => info!(
                    tx_id = %session.transaction_id,
                    block_number = ?session.block_number,
                    tx_hash = ?session.tx_hash,
                    attempts = session.attempts,
                    "Deposit confirmed"
                ),
                TxStatus::Failed => warn!(
                    tx_id = %session.transaction_id,
                    attempts = session.attempts,
                    "Deposit failed"
                ),
                TxStatus::Pending => info!(
                    tx_id = %session.transaction_id,
                    "Deposit polling stopped before settlement"
                ),
            }
        });
    }
    if !config.watch_deposits.is_empty() {
        info!(count = config.watch_deposits.len(), "Deposit polling started");
    }

    shutdown_signal().await;
    info!("Shutting down...");

    state.poller.stop_all();
    if let Some((handle, shutdown_tx)) = worker {
        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "Refresh worker panicked");
        }
    }
    state.scheduler.set_session(None)?;
    signal_task.abort();

    info!("Shutdown complete");
    Ok(())
}
