//! Deposit confirmation polling.
//!
//! Each poll owns one task that fetches the transaction status immediately
//! and then on a fixed interval until the status is terminal or the poll is
//! stopped. Only one poll per transaction id is active at a time; starting a
//! new one stops the previous and waits for its task to end before fetching.
//! Stopping cancels a fetch in flight. Manual checks go through the same
//! task, so a transaction never has more than one fetch in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AppError, FetchError, PollSession, StatusReport, TransactionStatusSource};

/// Default interval between status fetches
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;

/// Configuration for the status poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Upper bound on a single status fetch
    pub fetch_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            fetch_timeout: Duration::from_secs(super::scheduler::DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

impl PollerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        use std::env;

        let interval_secs = env::var("POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);

        let fetch_timeout_secs = env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(super::scheduler::DEFAULT_FETCH_TIMEOUT_SECS);

        Self {
            interval: Duration::from_secs(interval_secs),
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
        }
    }
}

/// Handle to one active poll. Cloning shares the same poll.
#[derive(Clone)]
pub struct PollHandle {
    transaction_id: String,
    generation: u64,
    stop_tx: Arc<watch::Sender<bool>>,
    manual: Arc<Notify>,
    session_rx: watch::Receiver<PollSession>,
}

impl PollHandle {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Stop polling. Safe to call any number of times, including after the
    /// poll ended on its own.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Ask for a fetch now instead of waiting for the next tick
    pub fn check_now(&self) {
        self.manual.notify_one();
    }

    /// Latest known state of the poll
    pub fn session(&self) -> PollSession {
        self.session_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollSession> {
        self.session_rx.clone()
    }

    /// Resolve once polling has ended, either on a terminal status or a stop.
    pub async fn wait_terminal(&self) -> PollSession {
        let mut rx = self.session_rx.clone();
        loop {
            {
                let session = rx.borrow_and_update();
                if session.is_terminal() {
                    return session.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

impl std::fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("transaction_id", &self.transaction_id)
            .field("generation", &self.generation)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Registry of per-transaction polls
pub struct StatusPoller {
    source: Arc<dyn TransactionStatusSource>,
    config: PollerConfig,
    active: Arc<DashMap<String, PollHandle>>,
    next_generation: AtomicU64,
}

impl StatusPoller {
    pub fn new(source: Arc<dyn TransactionStatusSource>, config: PollerConfig) -> Self {
        Self {
            source,
            config,
            active: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start polling `transaction_id`, replacing any poll already running for it.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self))]
    pub fn poll(&self, transaction_id: &str) -> PollHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (session_tx, session_rx) = watch::channel(PollSession::new(transaction_id));

        let handle = PollHandle {
            transaction_id: transaction_id.to_string(),
            generation,
            stop_tx: Arc::new(stop_tx),
            manual: Arc::new(Notify::new()),
            session_rx,
        };

        let previous = self
            .active
            .insert(transaction_id.to_string(), handle.clone())
            .map(|previous| {
                debug!(generation = previous.generation, "Stopping previous poll");
                previous.stop();
                previous.session_rx
            });

        let task = PollTask {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            transaction_id: transaction_id.to_string(),
            stop_tx: Arc::clone(&handle.stop_tx),
            stop_rx,
            manual: Arc::clone(&handle.manual),
            session_tx,
            previous,
        };

        let active = Arc::clone(&self.active);
        let id = transaction_id.to_string();
        tokio::spawn(async move {
            task.run().await;
            active.remove_if(&id, |_, h| h.generation == generation);
        });

        handle
    }

    /// Active poll for `transaction_id`, if any
    pub fn get(&self, transaction_id: &str) -> Option<PollHandle> {
        self.active.get(transaction_id).map(|h| h.value().clone())
    }

    pub fn is_polling(&self, transaction_id: &str) -> bool {
        self.active
            .get(transaction_id)
            .is_some_and(|h| !h.is_stopped())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Stop every active poll
    pub fn stop_all(&self) {
        self.active.retain(|_, handle| {
            handle.stop();
            false
        });
    }
}

struct PollTask {
    source: Arc<dyn TransactionStatusSource>,
    config: PollerConfig,
    transaction_id: String,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    manual: Arc<Notify>,
    session_tx: watch::Sender<PollSession>,
    /// Session channel of the poll this one replaced; closes when its task ends
    previous: Option<watch::Receiver<PollSession>>,
}

impl PollTask {
    async fn run(mut self) {
        if let Some(mut previous) = self.previous.take() {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {}
                _ = async { while previous.changed().await.is_ok() {} } => {}
            }
        }

        debug!(tx_id = %self.transaction_id, "Status poll started");

        // First tick completes immediately
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {}
                _ = self.manual.notified() => ticker.reset(),
                _ = ticker.tick() => {}
            }

            if *self.stop_rx.borrow() {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    debug!(tx_id = %self.transaction_id, "Poll stopped during fetch, cancelling");
                    break;
                }
                result = fetch_status(
                    self.source.as_ref(),
                    &self.transaction_id,
                    self.config.fetch_timeout,
                ) => result,
            };

            if *self.stop_rx.borrow() {
                debug!(tx_id = %self.transaction_id, "Poll stopped during fetch, discarding result");
                break;
            }

            let polled_at = Utc::now();
            let mut terminal = false;
            self.session_tx.send_modify(|session| {
                session.attempts += 1;
                session.last_polled_at = Some(polled_at);
                if let Ok(report) = &result {
                    session.apply(report.clone());
                    terminal = session.is_terminal();
                }
            });

            match result {
                Ok(report) if terminal => {
                    info!(
                        tx_id = %self.transaction_id,
                        status = %report.status,
                        block_number = ?report.block_number,
                        "Deposit reached terminal status"
                    );
                    self.stop_tx.send_replace(true);
                    break;
                }
                Ok(_) => debug!(tx_id = %self.transaction_id, "Deposit still pending"),
                Err(e) => {
                    warn!(tx_id = %self.transaction_id, error = %e, "Status fetch failed, will retry");
                }
            }
        }

        debug!(tx_id = %self.transaction_id, "Status poll ended");
    }

}

async fn fetch_status(
    source: &dyn TransactionStatusSource,
    transaction_id: &str,
    timeout: Duration,
) -> Result<StatusReport, AppError> {
    match tokio::time::timeout(timeout, source.fetch_transaction_status(transaction_id)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout.as_secs()).into()),
    }
}
