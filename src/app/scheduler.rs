//! Balance refresh scheduling.
//!
//! [`RefreshScheduler`] runs the fetch → diff → notify → replace cycle for one
//! session with at most one fetch in flight. Triggers that arrive while a
//! fetch is running are dropped rather than queued.
//!
//! [`RefreshWorker`] drives silent refreshes on the interval of the session's
//! subscription tier. The timer only exists once the tier is known and is
//! rebuilt whenever the session changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use super::differ::{self, DEFAULT_TOLERANCE};
use super::notifier::{Notifier, NotifyReport};
use crate::domain::{
    AppError, AppResult, BalanceSnapshot, BalanceSource, FetchError, Network, Session,
};

/// Default bound on a single balance fetch
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Default time the `refreshing` flag stays raised after a silent refresh found changes
pub const DEFAULT_REFRESH_HINT_MS: u64 = 1_000;

/// Configuration for the refresh scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum absolute delta treated as a change
    pub tolerance: Decimal,
    /// Upper bound on a single fetch; expiry counts as a fetch failure
    pub fetch_timeout: Duration,
    /// How long `refreshing` stays raised after a silent refresh with changes
    pub refresh_hint: Duration,
    /// Whether the background worker should be started
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            refresh_hint: Duration::from_millis(DEFAULT_REFRESH_HINT_MS),
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        use std::env;

        let tolerance = env::var("BALANCE_TOLERANCE")
            .ok()
            .and_then(|v| v.parse::<Decimal>().ok())
            .unwrap_or(DEFAULT_TOLERANCE);

        let fetch_timeout_secs = env::var("FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

        let refresh_hint_ms = env::var("REFRESH_HINT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REFRESH_HINT_MS);

        let enabled = env::var("ENABLE_REFRESH_WORKER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Self {
            tolerance,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            refresh_hint: Duration::from_millis(refresh_hint_ms),
            enabled,
        }
    }
}

/// What asked for a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// First load once a session is available
    Initial,
    /// User-initiated
    Manual,
    /// Timer-initiated, unobtrusive
    Silent,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Manual => "manual",
            Self::Silent => "silent",
        }
    }

    /// Initial and manual refreshes raise the loading indicator and surface errors
    pub fn is_foreground(&self) -> bool {
        !matches!(self, Self::Silent)
    }
}

impl std::fmt::Display for RefreshTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a trigger that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A snapshot was fetched and stored
    Refreshed { changes: usize, notify: NotifyReport },
    /// Initial trigger while a snapshot for this session is already held
    AlreadyLoaded,
    /// Another fetch was in flight
    Dropped,
}

/// Published view of the scheduler for consumers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshState {
    pub loading: bool,
    pub refreshing: bool,
    /// Last error of a foreground trigger, cleared by the next success
    pub last_error: Option<AppError>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag when the cycle ends, however it ends
struct FetchGuard<'a>(&'a AtomicBool);

impl<'a> FetchGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the snapshot store of one session and serialises refreshes
pub struct RefreshScheduler {
    source: Arc<dyn BalanceSource>,
    notifier: Arc<Notifier>,
    config: SchedulerConfig,
    session_tx: watch::Sender<Option<Session>>,
    baseline: RwLock<Option<Arc<BalanceSnapshot>>>,
    fetching: AtomicBool,
    state_tx: Arc<watch::Sender<RefreshState>>,
    hint_generation: Arc<AtomicU64>,
}

impl RefreshScheduler {
    pub fn new(
        source: Arc<dyn BalanceSource>,
        notifier: Arc<Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        let (session_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(RefreshState::default());
        Self {
            source,
            notifier,
            config,
            session_tx,
            baseline: RwLock::new(None),
            fetching: AtomicBool::new(false),
            state_tx: Arc::new(state_tx),
            hint_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Currently active session
    pub fn session(&self) -> Option<Session> {
        self.session_tx.borrow().clone()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RefreshState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> RefreshState {
        self.state_tx.borrow().clone()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::Acquire)
    }

    /// Held snapshot, or an empty default-network snapshot when none is held
    pub fn snapshot(&self) -> Arc<BalanceSnapshot> {
        self.baseline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Arc::new(BalanceSnapshot::empty(Network::default())))
    }

    /// True once a real snapshot (not the empty placeholder) is held
    pub fn has_snapshot(&self) -> bool {
        self.baseline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Install, replace or clear the session.
    ///
    /// A different user or network resets the snapshot store; a tier change
    /// for the same user keeps it. Either way the worker rebuilds its timer.
    pub fn set_session(&self, session: Option<Session>) -> AppResult<()> {
        if let Some(session) = &session {
            session
                .validate()
                .map_err(|e| AppError::Validation(e.to_string()))?;
        }

        let mut baseline = self.baseline.write().unwrap_or_else(PoisonError::into_inner);
        let previous = self.session_tx.send_replace(session.clone());

        let same_identity = match (&previous, &session) {
            (Some(a), Some(b)) => a.same_identity(b),
            _ => false,
        };
        if !same_identity {
            *baseline = None;
            self.state_tx.send_modify(|s| {
                s.last_error = None;
                s.last_refreshed_at = None;
            });
        }
        drop(baseline);

        match &session {
            Some(s) => info!(
                user_id = %s.user_id,
                network = %s.network,
                tier = ?s.tier,
                reset = !same_identity,
                "Session updated"
            ),
            None => info!("Session cleared"),
        }
        Ok(())
    }

    /// Change the tier of the active session, if any
    pub fn set_tier(&self, tier: crate::domain::SubscriptionTier) {
        self.session_tx.send_if_modified(|session| match session {
            Some(s) if s.tier != Some(tier) => {
                s.tier = Some(tier);
                true
            }
            _ => false,
        });
    }

    /// Run one refresh cycle.
    ///
    /// Foreground triggers surface failures through the returned error and
    /// [`RefreshState::last_error`]; the previous snapshot is always kept
    /// unless the session itself is gone.
    #[instrument(skip_all, fields(trigger = %trigger))]
    pub async fn trigger(&self, trigger: RefreshTrigger) -> AppResult<RefreshOutcome> {
        let Some(session) = self.session() else {
            debug!("No active session, resetting balances");
            self.reset();
            return Err(AppError::SessionUnavailable);
        };

        if trigger == RefreshTrigger::Initial && self.has_snapshot() {
            debug!(user_id = %session.user_id, "Balances already loaded");
            return Ok(RefreshOutcome::AlreadyLoaded);
        }

        let Some(_guard) = FetchGuard::acquire(&self.fetching) else {
            debug!("Refresh already in flight, dropping trigger");
            return Ok(RefreshOutcome::Dropped);
        };

        if trigger.is_foreground() {
            self.state_tx.send_modify(|s| s.loading = true);
        }

        let result = self.run_until_current(trigger, session.clone()).await;

        match &result {
            Ok(_) => {
                let now = Utc::now();
                self.state_tx.send_modify(|s| {
                    s.loading = false;
                    s.last_error = None;
                    s.last_refreshed_at = Some(now);
                });
            }
            Err(e) => {
                if matches!(e, AppError::SessionUnavailable) {
                    self.reset();
                }

                if trigger == RefreshTrigger::Silent && e.is_auth_expired() {
                    // Credentials are refreshed by the session layer
                } else {
                    warn!(user_id = %session.user_id, error = %e, "Balance refresh failed");
                }

                let surfaced = trigger.is_foreground().then(|| e.clone());
                self.state_tx.send_modify(|s| {
                    s.loading = false;
                    if surfaced.is_some() {
                        s.last_error = surfaced;
                    }
                });
            }
        }

        result
    }

    /// Run cycles until one finishes for the session that is still active.
    ///
    /// A cycle whose session was replaced while it ran is stale. Its result is
    /// dropped and the cycle reruns for the new session, which is how a
    /// session that arrived mid-fetch gets its first snapshot.
    async fn run_until_current(
        &self,
        trigger: RefreshTrigger,
        mut session: Session,
    ) -> AppResult<RefreshOutcome> {
        loop {
            let result = self.run_cycle(trigger, &session).await;
            let stale = matches!(result, Err(AppError::SessionUnavailable));

            match self.session() {
                Some(current) if stale || !current.same_identity(&session) => {
                    info!(
                        previous = %session.user_id,
                        user_id = %current.user_id,
                        "Session changed during refresh, loading active session"
                    );
                    session = current;
                }
                _ => return result,
            }
        }
    }

    async fn run_cycle(
        &self,
        trigger: RefreshTrigger,
        session: &Session,
    ) -> AppResult<RefreshOutcome> {
        let snapshot = match self.fetch_verified(session).await {
            Err(AppError::MismatchedIdentity { expected, actual }) => {
                warn!(
                    expected = %expected,
                    actual = %actual,
                    "Discarding snapshot fetched for another user"
                );
                self.reset();
                self.fetch_verified(session).await?
            }
            other => other?,
        };

        let previous = {
            let baseline = self.baseline.read().unwrap_or_else(PoisonError::into_inner);
            if !self.is_active(session) {
                return Err(AppError::SessionUnavailable);
            }
            baseline.clone()
        };
        let changes = differ::diff(previous.as_deref(), &snapshot, self.config.tolerance);

        let notify = if changes.is_empty() {
            NotifyReport::default()
        } else {
            info!(
                user_id = %snapshot.owner(),
                changes = changes.len(),
                "Balance changes detected"
            );
            self.notifier.notify(snapshot.owner(), &changes).await
        };

        if !self.replace(session, snapshot) {
            return Err(AppError::SessionUnavailable);
        }

        if trigger == RefreshTrigger::Silent && !changes.is_empty() {
            self.raise_refresh_hint();
        }

        Ok(RefreshOutcome::Refreshed {
            changes: changes.len(),
            notify,
        })
    }

    /// Fetch for `session` and check the result belongs to the user asked for
    async fn fetch_verified(&self, session: &Session) -> AppResult<BalanceSnapshot> {
        let snapshot = self.fetch(session).await?;

        if snapshot.owner() != session.user_id {
            return Err(AppError::MismatchedIdentity {
                expected: session.user_id.clone(),
                actual: snapshot.owner().to_string(),
            });
        }
        Ok(snapshot)
    }

    async fn fetch(&self, session: &Session) -> AppResult<BalanceSnapshot> {
        let timeout = self.config.fetch_timeout;
        match tokio::time::timeout(
            timeout,
            self.source.fetch_balances(&session.user_id, session.network),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(timeout.as_secs()).into()),
        }
    }

    fn is_active(&self, session: &Session) -> bool {
        self.session_tx
            .borrow()
            .as_ref()
            .is_some_and(|s| s.same_identity(session))
    }

    /// Store `snapshot` if `session` is still the active one
    fn replace(&self, session: &Session, snapshot: BalanceSnapshot) -> bool {
        let mut baseline = self.baseline.write().unwrap_or_else(PoisonError::into_inner);
        let active = self.is_active(session);
        if active {
            *baseline = Some(Arc::new(snapshot));
        }
        active
    }

    fn reset(&self) {
        *self.baseline.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn raise_refresh_hint(&self) {
        let generation = self.hint_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.state_tx.send_modify(|s| s.refreshing = true);

        let state_tx = Arc::clone(&self.state_tx);
        let hint_generation = Arc::clone(&self.hint_generation);
        let hint = self.config.refresh_hint;
        tokio::spawn(async move {
            tokio::time::sleep(hint).await;
            // A later hint owns the flag now
            if hint_generation.load(Ordering::Acquire) == generation {
                state_tx.send_modify(|s| s.refreshing = false);
            }
        });
    }
}

enum WorkerWake {
    SessionChanged,
    Shutdown,
}

/// Background driver of silent refreshes
pub struct RefreshWorker {
    scheduler: Arc<RefreshScheduler>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RefreshWorker {
    pub fn new(scheduler: Arc<RefreshScheduler>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            scheduler,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("Balance refresh worker started");
        let mut session_rx = self.scheduler.subscribe_session();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            let session = session_rx.borrow_and_update().clone();
            if session.is_some() {
                // Failures are logged by the scheduler
                let _ = self.scheduler.trigger(RefreshTrigger::Initial).await;
            }

            let period = session
                .as_ref()
                .and_then(|s| s.tier)
                .map(|tier| tier.refresh_interval());

            match self.wait(&mut session_rx, period).await {
                WorkerWake::SessionChanged => continue,
                WorkerWake::Shutdown => break,
            }
        }

        info!("Balance refresh worker stopped");
    }

    /// Tick silent refreshes every `period` until the session changes or
    /// shutdown is requested. Without a period, only wait.
    async fn wait(
        &mut self,
        session_rx: &mut watch::Receiver<Option<Session>>,
        period: Option<Duration>,
    ) -> WorkerWake {
        let Some(period) = period else {
            return tokio::select! {
                _ = self.shutdown_rx.changed() => WorkerWake::Shutdown,
                changed = session_rx.changed() => match changed {
                    Ok(()) => WorkerWake::SessionChanged,
                    Err(_) => WorkerWake::Shutdown,
                },
            };
        };

        debug!(period_secs = period.as_secs(), "Silent refresh timer armed");
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => return WorkerWake::Shutdown,
                changed = session_rx.changed() => {
                    return match changed {
                        Ok(()) => WorkerWake::SessionChanged,
                        Err(_) => WorkerWake::Shutdown,
                    };
                }
                _ = ticker.tick() => {
                    if *self.shutdown_rx.borrow() {
                        return WorkerWake::Shutdown;
                    }
                    let _ = self.scheduler.trigger(RefreshTrigger::Silent).await;
                }
            }
        }
    }
}

/// Spawn the refresh worker. Send `true` on the returned channel to stop it.
pub fn spawn_refresh_worker(
    scheduler: Arc<RefreshScheduler>,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = RefreshWorker::new(scheduler, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}
