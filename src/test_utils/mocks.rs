//! Mock implementations for testing.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{
    AppError, BalanceSnapshot, BalanceSource, FetchError, Network, Notification,
    NotificationEmitError, NotificationSink, StatusReport, TransactionStatusSource, TxStatus,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
    /// Artificial latency applied to every call
    pub delay: Option<Duration>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
            delay: None,
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn error_message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// Mock balance source with settable balances and scripted failures
pub struct MockBalanceSource {
    balances: Mutex<Vec<(String, Decimal)>>,
    owner_override: Mutex<Option<String>>,
    queued_owners: Mutex<VecDeque<String>>,
    queued_errors: Mutex<VecDeque<AppError>>,
    config: MockConfig,
    calls: AtomicUsize,
    is_healthy: AtomicBool,
}

impl MockBalanceSource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            balances: Mutex::new(Vec::new()),
            owner_override: Mutex::new(None),
            queued_owners: Mutex::new(VecDeque::new()),
            queued_errors: Mutex::new(VecDeque::new()),
            config,
            calls: AtomicUsize::new(0),
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Replace the balances returned by subsequent fetches
    pub fn set_balances<S: Into<String>>(&self, balances: Vec<(S, Decimal)>) {
        *self.balances.lock().unwrap() = balances
            .into_iter()
            .map(|(token, amount)| (token.into(), amount))
            .collect();
    }

    /// Report snapshots as belonging to `owner` instead of the requested user
    pub fn set_owner_override(&self, owner: Option<&str>) {
        *self.owner_override.lock().unwrap() = owner.map(str::to_string);
    }

    /// Report the next successful snapshot as belonging to `owner`
    pub fn push_owner_override(&self, owner: &str) {
        self.queued_owners.lock().unwrap().push_back(owner.to_string());
    }

    /// Fail the next fetch with `error`; queued errors are consumed in order
    pub fn push_error(&self, error: AppError) {
        self.queued_errors.lock().unwrap().push_back(error);
    }

    /// Fail every fetch with a transport error while unhealthy
    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockBalanceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceSource for MockBalanceSource {
    async fn fetch_balances(
        &self,
        user_id: &str,
        network: Network,
    ) -> Result<BalanceSnapshot, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.config.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.queued_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.config.should_fail {
            return Err(FetchError::Transport(self.config.error_message()).into());
        }
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(FetchError::Transport("Unhealthy".to_string()).into());
        }

        let owner = self
            .queued_owners
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.owner_override.lock().unwrap().clone())
            .unwrap_or_else(|| user_id.to_string());
        let balances = self.balances.lock().unwrap().clone();
        Ok(BalanceSnapshot::new(owner, network, balances))
    }
}

/// Mock status source answering from a per-transaction script.
///
/// Each fetch pops the next scripted answer; once the script is exhausted
/// the transaction reports `pending`.
pub struct MockStatusSource {
    scripts: Mutex<HashMap<String, VecDeque<Result<StatusReport, AppError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    config: MockConfig,
}

/// Decrements the in-flight count when a fetch completes or is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockStatusSource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            config,
        }
    }

    /// Queue a successful answer for `transaction_id`
    pub fn push_status(&self, transaction_id: &str, report: StatusReport) {
        self.push_result(transaction_id, Ok(report));
    }

    /// Queue a failure for `transaction_id`
    pub fn push_error(&self, transaction_id: &str, error: AppError) {
        self.push_result(transaction_id, Err(error));
    }

    fn push_result(&self, transaction_id: &str, result: Result<StatusReport, AppError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(transaction_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn call_count(&self, transaction_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(transaction_id)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of fetches that were running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockStatusSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionStatusSource for MockStatusSource {
    async fn fetch_transaction_status(
        &self,
        transaction_id: &str,
    ) -> Result<StatusReport, AppError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(transaction_id.to_string())
            .or_default() += 1;

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.config.delay {
            tokio::time::sleep(delay).await;
        }

        if self.config.should_fail {
            return Err(FetchError::Transport(self.config.error_message()).into());
        }

        self.scripts
            .lock()
            .unwrap()
            .get_mut(transaction_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(StatusReport::new(TxStatus::Pending)))
    }
}

/// Mock notification sink recording every delivered notification
pub struct MockNotificationSink {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing_calls: Mutex<HashSet<usize>>,
    calls: AtomicUsize,
    config: MockConfig,
}

impl MockNotificationSink {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            failing_calls: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            config,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Fail the emission with the given zero-based call index
    pub fn fail_call(&self, index: usize) {
        self.failing_calls.lock().unwrap().insert(index);
    }

    /// Get all delivered notifications (for testing)
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockNotificationSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn emit_notification(
        &self,
        notification: &Notification,
    ) -> Result<(), NotificationEmitError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.config.delay {
            tokio::time::sleep(delay).await;
        }

        if self.config.should_fail || self.failing_calls.lock().unwrap().contains(&index) {
            return Err(NotificationEmitError::Transport(self.config.error_message()));
        }

        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
