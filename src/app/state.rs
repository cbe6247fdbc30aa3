//! Application state management.

use std::sync::Arc;

use crate::domain::{BalanceSource, NotificationSink, TransactionStatusSource};

use super::notifier::{Notifier, NotifierConfig};
use super::poller::{PollerConfig, StatusPoller};
use super::scheduler::{RefreshScheduler, SchedulerConfig};

/// Component configuration bundle
#[derive(Debug, Clone, Default)]
pub struct WatcherConfig {
    pub scheduler: SchedulerConfig,
    pub notifier: NotifierConfig,
    pub poller: PollerConfig,
}

impl WatcherConfig {
    /// Load every component configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            scheduler: SchedulerConfig::from_env(),
            notifier: NotifierConfig::from_env(),
            poller: PollerConfig::from_env(),
        }
    }
}

/// Shared watcher state
#[derive(Clone)]
pub struct WatcherState {
    pub notifier: Arc<Notifier>,
    pub scheduler: Arc<RefreshScheduler>,
    pub poller: Arc<StatusPoller>,
}

impl WatcherState {
    /// Wire the components over the given backends
    #[must_use]
    pub fn new(
        balances: Arc<dyn BalanceSource>,
        statuses: Arc<dyn TransactionStatusSource>,
        sink: Arc<dyn NotificationSink>,
        config: WatcherConfig,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(sink, config.notifier));
        let scheduler = Arc::new(RefreshScheduler::new(
            balances,
            Arc::clone(&notifier),
            config.scheduler,
        ));
        let poller = Arc::new(StatusPoller::new(statuses, config.poller));

        Self {
            notifier,
            scheduler,
            poller,
        }
    }

    /// Build state where one backend serves balances, statuses and notifications
    #[must_use]
    pub fn with_backend<B>(backend: Arc<B>, config: WatcherConfig) -> Self
    where
        B: BalanceSource + TransactionStatusSource + NotificationSink + 'static,
    {
        Self::new(
            Arc::clone(&backend) as Arc<dyn BalanceSource>,
            Arc::clone(&backend) as Arc<dyn TransactionStatusSource>,
            backend as Arc<dyn NotificationSink>,
            config,
        )
    }
}
