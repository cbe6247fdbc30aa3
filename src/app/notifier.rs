//! Notification fan-out for detected balance changes.
//!
//! One notification is emitted per change record, spaced by a short delay so
//! the downstream store is not flooded. Delivery is best effort: a failed
//! emission is logged and the remaining records are still sent. Once every
//! record has been attempted, subscribers receive a single
//! [`NotificationsChanged`] signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::domain::{ChangeRecord, Notification, NotificationSink};

/// Default spacing between consecutive emissions
pub const DEFAULT_EMIT_DELAY_MS: u64 = 100;

const SIGNAL_CAPACITY: usize = 16;

/// Configuration for the notifier
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Pause between two emissions of the same batch
    pub emit_delay: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            emit_delay: Duration::from_millis(DEFAULT_EMIT_DELAY_MS),
        }
    }
}

impl NotifierConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let emit_delay_ms = std::env::var("NOTIFY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_EMIT_DELAY_MS);

        Self {
            emit_delay: Duration::from_millis(emit_delay_ms),
        }
    }
}

/// Signal that a user's notification list may have changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationsChanged {
    pub user_id: String,
    pub emitted: usize,
}

/// Outcome of one `notify` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub emitted: usize,
    pub failed: usize,
}

impl NotifyReport {
    pub fn attempted(&self) -> usize {
        self.emitted + self.failed
    }
}

/// Turns change records into notifications and announces new ones
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    config: NotifierConfig,
    changed_tx: broadcast::Sender<NotificationsChanged>,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, config: NotifierConfig) -> Self {
        let (changed_tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            sink,
            config,
            changed_tx,
        }
    }

    /// Subscribe to the notifications-changed signal
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationsChanged> {
        self.changed_tx.subscribe()
    }

    /// Emit one notification per record, then signal subscribers once.
    #[instrument(skip_all, fields(user_id = %user_id, count = records.len()))]
    pub async fn notify(&self, user_id: &str, records: &[ChangeRecord]) -> NotifyReport {
        let mut report = NotifyReport::default();
        if records.is_empty() {
            return report;
        }

        for (i, record) in records.iter().enumerate() {
            if i > 0 && !self.config.emit_delay.is_zero() {
                tokio::time::sleep(self.config.emit_delay).await;
            }

            let notification = Notification::for_change(user_id, record);
            match self.sink.emit_notification(&notification).await {
                Ok(()) => {
                    debug!(token = %record.token, kind = %record.kind, "Notification emitted");
                    report.emitted += 1;
                }
                Err(e) => {
                    warn!(token = %record.token, kind = %record.kind, error = %e, "Failed to emit notification");
                    report.failed += 1;
                }
            }
        }

        // No subscribers is fine
        let _ = self.changed_tx.send(NotificationsChanged {
            user_id: user_id.to_string(),
            emitted: report.emitted,
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NotificationEmitError;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Instant)>>,
        fail_tokens: Vec<String>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn emit_notification(
            &self,
            notification: &Notification,
        ) -> Result<(), NotificationEmitError> {
            let token = notification.payload.token.clone();
            if self.fail_tokens.contains(&token) {
                return Err(NotificationEmitError::Transport("boom".into()));
            }
            self.sent.lock().unwrap().push((token, Instant::now()));
            Ok(())
        }
    }

    fn records(tokens: &[&str]) -> Vec<ChangeRecord> {
        tokens
            .iter()
            .map(|t| ChangeRecord::new(*t, dec!(1), dec!(2)))
            .collect()
    }

    #[test]
    fn test_config_default() {
        assert_eq!(NotifierConfig::default().emit_delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone(), NotifierConfig::default());
        let mut rx = notifier.subscribe();

        let report = notifier.notify("u1", &[]).await;

        assert_eq!(report, NotifyReport::default());
        assert!(sink.sent.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emissions_are_spaced() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone(), NotifierConfig::default());

        let start = Instant::now();
        notifier.notify("u1", &records(&["A", "B", "C"])).await;

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1 - start, Duration::ZERO);
        assert!(sent[1].1 - sent[0].1 >= Duration::from_millis(100));
        assert!(sent[2].1 - sent[1].1 >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_partial_failure_still_emits_rest_and_signals_once() {
        let sink = Arc::new(RecordingSink {
            fail_tokens: vec!["B".to_string()],
            ..Default::default()
        });
        let notifier = Notifier::new(
            sink.clone(),
            NotifierConfig {
                emit_delay: Duration::ZERO,
            },
        );
        let mut rx = notifier.subscribe();

        let report = notifier.notify("u1", &records(&["A", "B", "C"])).await;

        assert_eq!(report.emitted, 2);
        assert_eq!(report.failed, 1);
        let tokens: Vec<String> = sink.sent.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(tokens, vec!["A", "C"]);

        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.user_id, "u1");
        assert_eq!(signal.emitted, 2);
        assert!(rx.try_recv().is_err());
    }
}
