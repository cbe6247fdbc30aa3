//! Domain traits defining contracts for the Coinage backend.

use async_trait::async_trait;

use super::error::{AppError, NotificationEmitError};
use super::types::{BalanceSnapshot, Network, Notification, StatusReport};

/// Source of balance snapshots
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Fetch the current balances of `user_id` on `network`
    async fn fetch_balances(
        &self,
        user_id: &str,
        network: Network,
    ) -> Result<BalanceSnapshot, AppError>;
}

/// Source of deposit confirmation status
#[async_trait]
pub trait TransactionStatusSource: Send + Sync {
    /// Fetch the current status of a deposit transaction
    async fn fetch_transaction_status(
        &self,
        transaction_id: &str,
    ) -> Result<StatusReport, AppError>;
}

/// Destination for user-facing notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Persist one notification. Fire-and-forget from the caller's point of view.
    async fn emit_notification(
        &self,
        notification: &Notification,
    ) -> Result<(), NotificationEmitError>;
}
