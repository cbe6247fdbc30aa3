//! Domain layer containing core types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, AppResult, ConfigError, FetchError, NotificationEmitError};
pub use traits::{BalanceSource, NotificationSink, TransactionStatusSource};
pub use types::{
    BalanceSnapshot, ChangeKind, ChangeRecord, Network, Notification, PollSession, Session,
    StatusReport, SubscriptionTier, TxStatus,
};
