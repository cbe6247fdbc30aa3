//! Balance change detection for Coinage accounts.
//!
//! Periodically snapshots a user's token balances, diffs each snapshot
//! against the last one, and emits a notification per material change.
//! Deposit transactions can be polled until they confirm or fail.
//!
//! - [`domain`] - types, traits and errors
//! - [`app`] - differ, notifier, refresh scheduler and status poller
//! - [`infra`] - HTTP client for the Coinage API

pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use app::{
    NotificationsChanged, Notifier, PollHandle, RefreshScheduler, RefreshTrigger, StatusPoller,
    WatcherConfig, WatcherState, diff, spawn_refresh_worker,
};
pub use domain::{AppError, AppResult, BalanceSnapshot, ChangeKind, ChangeRecord, Session};
