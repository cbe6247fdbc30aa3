//! Application layer: change detection, notification fan-out and polling.

pub mod differ;
pub mod notifier;
pub mod poller;
pub mod scheduler;
pub mod state;

pub use differ::{DEFAULT_TOLERANCE, diff};
pub use notifier::{NotificationsChanged, Notifier, NotifierConfig, NotifyReport};
pub use poller::{PollHandle, PollerConfig, StatusPoller};
pub use scheduler::{
    RefreshOutcome, RefreshScheduler, RefreshState, RefreshTrigger, RefreshWorker,
    SchedulerConfig, spawn_refresh_worker,
};
pub use state::{WatcherConfig, WatcherState};
