//! Test utilities and mock implementations.

pub mod mocks;

pub use mocks::{MockBalanceSource, MockConfig, MockNotificationSink, MockStatusSource};
