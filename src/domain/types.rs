//! Domain types: snapshots, change records, notifications and poll sessions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Chain/environment a snapshot was read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    #[default]
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            _ => Err(format!("Invalid network: {}", s)),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription plan of the watched user; drives the silent refresh cadence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Basic,
    Pro,
    Premium,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Premium => "premium",
        }
    }

    /// Interval between silent refreshes for this tier.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        match self {
            Self::Premium => Duration::from_secs(60),
            Self::Pro => Duration::from_secs(120),
            Self::Basic => Duration::from_secs(300),
        }
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Invalid subscription tier: {}", s)),
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity a refresh scheduler works for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Session {
    #[validate(length(min = 1, message = "User id is required"))]
    pub user_id: String,
    pub network: Network,
    /// Unknown until the plan has been resolved; no silent timer runs until then
    pub tier: Option<SubscriptionTier>,
}

impl Session {
    #[must_use]
    pub fn new(user_id: impl Into<String>, network: Network) -> Self {
        Self {
            user_id: user_id.into(),
            network,
            tier: None,
        }
    }

    #[must_use]
    pub fn with_tier(mut self, tier: SubscriptionTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Same user on the same network; the tier does not matter
    pub fn same_identity(&self, other: &Session) -> bool {
        self.user_id == other.user_id && self.network == other.network
    }
}

/// Immutable point-in-time view of a user's token balances.
///
/// Token order is the order balances were supplied in; a symbol supplied
/// twice keeps its first position and its last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    owner: String,
    network: Network,
    tokens: Vec<(String, Decimal)>,
    index: HashMap<String, usize>,
    captured_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    pub fn new<I, S>(owner: impl Into<String>, network: Network, balances: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        let mut tokens: Vec<(String, Decimal)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (symbol, amount) in balances {
            let symbol = symbol.into();
            match index.get(&symbol) {
                Some(&pos) => tokens[pos].1 = amount,
                None => {
                    index.insert(symbol.clone(), tokens.len());
                    tokens.push((symbol, amount));
                }
            }
        }

        Self {
            owner: owner.into(),
            network,
            tokens,
            index,
            captured_at: Utc::now(),
        }
    }

    /// Snapshot with no owner and no balances
    #[must_use]
    pub fn empty(network: Network) -> Self {
        Self::new(String::new(), network, Vec::<(String, Decimal)>::new())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Balance held for `token`, if the snapshot lists it
    pub fn get(&self, token: &str) -> Option<Decimal> {
        self.index.get(token).map(|&pos| self.tokens[pos].1)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.index.contains_key(token)
    }

    /// Balances in snapshot order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.tokens.iter().map(|(t, v)| (t.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Direction of a detected balance change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Previous balance was absent or zero
    New,
    Increase,
    Decrease,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Increase => "increase",
            Self::Decrease => "decrease",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One per-token difference between two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub token: String,
    pub previous_value: Decimal,
    pub new_value: Decimal,
    pub delta: Decimal,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    #[must_use]
    pub fn new(token: impl Into<String>, previous_value: Decimal, new_value: Decimal) -> Self {
        let delta = new_value - previous_value;
        let kind = if previous_value.is_zero() {
            ChangeKind::New
        } else if delta.is_sign_positive() {
            ChangeKind::Increase
        } else {
            ChangeKind::Decrease
        };

        Self {
            token: token.into(),
            previous_value,
            new_value,
            delta,
            kind,
        }
    }

    /// Record for a token missing from the newer snapshot: always a decrease to zero
    #[must_use]
    pub fn vanished(token: impl Into<String>, previous_value: Decimal) -> Self {
        Self {
            token: token.into(),
            previous_value,
            new_value: Decimal::ZERO,
            delta: -previous_value,
            kind: ChangeKind::Decrease,
        }
    }
}

/// User-facing notification produced for one change record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// The change that caused this notification, kept for audit
    pub payload: ChangeRecord,
}

impl Notification {
    #[must_use]
    pub fn for_change(user_id: impl Into<String>, change: &ChangeRecord) -> Self {
        let token = &change.token;
        let previous = change.previous_value.normalize();
        let new = change.new_value.normalize();
        let amount = change.delta.abs().normalize();

        let (title, message) = match change.kind {
            ChangeKind::New => (
                "New balance received".to_string(),
                format!("You received {} {}", amount, token),
            ),
            ChangeKind::Increase => (
                "Balance increased".to_string(),
                format!(
                    "Your {} balance increased by {} ({} → {})",
                    token, amount, previous, new
                ),
            ),
            ChangeKind::Decrease => (
                "Balance decreased".to_string(),
                format!(
                    "Your {} balance decreased by {} ({} → {})",
                    token, amount, previous, new
                ),
            ),
        };

        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            title,
            message,
            created_at: Utc::now(),
            payload: change.clone(),
        }
    }
}

/// Confirmation status of a deposit transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    #[default]
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Confirmed and failed end polling
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status answer for one transaction, with whatever confirmation data is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusReport {
    pub status: TxStatus,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

impl StatusReport {
    #[must_use]
    pub fn new(status: TxStatus) -> Self {
        Self {
            status,
            block_number: None,
            tx_hash: None,
        }
    }

    #[must_use]
    pub fn with_confirmation(mut self, block_number: u64, tx_hash: impl Into<String>) -> Self {
        self.block_number = Some(block_number);
        self.tx_hash = Some(tx_hash.into());
        self
    }
}

/// Polling state for one deposit transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollSession {
    pub transaction_id: String,
    pub status: TxStatus,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub block_number: Option<u64>,
    pub tx_hash: Option<String>,
}

impl PollSession {
    #[must_use]
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status: TxStatus::Pending,
            last_polled_at: None,
            attempts: 0,
            block_number: None,
            tx_hash: None,
        }
    }

    /// Fold a successful status answer into the session
    pub fn apply(&mut self, report: StatusReport) {
        self.status = report.status;
        if report.block_number.is_some() {
            self.block_number = report.block_number;
        }
        if report.tx_hash.is_some() {
            self.tx_hash = report.tx_hash;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn test_network_display_and_parsing() {
        for (network, string) in [(Network::Mainnet, "mainnet"), (Network::Testnet, "testnet")] {
            assert_eq!(network.to_string(), string);
            assert_eq!(Network::from_str(string).unwrap(), network);
        }
        assert!(Network::from_str("devnet").is_err());
        assert_eq!(Network::default(), Network::Testnet);
    }

    #[test]
    fn test_tier_intervals_shrink_with_plan() {
        assert_eq!(SubscriptionTier::Premium.refresh_interval(), Duration::from_secs(60));
        assert_eq!(SubscriptionTier::Pro.refresh_interval(), Duration::from_secs(120));
        assert_eq!(SubscriptionTier::Basic.refresh_interval(), Duration::from_secs(300));
        assert_eq!(SubscriptionTier::from_str("pro").unwrap(), SubscriptionTier::Pro);
        assert!(SubscriptionTier::from_str("gold").is_err());
    }

    #[test]
    fn test_session_identity_ignores_tier() {
        let basic = Session::new("user-1", Network::Testnet).with_tier(SubscriptionTier::Basic);
        assert!(basic.same_identity(&Session::new("user-1", Network::Testnet)));
        assert!(!basic.same_identity(&Session::new("user-1", Network::Mainnet)));
        assert!(!basic.same_identity(&Session::new("user-2", Network::Testnet)));
    }

    #[test]
    fn test_session_validation() {
        assert!(Session::new("user-1", Network::Testnet).validate().is_ok());
        assert!(Session::new("", Network::Testnet).validate().is_err());
    }

    #[test]
    fn test_snapshot_keeps_insertion_order_and_last_value() {
        let snapshot = BalanceSnapshot::new(
            "user-1",
            Network::Testnet,
            vec![("cBRL", dec!(1)), ("AZE", dec!(2)), ("cBRL", dec!(3))],
        );

        let tokens: Vec<&str> = snapshot.iter().map(|(t, _)| t).collect();
        assert_eq!(tokens, vec!["cBRL", "AZE"]);
        assert_eq!(snapshot.get("cBRL"), Some(dec!(3)));
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot.contains("PCN"));
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = BalanceSnapshot::empty(Network::default());
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.owner(), "");
        assert_eq!(snapshot.network(), Network::Testnet);
    }

    #[test]
    fn test_change_record_kind() {
        assert_eq!(ChangeRecord::new("A", dec!(0), dec!(5)).kind, ChangeKind::New);
        assert_eq!(ChangeRecord::new("A", dec!(5), dec!(7)).kind, ChangeKind::Increase);
        let down = ChangeRecord::new("A", dec!(5), dec!(0));
        assert_eq!(down.kind, ChangeKind::Decrease);
        assert_eq!(down.delta, dec!(-5));
    }

    #[test]
    fn test_vanished_record_is_a_decrease_even_when_negative() {
        let negative = ChangeRecord::vanished("AZE", dec!(-3));
        assert_eq!(negative.kind, ChangeKind::Decrease);
        assert_eq!(negative.new_value, Decimal::ZERO);
        assert_eq!(negative.delta, dec!(3));

        let positive = ChangeRecord::vanished("AZE", dec!(7));
        assert_eq!(positive.delta, dec!(-7));
        assert_eq!(positive.kind, ChangeKind::Decrease);
    }

    #[test]
    fn test_snapshot_index_matches_tokens() {
        let snapshot = BalanceSnapshot::new("u", Network::Mainnet, vec![("A", dec!(1)), ("B", dec!(2))]);
        assert_eq!(snapshot.get("A"), Some(dec!(1)));
        assert_eq!(snapshot.get("B"), Some(dec!(2)));
        assert_eq!(snapshot.get("C"), None);
    }

    #[test]
    fn test_notification_messages() {
        let increase = ChangeRecord::new("cBRL", dec!(50.000000), dec!(75.000000));
        let n = Notification::for_change("user-1", &increase);
        assert_eq!(n.title, "Balance increased");
        assert_eq!(n.message, "Your cBRL balance increased by 25 (50 → 75)");
        assert_eq!(n.payload, increase);

        let received = Notification::for_change("user-1", &ChangeRecord::new("PCN", dec!(0), dec!(10)));
        assert_eq!(received.message, "You received 10 PCN");
    }

    #[test]
    fn test_tx_status_display_and_parsing() {
        for (status, string) in [
            (TxStatus::Pending, "pending"),
            (TxStatus::Confirmed, "confirmed"),
            (TxStatus::Failed, "failed"),
        ] {
            assert_eq!(status.to_string(), string);
            assert_eq!(TxStatus::from_str(string).unwrap(), status);
        }
        assert!(!TxStatus::Pending.is_terminal());
        assert!(TxStatus::Confirmed.is_terminal());
        assert!(TxStatus::Failed.is_terminal());
    }

    #[test]
    fn test_poll_session_apply_keeps_known_metadata() {
        let mut session = PollSession::new("tx-1");
        session.apply(StatusReport::new(TxStatus::Pending).with_confirmation(10, "0xabc"));
        session.apply(StatusReport::new(TxStatus::Confirmed));

        assert_eq!(session.status, TxStatus::Confirmed);
        assert_eq!(session.block_number, Some(10));
        assert_eq!(session.tx_hash.as_deref(), Some("0xabc"));
        assert!(session.is_terminal());
    }
}
