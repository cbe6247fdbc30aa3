//! Snapshot comparison.

use rust_decimal::Decimal;

use crate::domain::{BalanceSnapshot, ChangeRecord};

/// Smallest absolute delta treated as a real change (1e-6)
pub const DEFAULT_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Compare two snapshots and list the per-token changes.
///
/// Returns nothing when there is no baseline. Records for tokens present in
/// `next` come first, in `next`'s order; tokens that vanished with a nonzero
/// balance follow as decreases to zero, in `previous`'s order.
pub fn diff(
    previous: Option<&BalanceSnapshot>,
    next: &BalanceSnapshot,
    tolerance: Decimal,
) -> Vec<ChangeRecord> {
    let Some(previous) = previous else {
        return Vec::new();
    };

    let mut changes = Vec::new();

    for (token, new_value) in next.iter() {
        let previous_value = previous.get(token).unwrap_or(Decimal::ZERO);
        if (new_value - previous_value).abs() > tolerance {
            changes.push(ChangeRecord::new(token, previous_value, new_value));
        }
    }

    for (token, previous_value) in previous.iter() {
        if !next.contains(token) && previous_value.abs() > tolerance {
            changes.push(ChangeRecord::vanished(token, previous_value));
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChangeKind, Network};
    use rust_decimal_macros::dec;

    fn snapshot(balances: Vec<(&str, Decimal)>) -> BalanceSnapshot {
        BalanceSnapshot::new("user-1", Network::Testnet, balances)
    }

    #[test]
    fn test_default_tolerance_is_one_millionth() {
        assert_eq!(DEFAULT_TOLERANCE, dec!(0.000001));
    }

    #[test]
    fn test_no_baseline_yields_nothing() {
        let next = snapshot(vec![("AZE", dec!(100)), ("PCN", dec!(5))]);
        assert!(diff(None, &next, DEFAULT_TOLERANCE).is_empty());
    }

    #[test]
    fn test_changes_within_tolerance_are_ignored() {
        let previous = snapshot(vec![("AZE", dec!(100.0000000)), ("cBRL", dec!(50))]);
        let next = snapshot(vec![("AZE", dec!(100.000001)), ("cBRL", dec!(49.9999995))]);
        assert!(diff(Some(&previous), &next, DEFAULT_TOLERANCE).is_empty());
    }

    #[test]
    fn test_reference_scenario() {
        let previous = snapshot(vec![("AZE", dec!(100.000000)), ("cBRL", dec!(50.000000))]);
        let next = snapshot(vec![
            ("AZE", dec!(100.000000)),
            ("cBRL", dec!(75.000000)),
            ("PCN", dec!(10.000000)),
        ]);

        let changes = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        assert_eq!(changes.len(), 2);

        assert_eq!(changes[0].token, "cBRL");
        assert_eq!(changes[0].kind, ChangeKind::Increase);
        assert_eq!(changes[0].previous_value, dec!(50));
        assert_eq!(changes[0].new_value, dec!(75));
        assert_eq!(changes[0].delta, dec!(25));

        assert_eq!(changes[1].token, "PCN");
        assert_eq!(changes[1].kind, ChangeKind::New);
        assert_eq!(changes[1].previous_value, Decimal::ZERO);
        assert_eq!(changes[1].new_value, dec!(10));
        assert_eq!(changes[1].delta, dec!(10));
    }

    #[test]
    fn test_new_token_detected_once() {
        let previous = snapshot(vec![("AZE", dec!(1))]);
        let next = snapshot(vec![("AZE", dec!(1)), ("PCN", dec!(0.5))]);

        let changes = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        let pcn: Vec<_> = changes.iter().filter(|c| c.token == "PCN").collect();
        assert_eq!(pcn.len(), 1);
        assert_eq!(pcn[0].kind, ChangeKind::New);
        assert_eq!(pcn[0].new_value, dec!(0.5));
    }

    #[test]
    fn test_zero_previous_counts_as_new() {
        let previous = snapshot(vec![("AZE", dec!(0))]);
        let next = snapshot(vec![("AZE", dec!(3))]);

        let changes = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        assert_eq!(changes[0].kind, ChangeKind::New);
    }

    #[test]
    fn test_vanished_token_decreases_to_zero_after_present_tokens() {
        let previous = snapshot(vec![("AZE", dec!(7)), ("cBRL", dec!(50))]);
        let next = snapshot(vec![("cBRL", dec!(40))]);

        let changes = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].token, "cBRL");
        assert_eq!(changes[0].kind, ChangeKind::Decrease);
        assert_eq!(changes[1].token, "AZE");
        assert_eq!(changes[1].kind, ChangeKind::Decrease);
        assert_eq!(changes[1].new_value, Decimal::ZERO);
        assert_eq!(changes[1].delta, dec!(-7));
    }

    #[test]
    fn test_vanished_negative_balance_is_a_decrease() {
        let previous = snapshot(vec![("AZE", dec!(-2)), ("cBRL", dec!(1))]);
        let next = snapshot(vec![("cBRL", dec!(1))]);

        let changes = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].token, "AZE");
        assert_eq!(changes[0].kind, ChangeKind::Decrease);
        assert_eq!(changes[0].new_value, Decimal::ZERO);
    }

    #[test]
    fn test_vanished_dust_is_ignored() {
        let previous = snapshot(vec![("AZE", dec!(0.0000001))]);
        let next = snapshot(vec![]);
        assert!(diff(Some(&previous), &next, DEFAULT_TOLERANCE).is_empty());
    }

    #[test]
    fn test_diff_is_deterministic() {
        let previous = snapshot(vec![("A", dec!(1)), ("B", dec!(2)), ("C", dec!(3))]);
        let next = snapshot(vec![("C", dec!(4)), ("D", dec!(1)), ("A", dec!(2))]);

        let first = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        let second = diff(Some(&previous), &next, DEFAULT_TOLERANCE);
        assert_eq!(first, second);
        let tokens: Vec<&str> = first.iter().map(|c| c.token.as_str()).collect();
        assert_eq!(tokens, vec!["C", "D", "A", "B"]);
    }
}
