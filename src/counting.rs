//! Physical cash counting for the register reconciliation flow.
//!
//! All monetary arithmetic here happens in integer centavos. Bill quantities
//! times whole-córdoba denominations and operator-typed transfer amounts are
//! exact in centavos, so the closing gate's `difference == 0` comparison is
//! never disturbed by binary floating point.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Córdoba bill/coin face values accepted at the register, largest first.
pub const DENOMINATIONS: &[i64] = &[1000, 500, 200, 100, 50, 20, 10, 5, 1];

/// Banks the register accepts transfer payments from.
pub const TRANSFER_BANKS: &[&str] = &["BAC", "Banpro", "Lafise"];

/// Currency symbol used in operator-facing messages.
pub const CURRENCY: &str = "C$";

/// Quantity of bills counted per denomination. Absent entries count as zero.
pub type BillCount = BTreeMap<i64, u32>;

/// Transfer amount per bank, in centavos. Absent entries count as zero.
pub type TransferCount = BTreeMap<String, i64>;

/// Counted snapshot handed from reconciliation to the closing flow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CountSheet {
    #[serde(default)]
    pub bills: BillCount,
    #[serde(default)]
    pub transfers: TransferCount,
}

// ---------------------------------------------------------------------------
// Quantity updates
// ---------------------------------------------------------------------------

/// Set the counted quantity for a denomination to an absolute value.
///
/// Unknown denominations are ignored; a zero quantity removes the entry so
/// the map only carries what was actually counted.
pub fn set_quantity(bills: &mut BillCount, denomination: i64, quantity: u32) {
    if !DENOMINATIONS.contains(&denomination) {
        return;
    }
    if quantity == 0 {
        bills.remove(&denomination);
    } else {
        bills.insert(denomination, quantity);
    }
}

/// Increment the counted quantity for a denomination by one.
pub fn increment(bills: &mut BillCount, denomination: i64) {
    let current = quantity(bills, denomination);
    set_quantity(bills, denomination, current.saturating_add(1));
}

/// Decrement the counted quantity for a denomination by one, clamped at zero.
pub fn decrement(bills: &mut BillCount, denomination: i64) {
    let current = quantity(bills, denomination);
    set_quantity(bills, denomination, current.saturating_sub(1));
}

/// Current counted quantity for a denomination (absent = 0).
pub fn quantity(bills: &BillCount, denomination: i64) -> u32 {
    bills.get(&denomination).copied().unwrap_or(0)
}

/// Record an operator-typed transfer amount for a bank.
///
/// Non-numeric or negative input coerces to zero, matching the register's
/// "never NaN, never negative" input rule. Unknown banks are ignored.
pub fn set_transfer(transfers: &mut TransferCount, bank: &str, raw_amount: &str) {
    if !TRANSFER_BANKS.contains(&bank) {
        return;
    }
    let cents = parse_amount_cents(raw_amount);
    if cents == 0 {
        transfers.remove(bank);
    } else {
        transfers.insert(bank.to_string(), cents);
    }
}

// ---------------------------------------------------------------------------
// Centavo arithmetic
// ---------------------------------------------------------------------------

/// Parse a decimal money string into non-negative centavos.
///
/// Accepts up to two fraction digits ("25.5" reads as 25.50). Anything
/// unparsable, negative, or overlong in the fraction reads as 0.
pub fn parse_amount_cents(raw: &str) -> i64 {
    let s = raw.trim();
    if s.is_empty() || s.starts_with('-') {
        return 0;
    }
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return 0;
    }
    let whole: i64 = if whole.is_empty() {
        0
    } else {
        match whole.parse() {
            Ok(n) => n,
            Err(_) => return 0,
        }
    };
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().unwrap_or(0) * 10,
        _ => frac.parse().unwrap_or(0),
    };
    whole.saturating_mul(100).saturating_add(frac_cents)
}

/// Convert a ledger REAL amount to centavos, rounding half away from zero.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Convert centavos back to the f64 amount the ledger and UI use.
pub fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Σ(denomination × quantity) over the counted bills, in centavos.
pub fn cash_total_cents(bills: &BillCount) -> i64 {
    bills
        .iter()
        .map(|(denomination, qty)| denomination * 100 * i64::from(*qty))
        .sum()
}

/// Σ(amount) over the counted transfers, in centavos.
pub fn transfers_total_cents(transfers: &TransferCount) -> i64 {
    transfers.values().sum()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_clamp_at_zero_and_have_no_upper_bound() {
        let mut bills = BillCount::new();

        decrement(&mut bills, 100);
        assert_eq!(quantity(&bills, 100), 0);

        set_quantity(&mut bills, 100, 99_999);
        increment(&mut bills, 100);
        assert_eq!(quantity(&bills, 100), 100_000);

        decrement(&mut bills, 100);
        assert_eq!(quantity(&bills, 100), 99_999);
    }

    #[test]
    fn zero_quantity_removes_entry_and_unknown_denomination_is_ignored() {
        let mut bills = BillCount::new();
        set_quantity(&mut bills, 100, 3);
        set_quantity(&mut bills, 100, 0);
        assert!(bills.is_empty());

        set_quantity(&mut bills, 77, 4);
        assert!(bills.is_empty());
    }

    #[test]
    fn cash_total_is_exact_sum_of_denomination_times_quantity() {
        let mut bills = BillCount::new();
        set_quantity(&mut bills, 100, 2);
        set_quantity(&mut bills, 50, 1);
        assert_eq!(cash_total_cents(&bills), 250_00);
    }

    #[test]
    fn transfer_parsing_coerces_garbage_to_zero() {
        let mut transfers = TransferCount::new();

        set_transfer(&mut transfers, "BAC", "25.50");
        assert_eq!(transfers_total_cents(&transfers), 25_50);

        set_transfer(&mut transfers, "Banpro", "no-un-numero");
        set_transfer(&mut transfers, "Lafise", "-10");
        assert_eq!(transfers_total_cents(&transfers), 25_50);

        // Unknown bank is dropped entirely
        set_transfer(&mut transfers, "BancoFantasma", "500");
        assert_eq!(transfers.len(), 1);
    }

    #[test]
    fn parse_amount_cents_handles_fraction_widths() {
        assert_eq!(parse_amount_cents("25.50"), 2550);
        assert_eq!(parse_amount_cents("25.5"), 2550);
        assert_eq!(parse_amount_cents("25"), 2500);
        assert_eq!(parse_amount_cents(".75"), 75);
        assert_eq!(parse_amount_cents("25.505"), 0);
        assert_eq!(parse_amount_cents(""), 0);
        assert_eq!(parse_amount_cents("NaN"), 0);
    }

    #[test]
    fn cents_roundtrip_through_ledger_reals() {
        assert_eq!(to_cents(275.50), 27550);
        assert_eq!(to_cents(from_cents(27550)), 27550);
        // Classic float trap: 0.1 + 0.2
        assert_eq!(to_cents(0.1 + 0.2), 30);
    }
}
