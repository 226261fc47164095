//! Base-unit amounts and their conversion to the ledger's 6-decimal minor
//! units. All arithmetic in the service layer happens in base units as exact
//! decimals; only the ledger adapter converts to minor units.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::AppError;

pub const LEDGER_FEE: Decimal = dec!(0.001);
pub const MAX_AMOUNT: Decimal = dec!(1000000);
const MINOR_UNIT_SCALE: u32 = 6;

/// Validates a base-unit amount: positive, at most `MAX_AMOUNT`, and no more
/// than 6 decimal places (mirrors the command parser's `amount` slot rule).
pub fn validate_amount(amount: Decimal) -> Result<(), AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::validation("amount must be positive"));
    }
    if amount > MAX_AMOUNT {
        return Err(AppError::validation("amount exceeds the maximum of 1,000,000"));
    }
    if amount.scale() > MINOR_UNIT_SCALE {
        return Err(AppError::validation("amount may have at most 6 decimal places"));
    }
    Ok(())
}

/// Base units to ledger minor units (e.g. ALGO to microAlgo).
pub fn to_minor_units(amount: Decimal) -> i64 {
    let scaled = amount * Decimal::from(10i64.pow(MINOR_UNIT_SCALE));
    scaled.round().try_into().unwrap_or(i64::MAX)
}

/// Ledger minor units back to base units.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::from(minor) / Decimal::from(10i64.pow(MINOR_UNIT_SCALE))
}

/// `balance >= amount + fee`, the precondition repeated by every spending
/// operation in the spec (payment, split share, fund contribution, lock).
pub fn has_sufficient_balance(balance: Decimal, amount: Decimal) -> bool {
    balance >= amount + LEDGER_FEE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_amounts() {
        assert!(validate_amount(dec!(0)).is_err());
        assert!(validate_amount(dec!(-5)).is_err());
    }

    #[test]
    fn rejects_amount_above_max() {
        assert!(validate_amount(dec!(1000000.01)).is_err());
        assert!(validate_amount(MAX_AMOUNT).is_ok());
    }

    #[test]
    fn rejects_too_many_decimals() {
        assert!(validate_amount(dec!(1.1234567)).is_err());
        assert!(validate_amount(dec!(1.123456)).is_ok());
    }

    #[test]
    fn minor_unit_round_trip_is_exact() {
        let amount = dec!(12.345678);
        let minor = to_minor_units(amount);
        assert_eq!(minor, 12_345_678);
        assert_eq!(from_minor_units(minor), amount);
    }

    #[test]
    fn balance_check_accounts_for_fee() {
        assert!(has_sufficient_balance(dec!(5.001), dec!(5)));
        assert!(!has_sufficient_balance(dec!(5.0009), dec!(5)));
    }
}
