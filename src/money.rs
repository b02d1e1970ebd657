//! Minor-unit money helpers
//!
//! Every stored amount is an integer count of the currency's smallest unit.
//! Conversions from user input never pass through floating point.

use crate::errors::{LedgerError, LedgerResult};

/// Amount in minor currency units (paisa, cents)
pub type Amount = i64;

/// Denominator for rates expressed in basis points
pub const BASIS_POINTS: i64 = 10_000;

/// Parse a major-unit decimal string ("300.00", "12.5", "40") into minor units.
pub fn parse_major_units(input: &str, minor_digits: u32) -> LedgerResult<Amount> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidAmount("amount is empty".to_string()));
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };

    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if whole.is_empty() || !all_digits(whole) || !all_digits(fraction) {
        return Err(LedgerError::InvalidAmount(format!(
            "'{}' is not a plain decimal amount",
            input
        )));
    }

    if fraction.len() > minor_digits as usize {
        return Err(LedgerError::InvalidAmount(format!(
            "'{}' has more than {} decimal places",
            input, minor_digits
        )));
    }

    let scale = 10i64.pow(minor_digits);
    let whole: i64 = whole
        .parse()
        .map_err(|_| LedgerError::InvalidAmount(format!("'{}' is out of range", input)))?;

    let mut padded = fraction.to_string();
    while padded.len() < minor_digits as usize {
        padded.push('0');
    }
    let fraction: i64 = if padded.is_empty() { 0 } else { padded.parse().unwrap_or(0) };

    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(|| LedgerError::InvalidAmount(format!("'{}' is out of range", input)))
}

/// Render minor units as a major-unit decimal string
pub fn format_minor_units(amount: Amount, minor_digits: u32) -> String {
    let scale = 10i64.pow(minor_digits);
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    if minor_digits == 0 {
        return format!("{}{}", sign, abs);
    }
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / scale as u64,
        abs % scale as u64,
        width = minor_digits as usize
    )
}

/// `floor(amount * bps / 10_000)` computed without intermediate overflow
pub fn apply_bps(amount: Amount, bps: i64) -> Amount {
    ((amount as i128 * bps as i128).div_euclid(BASIS_POINTS as i128)) as Amount
}

/// `a + b`, rejecting overflow
pub fn checked_sum(a: Amount, b: Amount) -> LedgerResult<Amount> {
    a.checked_add(b)
        .ok_or_else(|| LedgerError::InvalidAmount(format!("{} + {} overflows", a, b)))
}

/// Sum of a sequence of amounts, rejecting overflow
pub fn total<I: IntoIterator<Item = Amount>>(amounts: I) -> LedgerResult<Amount> {
    amounts.into_iter().try_fold(0, checked_sum)
}
