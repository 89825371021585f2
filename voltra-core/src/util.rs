//! Rounding helpers and the platform symbol grammar.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::OptionType;

/// Token joining the parts of a platform symbol.
pub const JOIN_SYMBOL: &str = "-";

/// Prefix of synthetic combo symbols (`combo_<signature>`).
pub const COMBO_SYMBOL_PREFIX: &str = "combo_";

/// Suffix routing trades to the underlying position bucket.
pub const STOCK_SUFFIX: &str = ".STK";

/// Round `value` to the nearest multiple of `target`. A non-positive target
/// returns the value unchanged, so `round_to(x, contract.pricetick)` is safe
/// on contracts without a tick.
#[must_use]
pub fn round_to(value: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return value;
    }
    (value / target).round() * target
}

/// Round down to a multiple of `target`.
#[must_use]
pub fn floor_to(value: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return value;
    }
    (value / target).floor() * target
}

/// Round up to a multiple of `target`.
#[must_use]
pub fn ceil_to(value: f64, target: f64) -> f64 {
    if target <= 0.0 {
        return value;
    }
    (value / target).ceil() * target
}

/// Half-up rounding to `digits` decimal places.
///
/// Position accounting requires exact decimal midpoint behavior
/// (0.005 -> 0.01), which binary floats cannot express; the value takes a
/// round trip through [`Decimal`] to decide the midpoint.
#[must_use]
pub fn round_half_up(value: f64, digits: u32) -> f64 {
    let Some(dec) = Decimal::from_f64(value) else {
        return value;
    };
    dec.round_dp_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or(value)
}

/// Build a platform option symbol: `UNDERLYING-YYYYMMDD-C|P-STRIKE-MULT`.
#[must_use]
pub fn option_symbol(
    underlying: &str,
    expiry: DateTime<Utc>,
    option_type: OptionType,
    strike: f64,
    multiplier: u32,
) -> String {
    format!(
        "{underlying}{JOIN_SYMBOL}{}{JOIN_SYMBOL}{}{JOIN_SYMBOL}{}{JOIN_SYMBOL}{multiplier}",
        expiry.format("%Y%m%d"),
        option_type.token(),
        strike as i64,
    )
}

/// Chain key shared by all options of one expiry: `UNDERLYING_YYYYMMDD`.
#[must_use]
pub fn chain_key(underlying: &str, expiry: DateTime<Utc>) -> String {
    format!("{underlying}_{}", expiry.format("%Y%m%d"))
}

/// Chain key derived from an option symbol's first two tokens.
#[must_use]
pub fn chain_key_of_symbol(option_symbol: &str) -> String {
    let mut parts = option_symbol.split(JOIN_SYMBOL);
    let underlying = parts.next().unwrap_or_default();
    let expiry = parts.next().unwrap_or_default();
    format!("{underlying}_{expiry}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_to_yields_integer_multiples() {
        for (value, tick) in [(1.234, 0.01), (99.9951, 0.05), (-3.127, 0.25), (0.0, 0.5)] {
            let rounded = round_to(value, tick);
            let steps = rounded / tick;
            assert!(
                (steps - steps.round()).abs() < 1e-9,
                "{rounded} not a multiple of {tick}"
            );
        }
        assert_eq!(round_to(1.234, 0.0), 1.234);
    }

    #[test]
    fn half_up_breaks_midpoints_away_from_zero() {
        assert_eq!(round_half_up(2.005, 2), 2.01);
        assert_eq!(round_half_up(-2.005, 2), -2.01);
        assert_eq!(round_half_up(18.2, 2), 18.2);
        assert_eq!(round_half_up(1820.0, 2), 1820.0);
    }

    #[test]
    fn symbol_grammar_round_trips() {
        let expiry = Utc.with_ymd_and_hms(2026, 3, 2, 21, 0, 0).unwrap();
        let sym = option_symbol("SPXW", expiry, OptionType::Call, 2800.0, 100);
        assert_eq!(sym, "SPXW-20260302-C-2800-100");
        assert_eq!(chain_key_of_symbol(&sym), "SPXW_20260302");
        assert_eq!(chain_key("SPXW", expiry), "SPXW_20260302");
    }
}
