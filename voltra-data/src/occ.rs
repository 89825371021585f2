//! OCC option symbol grammar: `ROOT + YYMMDD + C|P + STRIKE*1000`, e.g.
//! `SPXW260302C02800000`. The root is not parsed here; historical files
//! carry it in the file path instead.

use chrono::{DateTime, TimeZone, Utc};
use voltra_core::OptionType;

/// Parse the date/type/strike tail of an OCC symbol.
///
/// The last 15 characters encode expiry, call/put flag, and strike in
/// thousandths. Expiry is pinned to 21:00 UTC (16:00 ET). Returns `None`
/// for anything that does not scan.
#[must_use]
pub fn parse_occ_symbol(symbol: &str) -> Option<(DateTime<Utc>, f64, OptionType)> {
    if symbol.len() < 15 {
        return None;
    }
    let tail = &symbol[symbol.len() - 15..];
    if !tail.is_ascii() {
        return None;
    }
    let yy: i32 = tail[0..2].parse().ok()?;
    let mm: u32 = tail[2..4].parse().ok()?;
    let dd: u32 = tail[4..6].parse().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    let expiry = Utc
        .with_ymd_and_hms(year, mm, dd, 21, 0, 0)
        .single()?;

    let option_type = match tail.as_bytes()[6].to_ascii_uppercase() {
        b'C' => OptionType::Call,
        b'P' => OptionType::Put,
        _ => return None,
    };
    let strike_milli: i64 = tail[7..15].parse().ok()?;
    Some((expiry, strike_milli as f64 / 1000.0, option_type))
}

/// Derive the underlying root from a historical file path.
///
/// Two layouts are recognized: the flat `backtest_SPX_20250220.parquet`
/// naming and the partitioned `data/SPXW/SPXW-2025-08/20250801.parquet`
/// tree, where the parent directory carries the root.
#[must_use]
pub fn infer_underlying_from_filename(path: &str) -> String {
    let file_name = path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .split('.')
        .next()
        .unwrap_or_default();

    if let Some(rest) = file_name.strip_prefix("backtest_") {
        return rest
            .split('_')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
    }

    // Partitioned layout: parent directory, with any `-YYYY-MM` suffix cut.
    let mut components: Vec<&str> = path.split(['/', '\\']).collect();
    components.pop();
    let Some(parent) = components.pop() else {
        return String::new();
    };
    parent
        .split('-')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_and_put_tails() {
        let (expiry, strike, option_type) = parse_occ_symbol("SPXW260302C02800000").unwrap();
        assert_eq!(option_type, OptionType::Call);
        assert_eq!(strike, 2800.0);
        assert_eq!(expiry, Utc.with_ymd_and_hms(2026, 3, 2, 21, 0, 0).unwrap());

        let (_, strike, option_type) = parse_occ_symbol("SPXW250220P04512500").unwrap();
        assert_eq!(option_type, OptionType::Put);
        assert_eq!(strike, 4512.5);
    }

    #[test]
    fn rejects_malformed_symbols() {
        assert!(parse_occ_symbol("SPXW").is_none());
        assert!(parse_occ_symbol("SPXW260302X02800000").is_none());
        assert!(parse_occ_symbol("SPXW26AB02C02800000").is_none());
    }

    #[test]
    fn infers_underlying_from_both_layouts() {
        assert_eq!(
            infer_underlying_from_filename("backtest_SPX_20250220.parquet"),
            "SPX"
        );
        assert_eq!(
            infer_underlying_from_filename("data/SPXW/SPXW-2025-08/20250801.parquet"),
            "SPXW"
        );
        assert_eq!(infer_underlying_from_filename("20250801.parquet"), "");
    }
}
