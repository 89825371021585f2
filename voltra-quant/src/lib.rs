//! Option pricing numerics: Black–Scholes greeks and implied-volatility
//! inversion via a rational initial guess refined by safeguarded Newton
//! steps.
//!
//! All functions degrade to zeros on degenerate inputs (non-positive price,
//! strike, or time) instead of returning errors; the snapshot-apply hot loop
//! relies on that to skip bad quotes without branching at the call site.

use std::f64::consts::{PI, SQRT_2};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Volatility output clamp.
pub const MAX_VOL: f64 = 5.0;
/// Smallest volatility considered distinguishable from zero.
pub const MIN_VOL: f64 = 1e-6;
/// Floor for year fractions so same-day expiries stay solvable.
pub const MIN_T: f64 = 1e-6;

const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;
const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;

/// Which side of the quote feeds the IV inversion.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IvPriceMode {
    #[default]
    Mid,
    Bid,
    Ask,
}

impl IvPriceMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mid => "mid",
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

impl FromStr for IvPriceMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mid" => Ok(Self::Mid),
            "bid" => Ok(Self::Bid),
            "ask" => Ok(Self::Ask),
            other => Err(format!("unsupported iv price mode '{other}'")),
        }
    }
}

/// Select the IV input price for a quote under the given mode.
///
/// Mid is the half-spread when both sides are live, else whichever side is
/// positive, else zero. Bid/ask modes return zero when their side is dark,
/// which skips the option for that frame.
#[must_use]
pub fn pick_iv_input_price(bid: f64, ask: f64, mode: IvPriceMode) -> f64 {
    match mode {
        IvPriceMode::Bid => {
            if bid > 0.0 {
                bid
            } else {
                0.0
            }
        }
        IvPriceMode::Ask => {
            if ask > 0.0 {
                ask
            } else {
                0.0
            }
        }
        IvPriceMode::Mid => {
            if bid > 0.0 && ask > 0.0 {
                0.5 * (bid + ask)
            } else if bid > 0.0 {
                bid
            } else {
                ask
            }
        }
    }
}

/// Year fraction from `now` until `expiry`, floored at [`MIN_T`]; expired or
/// missing expiries yield zero so callers skip the solve entirely.
#[must_use]
pub fn years_to_expiry(now: DateTime<Utc>, expiry: Option<DateTime<Utc>>) -> f64 {
    let Some(expiry) = expiry else {
        return 0.0;
    };
    let secs = (expiry - now).num_seconds();
    if secs <= 0 {
        return 0.0;
    }
    (secs as f64 / SECONDS_PER_YEAR).max(MIN_T)
}

fn normal_pdf(x: f64) -> f64 {
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + libm::erf(x / SQRT_2))
}

/// Per-unit Black–Scholes greeks. Theta is per calendar day, vega per 1%
/// volatility move; both conventions match the position engine's rollup.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BsGreeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// Greeks at the given volatility. Degenerate inputs return all zeros.
#[must_use]
pub fn bs_greeks(is_call: bool, spot: f64, strike: f64, t: f64, rate: f64, sigma: f64) -> BsGreeks {
    if spot <= 0.0 || strike <= 0.0 || t <= 0.0 || sigma <= 0.0 {
        return BsGreeks::default();
    }
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    let pdf = normal_pdf(d1);
    let discount = (-rate * t).exp();

    let delta = if is_call {
        normal_cdf(d1)
    } else {
        normal_cdf(d1) - 1.0
    };
    let gamma = pdf / (spot * sigma * sqrt_t);
    let theta_annual = if is_call {
        -(spot * pdf * sigma) / (2.0 * sqrt_t) - rate * strike * discount * normal_cdf(d2)
    } else {
        -(spot * pdf * sigma) / (2.0 * sqrt_t) + rate * strike * discount * normal_cdf(-d2)
    };
    let vega = spot * pdf * sqrt_t;

    BsGreeks {
        delta,
        gamma,
        theta: theta_annual / 365.0,
        vega: vega / 100.0,
    }
}

/// Undiscounted Black price used by the inversion (forward = spot, rate 0).
#[must_use]
pub fn black_price(is_call: bool, spot: f64, strike: f64, t: f64, sigma: f64) -> f64 {
    if spot <= 0.0 || strike <= 0.0 || t <= 0.0 {
        return 0.0;
    }
    if sigma <= 0.0 {
        return intrinsic(is_call, spot, strike);
    }
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + 0.5 * sigma * sigma * t) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    if is_call {
        spot * normal_cdf(d1) - strike * normal_cdf(d2)
    } else {
        strike * normal_cdf(-d2) - spot * normal_cdf(-d1)
    }
}

fn intrinsic(is_call: bool, spot: f64, strike: f64) -> f64 {
    if is_call {
        (spot - strike).max(0.0)
    } else {
        (strike - spot).max(0.0)
    }
}

fn black_vega(spot: f64, strike: f64, t: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return 0.0;
    }
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + 0.5 * sigma * sigma * t) / (sigma * sqrt_t);
    spot * normal_pdf(d1) * sqrt_t
}

/// Corrado–Miller style rational starting point for the Newton refinement.
fn rational_guess(is_call: bool, price: f64, spot: f64, strike: f64, t: f64) -> f64 {
    // Work on the call price via parity (undiscounted, forward = spot).
    let call_price = if is_call {
        price
    } else {
        price + spot - strike
    };
    let sqrt_t = t.sqrt();
    let x = 0.5 * (spot + strike);
    let z = call_price - 0.5 * (spot - strike);
    let disc = z * z - (spot - strike) * (spot - strike) / PI;
    let root = if disc > 0.0 { disc.sqrt() } else { 0.0 };
    let guess = (2.0 * PI).sqrt() / (x * sqrt_t) * (z + root);
    if guess.is_finite() && guess > 0.0 {
        guess.clamp(MIN_VOL, MAX_VOL)
    } else {
        0.2
    }
}

/// Invert the Black formula for volatility.
///
/// A rational guess seeds Newton iterations on the price residual; every
/// step stays inside a maintained bracket, falling back to its midpoint when
/// a step escapes, so the solve cannot diverge. Output is clamped to
/// `[0, MAX_VOL]`; unsolvable inputs (price at or below intrinsic, or above
/// the saturation price) return the corresponding clamp edge.
#[must_use]
pub fn implied_volatility(price: f64, spot: f64, strike: f64, t: f64, is_call: bool) -> f64 {
    if price <= 0.0 || spot <= 0.0 || strike <= 0.0 || t <= 0.0 {
        return 0.0;
    }
    if price <= intrinsic(is_call, spot, strike) {
        return 0.0;
    }
    if price >= black_price(is_call, spot, strike, t, MAX_VOL) {
        return MAX_VOL;
    }

    let mut lo = 0.0;
    let mut hi = MAX_VOL;
    let mut sigma = rational_guess(is_call, price, spot, strike, t);
    for _ in 0..64 {
        let value = black_price(is_call, spot, strike, t, sigma) - price;
        if value.abs() < 1e-12 * spot {
            break;
        }
        if value > 0.0 {
            hi = sigma;
        } else {
            lo = sigma;
        }
        let vega = black_vega(spot, strike, t, sigma);
        let next = if vega > 1e-12 {
            sigma - value / vega
        } else {
            f64::NAN
        };
        sigma = if next.is_finite() && next > lo && next < hi {
            next
        } else {
            0.5 * (lo + hi)
        };
    }

    if !sigma.is_finite() || sigma <= 0.0 {
        return 0.0;
    }
    sigma.min(MAX_VOL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn iv_recovers_known_volatility() {
        for (is_call, sigma) in [(true, 0.18), (false, 0.18), (true, 0.65), (false, 1.2)] {
            let price = black_price(is_call, 4500.0, 4400.0, 0.05, sigma);
            let iv = implied_volatility(price, 4500.0, 4400.0, 0.05, is_call);
            assert!(
                (iv - sigma).abs() < 1e-6,
                "expected {sigma}, solved {iv} (call={is_call})"
            );
        }
    }

    #[test]
    fn iv_clamps_at_five() {
        // Absurd quote far above the sigma=5 saturation price.
        let iv = implied_volatility(1e6, 1.0, 1.0, 1e-4, true);
        assert_eq!(iv, MAX_VOL);
        let g = bs_greeks(true, 1.0, 1.0, 1e-4, 0.05, iv);
        assert!(g.delta.is_finite() && g.gamma.is_finite());
        assert!(g.theta.is_finite() && g.vega.is_finite());
    }

    #[test]
    fn iv_zero_below_intrinsic() {
        assert_eq!(implied_volatility(50.0, 4500.0, 4400.0, 0.05, true), 0.0);
        assert_eq!(implied_volatility(0.0, 4500.0, 4400.0, 0.05, true), 0.0);
    }

    #[test]
    fn greeks_have_textbook_signs() {
        let call = bs_greeks(true, 100.0, 100.0, 0.25, 0.05, 0.2);
        let put = bs_greeks(false, 100.0, 100.0, 0.25, 0.05, 0.2);
        assert!(call.delta > 0.0 && call.delta < 1.0);
        assert!(put.delta < 0.0 && put.delta > -1.0);
        assert!(call.gamma > 0.0 && (call.gamma - put.gamma).abs() < 1e-12);
        assert!(call.theta < 0.0);
        assert!(call.vega > 0.0);
    }

    #[test]
    fn year_fraction_floors_and_zeroes() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 1).unwrap();
        assert_eq!(years_to_expiry(now, Some(expiry)), MIN_T);
        assert_eq!(years_to_expiry(now, Some(now)), 0.0);
        assert_eq!(years_to_expiry(now, None), 0.0);
        let week = Utc.with_ymd_and_hms(2026, 3, 9, 15, 0, 0).unwrap();
        let t = years_to_expiry(now, Some(week));
        assert!((t - 7.0 / 365.25).abs() < 1e-9);
    }

    #[test]
    fn price_mode_side_selection() {
        assert_eq!(pick_iv_input_price(1.0, 1.2, IvPriceMode::Mid), 1.1);
        assert_eq!(pick_iv_input_price(0.0, 1.2, IvPriceMode::Mid), 1.2);
        assert_eq!(pick_iv_input_price(1.0, 0.0, IvPriceMode::Mid), 1.0);
        assert_eq!(pick_iv_input_price(0.0, 1.2, IvPriceMode::Bid), 0.0);
        assert_eq!(pick_iv_input_price(1.0, 1.2, IvPriceMode::Ask), 1.2);
        assert_eq!("ask".parse::<IvPriceMode>().unwrap(), IvPriceMode::Ask);
        assert!("last".parse::<IvPriceMode>().is_err());
    }
}
