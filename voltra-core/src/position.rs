//! Position records shared by the position engine and its consumers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ComboType, Symbol};

/// Multiplier assumed for listed option contracts.
pub const OPTION_MULTIPLIER: f64 = 100.0;

/// Symbol placeholder until the first underlying trade names the real one.
pub const UNDERLYING_PLACEHOLDER: &str = "Underlying";

/// One netted position bucket: the underlying, a single option leg, or a
/// combo leg. Quantity is signed; greeks and `mid_price` are the per-unit
/// values refreshed at metric time.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: i64,
    pub avg_cost: f64,
    pub cost_value: f64,
    pub realized_pnl: f64,
    pub mid_price: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub multiplier: f64,
}

impl Position {
    /// A fresh option-leg position for `symbol`.
    #[must_use]
    pub fn option(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            multiplier: OPTION_MULTIPLIER,
            ..Self::default()
        }
    }

    /// The stock-hedge bucket; theoretical delta defaults to 1.
    #[must_use]
    pub fn underlying() -> Self {
        Self {
            symbol: UNDERLYING_PLACEHOLDER.into(),
            delta: 1.0,
            multiplier: 1.0,
            ..Self::default()
        }
    }

    /// Marked-to-mid value of the bucket.
    #[must_use]
    pub fn current_value(&self) -> f64 {
        self.quantity as f64 * self.mid_price * self.multiplier
    }

    /// Zero out cost and greeks once flat so stale values do not leak into
    /// the next rollup. Realized PnL is preserved.
    pub fn clear_fields(&mut self) {
        if self.quantity == 0 {
            self.avg_cost = 0.0;
            self.cost_value = 0.0;
            self.mid_price = 0.0;
            self.delta = 0.0;
            self.gamma = 0.0;
            self.theta = 0.0;
            self.vega = 0.0;
        }
    }
}

/// A combo position: the aggregate bucket plus one [`Position`] per leg.
/// `quantity` counts combo units; greeks and costs are re-derived from the
/// legs at metric time.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ComboPosition {
    #[serde(flatten)]
    pub base: Position,
    pub combo_type: ComboType,
    pub legs: Vec<Position>,
}

impl ComboPosition {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, combo_type: ComboType) -> Self {
        Self {
            base: Position::option(symbol),
            combo_type,
            legs: Vec::new(),
        }
    }

    pub fn clear_fields(&mut self) {
        self.base.clear_fields();
        for leg in &mut self.legs {
            leg.clear_fields();
        }
    }
}

/// Rolled-up metrics for one strategy holding, refreshed every Timer tick.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct HoldingSummary {
    pub total_cost: f64,
    pub current_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub pnl: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// Per-strategy aggregate: one underlying bucket, single-leg options keyed
/// by symbol, combos keyed by combo symbol, and the summary rollup.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StrategyHolding {
    pub underlying: Position,
    pub options: HashMap<Symbol, Position>,
    pub combos: HashMap<Symbol, ComboPosition>,
    pub summary: HoldingSummary,
}

impl Default for StrategyHolding {
    fn default() -> Self {
        Self {
            underlying: Position::underlying(),
            options: HashMap::new(),
            combos: HashMap::new(),
            summary: HoldingSummary::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_value_scales_by_multiplier() {
        let mut pos = Position::option("SPXW-20260302-C-2800-100");
        pos.quantity = 2;
        pos.mid_price = 1.5;
        assert_eq!(pos.current_value(), 300.0);
    }

    #[test]
    fn clear_fields_only_when_flat() {
        let mut pos = Position::option("SPXW-20260302-C-2800-100");
        pos.quantity = 1;
        pos.avg_cost = 10.0;
        pos.realized_pnl = 25.0;
        pos.clear_fields();
        assert_eq!(pos.avg_cost, 10.0);

        pos.quantity = 0;
        pos.clear_fields();
        assert_eq!(pos.avg_cost, 0.0);
        assert_eq!(pos.cost_value, 0.0);
        assert_eq!(pos.realized_pnl, 25.0);
    }

    #[test]
    fn underlying_defaults_to_unit_delta() {
        let pos = Position::underlying();
        assert_eq!(pos.delta, 1.0);
        assert_eq!(pos.multiplier, 1.0);
    }
}
