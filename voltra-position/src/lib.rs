//! Position engine: applies fills to the right bucket (underlying,
//! single-leg option, or combo), keeps weighted-average cost under a
//! close-first/open-rest netting rule, and rolls per-strategy metrics up
//! into a holding summary every Timer tick.
//!
//! Nothing here propagates errors into the dispatch chain: a fill for an
//! unknown symbol simply creates its bucket, duplicate trade ids are
//! swallowed, and metric failures degrade to zeros.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use voltra_core::util::{round_half_up, STOCK_SUFFIX};
use voltra_core::{
    ComboPosition, ComboType, Direction, OrderData, OrderId, Position, StrategyHolding, Symbol,
    TradeData, TradeId,
};
use voltra_portfolio::{OptionData, Portfolio, UnderlyingData};

/// Result alias for holding checkpoint operations.
pub type PositionResult<T> = Result<T, PositionError>;

/// Failures surfaced by checkpoint encode/decode.
#[derive(Debug, Error)]
pub enum PositionError {
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),
    #[error("holding record malformed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Per-order metadata captured at `process_order` time so trades can be
/// attributed to combos after the order itself has gone terminal.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct OrderMeta {
    is_combo: bool,
    symbol: Symbol,
    combo_type: ComboType,
    leg_symbols: Vec<Symbol>,
}

/// Metric contributions of one bucket, summed into the holding totals.
#[derive(Clone, Copy, Debug, Default)]
struct BucketMetrics {
    cv: f64,
    tc: f64,
    rlz: f64,
    delta: f64,
    gamma: f64,
    theta: f64,
    vega: f64,
}

impl BucketMetrics {
    fn add(&mut self, other: &BucketMetrics) {
        self.cv += other.cv;
        self.tc += other.tc;
        self.rlz += other.rlz;
        self.delta += other.delta;
        self.gamma += other.gamma;
        self.theta += other.theta;
        self.vega += other.vega;
    }
}

/// Holdings for all strategies plus the order-meta and seen-trade indices.
#[derive(Default)]
pub struct PositionEngine {
    holdings: HashMap<String, StrategyHolding>,
    order_meta: HashMap<OrderId, OrderMeta>,
    trade_seen: HashSet<TradeId>,
}

impl PositionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture combo attribution metadata for a freshly seen order.
    pub fn process_order(&mut self, order: &OrderData) {
        let meta = OrderMeta {
            is_combo: order.is_combo,
            symbol: order.symbol.clone(),
            combo_type: order.combo_type.unwrap_or_default(),
            leg_symbols: order.legs.iter().map(|leg| leg.symbol.clone()).collect(),
        };
        self.order_meta.insert(order.orderid.clone(), meta);
    }

    /// Apply one fill to the owning strategy's holding. Duplicate trade ids
    /// are a no-op.
    pub fn process_trade(&mut self, strategy_name: &str, trade: &TradeData) {
        if !self.trade_seen.insert(trade.tradeid.clone()) {
            debug!(tradeid = %trade.tradeid, "duplicate trade ignored");
            return;
        }
        let meta = self.order_meta.get(&trade.orderid).cloned();
        let holding = self
            .holdings
            .entry(strategy_name.to_string())
            .or_default();

        if let Some(meta) = meta.filter(|meta| meta.is_combo) {
            let combo = get_or_create_combo(holding, &meta);
            if trade.symbol == meta.symbol {
                apply_combo_aggregate_change(&mut combo.base, trade);
            } else {
                let leg = get_or_create_leg(combo, &trade.symbol);
                apply_position_change(leg, trade);
            }
            return;
        }

        if trade.symbol.ends_with(STOCK_SUFFIX) {
            if holding.underlying.symbol == voltra_core::position::UNDERLYING_PLACEHOLDER {
                holding.underlying.symbol = trade.symbol.clone();
            }
            apply_position_change(&mut holding.underlying, trade);
            return;
        }

        let position = holding
            .options
            .entry(trade.symbol.clone())
            .or_insert_with(|| Position::option(trade.symbol.clone()));
        apply_position_change(position, trade);
    }

    /// Ensure a holding exists for `strategy_name`.
    pub fn get_or_create_holding(&mut self, strategy_name: &str) -> &mut StrategyHolding {
        self.holdings.entry(strategy_name.to_string()).or_default()
    }

    #[must_use]
    pub fn holding(&self, strategy_name: &str) -> Option<&StrategyHolding> {
        self.holdings.get(strategy_name)
    }

    pub fn remove_holding(&mut self, strategy_name: &str) {
        self.holdings.remove(strategy_name);
    }

    #[must_use]
    pub fn strategy_names(&self) -> Vec<String> {
        self.holdings.keys().cloned().collect()
    }

    /// Timer-tick metric refresh for every registered holding. The owning
    /// portfolio is resolved from the strategy name's `<class>_<portfolio>`
    /// convention through the provided lookup.
    pub fn process_timer_event<'a, F>(&mut self, mut get_portfolio: F)
    where
        F: FnMut(&str) -> Option<&'a Portfolio>,
    {
        let names = self.strategy_names();
        for strategy_name in names {
            let portfolio_name = strategy_name
                .split_once('_')
                .map_or(strategy_name.as_str(), |(_, rest)| rest);
            if let Some(portfolio) = get_portfolio(portfolio_name) {
                self.update_metrics(&strategy_name, portfolio);
            }
        }
    }

    /// Recompute one strategy's per-position greeks and the holding summary
    /// from the portfolio's current option state.
    pub fn update_metrics(&mut self, strategy_name: &str, portfolio: &Portfolio) {
        let Some(holding) = self.holdings.get_mut(strategy_name) else {
            return;
        };
        let mut totals = BucketMetrics::default();

        for position in holding.options.values_mut() {
            let snapshot = portfolio.option(&position.symbol);
            totals.add(&accumulate_option(position, snapshot));
        }

        if holding.underlying.quantity != 0 || holding.underlying.realized_pnl != 0.0 {
            totals.add(&accumulate_underlying(
                &mut holding.underlying,
                portfolio.underlying(),
            ));
        }

        for combo in holding.combos.values_mut() {
            totals.add(&accumulate_combo(combo, portfolio));
        }

        let unrealized = totals.cv - totals.tc;
        holding.summary.current_value = round_half_up(totals.cv, 2);
        holding.summary.total_cost = round_half_up(totals.tc, 2);
        holding.summary.unrealized_pnl = round_half_up(unrealized, 2);
        holding.summary.realized_pnl = round_half_up(totals.rlz, 2);
        holding.summary.pnl = holding.summary.unrealized_pnl + holding.summary.realized_pnl;
        holding.summary.delta = round_half_up(totals.delta, 4);
        holding.summary.gamma = round_half_up(totals.gamma, 4);
        holding.summary.theta = round_half_up(totals.theta, 4);
        holding.summary.vega = round_half_up(totals.vega, 4);

        for position in holding.options.values_mut() {
            position.clear_fields();
        }
        holding.underlying.clear_fields();
        for combo in holding.combos.values_mut() {
            combo.clear_fields();
        }
    }

    /// Encode one holding as a self-describing byte record. This is the only
    /// form in which live position state is checkpointed across restarts.
    pub fn serialize_holding(&self, strategy_name: &str) -> PositionResult<Vec<u8>> {
        let holding = self
            .holdings
            .get(strategy_name)
            .ok_or_else(|| PositionError::UnknownStrategy(strategy_name.to_string()))?;
        Ok(serde_json::to_vec(holding)?)
    }

    /// Rebuild a holding from its checkpoint record.
    pub fn load_serialized_holding(
        &mut self,
        strategy_name: &str,
        data: &[u8],
    ) -> PositionResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let holding: StrategyHolding = serde_json::from_slice(data)?;
        self.holdings.insert(strategy_name.to_string(), holding);
        Ok(())
    }
}

/// Combo symbols from different producers may carry an extra middle token;
/// `A_B_C` and `A_C` identify the same structure.
fn normalize_combo_symbol(symbol: &str) -> String {
    let Some((head, rest)) = symbol.split_once('_') else {
        return symbol.to_string();
    };
    let Some((_, tail)) = rest.split_once('_') else {
        return symbol.to_string();
    };
    format!("{head}_{tail}")
}

fn get_or_create_combo<'a>(
    holding: &'a mut StrategyHolding,
    meta: &OrderMeta,
) -> &'a mut ComboPosition {
    if holding.combos.contains_key(&meta.symbol) {
        return holding.combos.get_mut(&meta.symbol).expect("checked above");
    }
    let normalized = normalize_combo_symbol(&meta.symbol);
    let alias = holding
        .combos
        .keys()
        .find(|key| normalize_combo_symbol(key) == normalized)
        .cloned();
    if let Some(alias) = alias {
        return holding.combos.get_mut(&alias).expect("key from map");
    }
    let mut combo = ComboPosition::new(meta.symbol.clone(), meta.combo_type);
    for leg_symbol in &meta.leg_symbols {
        combo.legs.push(Position::option(leg_symbol.clone()));
    }
    holding
        .combos
        .entry(meta.symbol.clone())
        .or_insert(combo)
}

fn get_or_create_leg<'a>(combo: &'a mut ComboPosition, symbol: &str) -> &'a mut Position {
    if let Some(pos) = combo.legs.iter().position(|leg| leg.symbol == symbol) {
        return &mut combo.legs[pos];
    }
    combo.legs.push(Position::option(symbol.to_string()));
    combo.legs.last_mut().expect("just pushed")
}

/// The combo aggregate only tracks unit count and cost value; its average
/// cost is re-derived from the legs at metric time.
fn apply_combo_aggregate_change(pos: &mut Position, trade: &TradeData) {
    let qty = trade.volume.abs() as i64;
    let signed = match trade.direction {
        Some(Direction::Short) => -qty,
        _ => qty,
    };
    pos.quantity += signed;
    pos.cost_value = round_half_up(
        pos.avg_cost * pos.quantity.unsigned_abs() as f64 * pos.multiplier,
        2,
    );
}

/// Weighted-average netting with close-first/open-rest semantics.
pub fn apply_position_change(pos: &mut Position, trade: &TradeData) {
    let qty = trade.volume.abs() as i64;
    let signed = match trade.direction {
        Some(Direction::Short) => -qty,
        _ => qty,
    };
    let prev = pos.quantity;
    let multiplier = pos.multiplier;

    // Same direction (or opening from flat): extend at the weighted mean.
    if prev == 0 || (prev > 0) == (signed > 0) {
        let total = prev.unsigned_abs() + qty.unsigned_abs();
        pos.avg_cost = if prev == 0 {
            round_half_up(trade.price, 2)
        } else {
            round_half_up(
                (pos.avg_cost * prev.unsigned_abs() as f64 + trade.price * qty as f64)
                    / total as f64,
                2,
            )
        };
        pos.quantity += signed;
        pos.cost_value = round_half_up(
            pos.avg_cost * pos.quantity.unsigned_abs() as f64 * multiplier,
            2,
        );
        return;
    }

    // Opposite direction: close at avg cost first.
    let close_qty = prev.unsigned_abs().min(qty.unsigned_abs()) as i64;
    let pnl = if prev > 0 {
        (trade.price - pos.avg_cost) * close_qty as f64
    } else {
        (pos.avg_cost - trade.price) * close_qty as f64
    };
    pos.realized_pnl += round_half_up(pnl * multiplier, 2);

    let remaining = prev.unsigned_abs() as i64 - close_qty;
    if remaining == 0 {
        pos.quantity = 0;
        pos.avg_cost = 0.0;
        pos.cost_value = 0.0;
    } else {
        pos.quantity = if prev > 0 { remaining } else { -remaining };
        pos.cost_value = round_half_up(
            pos.avg_cost * pos.quantity.unsigned_abs() as f64 * multiplier,
            2,
        );
    }

    // Residual volume opens the opposite direction at the fill price.
    let extra = qty - close_qty;
    if extra > 0 {
        pos.avg_cost = round_half_up(trade.price, 2);
        pos.quantity = if signed > 0 { extra } else { -extra };
        pos.cost_value = round_half_up(
            pos.avg_cost * pos.quantity.unsigned_abs() as f64 * multiplier,
            2,
        );
    }
}

fn accumulate_option(pos: &mut Position, snapshot: Option<&OptionData>) -> BucketMetrics {
    let (delta, gamma, theta, vega, mid_price) = snapshot.map_or(
        (0.0, 0.0, 0.0, 0.0, 0.0),
        |opt| (opt.delta, opt.gamma, opt.theta, opt.vega, opt.mid_price),
    );
    pos.delta = round_half_up(delta, 4);
    pos.gamma = round_half_up(gamma, 4);
    pos.theta = round_half_up(theta, 4);
    pos.vega = round_half_up(vega, 4);
    pos.mid_price = round_half_up(mid_price, 2);
    bucket_of(pos)
}

fn accumulate_underlying(pos: &mut Position, snapshot: Option<&UnderlyingData>) -> BucketMetrics {
    let (delta, mid_price) =
        snapshot.map_or((1.0, 0.0), |und| (und.theo_delta, und.mid_price));
    pos.delta = round_half_up(delta, 4);
    pos.mid_price = round_half_up(mid_price, 2);
    bucket_of(pos)
}

fn bucket_of(pos: &Position) -> BucketMetrics {
    let quantity = pos.quantity as f64;
    BucketMetrics {
        cv: round_half_up(pos.current_value(), 2),
        tc: round_half_up(pos.cost_value, 2),
        rlz: round_half_up(pos.realized_pnl, 2),
        delta: round_half_up(quantity * pos.delta, 4),
        gamma: round_half_up(quantity * pos.gamma, 4),
        theta: round_half_up(quantity * pos.theta, 4),
        vega: round_half_up(quantity * pos.vega, 4),
    }
}

/// Combo greeks, cost, and realized PnL are sums of the leg contributions;
/// the aggregate's mid and average cost are re-derived from those sums.
fn accumulate_combo(combo: &mut ComboPosition, portfolio: &Portfolio) -> BucketMetrics {
    combo.base.delta = 0.0;
    combo.base.gamma = 0.0;
    combo.base.theta = 0.0;
    combo.base.vega = 0.0;
    combo.base.cost_value = 0.0;
    combo.base.realized_pnl = 0.0;
    let mut current_value = 0.0;

    for leg in &mut combo.legs {
        let snapshot = portfolio.option(&leg.symbol);
        let metrics = accumulate_option(leg, snapshot);
        current_value += metrics.cv;
        combo.base.cost_value += metrics.tc;
        combo.base.realized_pnl += metrics.rlz;
        combo.base.delta += metrics.delta;
        combo.base.gamma += metrics.gamma;
        combo.base.theta += metrics.theta;
        combo.base.vega += metrics.vega;
    }

    if combo.base.quantity != 0 {
        let unit = combo.base.quantity.unsigned_abs() as f64 * combo.base.multiplier;
        combo.base.mid_price = round_half_up(current_value / unit, 2);
        if combo.base.cost_value > 0.0 {
            combo.base.avg_cost = round_half_up(combo.base.cost_value / unit, 2);
        }
    }

    BucketMetrics {
        cv: round_half_up(current_value, 2),
        tc: round_half_up(combo.base.cost_value, 2),
        rlz: round_half_up(combo.base.realized_pnl, 2),
        delta: round_half_up(combo.base.delta, 4),
        gamma: round_half_up(combo.base.gamma, 4),
        theta: round_half_up(combo.base.theta, 4),
        vega: round_half_up(combo.base.vega, 4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltra_core::{Exchange, Leg, OrderRequest, OrderType};

    fn trade(tradeid: &str, symbol: &str, direction: Direction, price: f64, volume: f64) -> TradeData {
        TradeData {
            symbol: symbol.into(),
            exchange: Exchange::Local,
            orderid: "oid-1".into(),
            tradeid: tradeid.into(),
            direction: Some(direction),
            price,
            volume,
            datetime: None,
        }
    }

    #[test]
    fn open_extend_close_flip_arithmetic() {
        let mut pos = Position::option("SPXW-20260302-C-2800-100");
        let symbol = pos.symbol.clone();
        apply_position_change(&mut pos, &trade("t1", &symbol, Direction::Long, 10.0, 2.0));
        assert_eq!(pos.quantity, 2);
        assert_eq!(pos.avg_cost, 10.0);
        assert_eq!(pos.cost_value, 2000.0);

        apply_position_change(&mut pos, &trade("t2", &symbol, Direction::Long, 11.0, 2.0));
        assert_eq!(pos.quantity, 4);
        assert_eq!(pos.avg_cost, 10.5);
        assert_eq!(pos.cost_value, 4200.0);

        // Close 3 at 12: realized (12 - 10.5) * 3 * 100.
        apply_position_change(&mut pos, &trade("t3", &symbol, Direction::Short, 12.0, 3.0));
        assert_eq!(pos.quantity, 1);
        assert_eq!(pos.realized_pnl, 450.0);
        assert_eq!(pos.cost_value, 1050.0);

        // Close the rest and flip short 2 at 9.
        apply_position_change(&mut pos, &trade("t4", &symbol, Direction::Short, 9.0, 3.0));
        assert_eq!(pos.quantity, -2);
        assert_eq!(pos.avg_cost, 9.0);
        assert_eq!(pos.realized_pnl, 450.0 + (9.0 - 10.5) * 100.0);
        assert_eq!(pos.cost_value, 1800.0);
    }

    #[test]
    fn cost_value_invariant_holds_after_every_change() {
        let mut pos = Position::option("SPXW-20260302-P-2800-100");
        let symbol = pos.symbol.clone();
        let fills = [
            (Direction::Long, 7.95, 3.0),
            (Direction::Short, 8.22, 1.0),
            (Direction::Long, 8.01, 2.0),
            (Direction::Short, 7.5, 6.0),
            (Direction::Long, 7.77, 2.0),
        ];
        for (i, (direction, price, volume)) in fills.into_iter().enumerate() {
            apply_position_change(
                &mut pos,
                &trade(&format!("t{i}"), &symbol, direction, price, volume),
            );
            let expected = round_half_up(
                pos.avg_cost * pos.quantity.unsigned_abs() as f64 * pos.multiplier,
                2,
            );
            assert_eq!(pos.cost_value, expected, "after fill {i}");
        }
    }

    #[test]
    fn realized_pnl_matches_sum_of_closings() {
        let mut pos = Position::option("SPXW-20260302-C-2800-100");
        let symbol = pos.symbol.clone();
        apply_position_change(&mut pos, &trade("t1", &symbol, Direction::Long, 10.0, 5.0));
        let mut expected = 0.0;
        // Close in three slices at different prices.
        for (i, (price, volume)) in [(10.4, 2.0), (9.8, 2.0), (10.1, 1.0)].iter().enumerate() {
            let avg_before = pos.avg_cost;
            apply_position_change(
                &mut pos,
                &trade(&format!("c{i}"), &symbol, Direction::Short, *price, *volume),
            );
            expected += round_half_up((price - avg_before) * volume * 100.0, 2);
        }
        assert!((pos.realized_pnl - expected).abs() < 1e-6 * pos.multiplier);
        assert_eq!(pos.quantity, 0);
    }

    #[test]
    fn duplicate_trades_are_ignored() {
        let mut engine = PositionEngine::new();
        let fill = trade("dup", "SPXW-20260302-C-2800-100", Direction::Long, 10.0, 1.0);
        engine.process_trade("demo_backtest", &fill);
        engine.process_trade("demo_backtest", &fill);
        let holding = engine.holding("demo_backtest").unwrap();
        assert_eq!(holding.options[&fill.symbol].quantity, 1);
    }

    #[test]
    fn stock_suffix_routes_to_underlying() {
        let mut engine = PositionEngine::new();
        let fill = trade("u1", "SPXW.STK", Direction::Short, 4500.0, 57.0);
        engine.process_trade("demo_backtest", &fill);
        let holding = engine.holding("demo_backtest").unwrap();
        assert_eq!(holding.underlying.quantity, -57);
        assert_eq!(holding.underlying.symbol, "SPXW.STK");
        assert!(holding.options.is_empty());
    }

    fn combo_order(orderid: &str, combo_symbol: &str, legs: &[&str]) -> OrderData {
        let mut order = OrderRequest {
            symbol: combo_symbol.into(),
            exchange: Exchange::Smart,
            direction: Direction::Long,
            order_type: OrderType::Market,
            volume: 1.0,
            price: 0.0,
            reference: "Strategy_demo".into(),
            is_combo: true,
            legs: legs
                .iter()
                .map(|symbol| Leg {
                    symbol: (*symbol).into(),
                    exchange: Exchange::Smart,
                    ratio: 1,
                    direction: Direction::Long,
                    price: None,
                })
                .collect(),
            combo_type: Some(ComboType::Straddle),
        }
        .create_order_data(orderid);
        order.datetime = None;
        order
    }

    #[test]
    fn combo_trades_split_aggregate_and_legs() {
        let mut engine = PositionEngine::new();
        let call = "SPXW-20260302-C-2800-100";
        let put = "SPXW-20260302-P-2800-100";
        let combo_symbol = "combo_20260302C2800-20260302P2800";
        engine.process_order(&combo_order("oid-1", combo_symbol, &[call, put]));

        let aggregate = trade("agg", combo_symbol, Direction::Long, 18.2, 1.0);
        engine.process_trade("demo_backtest", &aggregate);
        let call_fill = trade("agg_leg_0", call, Direction::Long, 10.1, 1.0);
        let put_fill = trade("agg_leg_1", put, Direction::Long, 8.1, 1.0);
        engine.process_trade("demo_backtest", &call_fill);
        engine.process_trade("demo_backtest", &put_fill);

        let holding = engine.holding("demo_backtest").unwrap();
        let combo = &holding.combos[combo_symbol];
        assert_eq!(combo.base.quantity, 1);
        assert_eq!(combo.legs.len(), 2);
        assert_eq!(combo.legs[0].avg_cost, 10.1);
        assert_eq!(combo.legs[1].avg_cost, 8.1);
        assert!(holding.options.is_empty());
    }

    #[test]
    fn combo_symbol_normalization_merges_aliases() {
        assert_eq!(normalize_combo_symbol("A_B_C"), "A_C");
        assert_eq!(normalize_combo_symbol("A_C"), "A_C");

        let mut engine = PositionEngine::new();
        let leg = "SPXW-20260302-C-2800-100";
        engine.process_order(&combo_order("oid-1", "combo_x_sig", &[leg]));
        engine.process_trade(
            "demo_backtest",
            &trade("t1", "combo_x_sig", Direction::Long, 5.0, 1.0),
        );
        // Alternate encoding of the same aggregate resolves to one combo.
        engine.process_order(&combo_order("oid-2", "combo_sig", &[leg]));
        let mut second = trade("t2", "combo_sig", Direction::Long, 5.0, 1.0);
        second.orderid = "oid-2".into();
        engine.process_trade("demo_backtest", &second);

        let holding = engine.holding("demo_backtest").unwrap();
        assert_eq!(holding.combos.len(), 1);
        assert_eq!(holding.combos["combo_x_sig"].base.quantity, 2);
    }

    #[test]
    fn holding_checkpoint_round_trips() {
        let mut engine = PositionEngine::new();
        let call = "SPXW-20260302-C-2800-100";
        engine.process_order(&combo_order("oid-1", "combo_sig", &[call]));
        engine.process_trade(
            "demo_backtest",
            &trade("t1", "combo_sig", Direction::Long, 18.2, 1.0),
        );
        engine.process_trade(
            "demo_backtest",
            &trade("t1_leg_0", call, Direction::Long, 10.1, 1.0),
        );
        engine.process_trade(
            "demo_backtest",
            &trade("t2", "SPXW.STK", Direction::Short, 4500.0, 10.0),
        );

        let record = engine.serialize_holding("demo_backtest").unwrap();
        let mut restored = PositionEngine::new();
        restored
            .load_serialized_holding("demo_backtest", &record)
            .unwrap();
        assert_eq!(
            restored.holding("demo_backtest").unwrap(),
            engine.holding("demo_backtest").unwrap()
        );
    }

    #[test]
    fn serialize_unknown_strategy_errors() {
        let engine = PositionEngine::new();
        assert!(engine.serialize_holding("ghost").is_err());
    }
}
