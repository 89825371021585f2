//! Delta-hedging controller.
//!
//! For each registered strategy the controller drives the summed delta of
//! its holdings back into the configured band by emitting market orders in
//! the underlying. Hedge orders are tagged with `Hedge_<strategy>`; while
//! any such order remains active the controller emits cancels for them and
//! nothing else, so at most one hedge sequence is ever outstanding.

use std::collections::HashMap;

use voltra_core::{
    ContractData, Direction, Intents, LogLevel, LogRecord, OrderData, OrderRequest, OrderType,
    StrategyHolding, Symbol,
};
use voltra_portfolio::UnderlyingData;

const APP_NAME: &str = "Hedge";

/// Per-strategy hedging parameters. `timer_trigger` is advisory; the
/// dispatcher currently runs hedging on every Timer event.
#[derive(Clone, Copy, Debug)]
pub struct HedgeConfig {
    pub timer_trigger: i64,
    pub delta_target: f64,
    pub delta_range: f64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            timer_trigger: 5,
            delta_target: 0.0,
            delta_range: 0.0,
        }
    }
}

/// Read-only view the controller needs for one strategy on one tick.
pub struct HedgeContext<'a> {
    pub holding: &'a StrategyHolding,
    pub underlying: Option<&'a UnderlyingData>,
    /// Contract of the underlying, required for routing.
    pub contract: Option<&'a ContractData>,
    /// The strategy's currently active orders.
    pub active_orders: &'a [OrderData],
}

/// A computed hedge: `available` is the closable share count opposite the
/// hedge direction, `order_volume` the total size to trade.
#[derive(Clone, Debug, PartialEq)]
pub struct HedgePlan {
    pub symbol: Symbol,
    pub direction: Direction,
    pub available: f64,
    pub order_volume: f64,
}

/// Registry of hedged strategies and the per-tick driver.
#[derive(Default)]
pub struct HedgeEngine {
    registered: HashMap<String, HedgeConfig>,
}

impl HedgeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_strategy(&mut self, strategy_name: &str, config: HedgeConfig) {
        self.registered.insert(strategy_name.to_string(), config);
    }

    pub fn unregister_strategy(&mut self, strategy_name: &str) {
        self.registered.remove(strategy_name);
    }

    #[must_use]
    pub fn is_registered(&self, strategy_name: &str) -> bool {
        self.registered.contains_key(strategy_name)
    }

    /// Run one hedging pass for `strategy_name`, appending order/cancel/log
    /// intents. Unregistered strategies are skipped.
    pub fn process_hedging(&self, strategy_name: &str, ctx: &HedgeContext<'_>, out: &mut Intents) {
        let Some(config) = self.registered.get(strategy_name) else {
            return;
        };
        if !hedge_orders_finished(ctx.active_orders) {
            cancel_hedge_orders(ctx.active_orders, out);
            return;
        }
        let Some(plan) = compute_hedge_plan(config, ctx) else {
            return;
        };
        execute_hedge_orders(strategy_name, &plan, ctx, out);
    }
}

/// True when no active order of the strategy is a hedge order.
fn hedge_orders_finished(active_orders: &[OrderData]) -> bool {
    !active_orders
        .iter()
        .any(|order| order.reference.contains(APP_NAME))
}

fn cancel_hedge_orders(active_orders: &[OrderData], out: &mut Intents) {
    for order in active_orders {
        if order.reference.contains(APP_NAME) {
            out.cancels.push(order.create_cancel_request());
        }
    }
}

/// Plan the hedge trade, or `None` when delta sits inside the band, the
/// rounded volume is below one share, or the underlying is not routable.
fn compute_hedge_plan(config: &HedgeConfig, ctx: &HedgeContext<'_>) -> Option<HedgePlan> {
    let underlying = ctx.underlying?;
    let contract = ctx.contract?;

    let total_delta = ctx.holding.summary.delta;
    let delta_min = config.delta_target - config.delta_range;
    let delta_max = config.delta_target + config.delta_range;
    if (delta_min..=delta_max).contains(&total_delta) {
        return None;
    }

    let delta_to_hedge = config.delta_target - total_delta;
    let theo_delta = if underlying.theo_delta != 0.0 {
        underlying.theo_delta
    } else {
        1.0
    };
    let hedge_volume = delta_to_hedge / theo_delta;
    if hedge_volume.abs() < 1.0 {
        return None;
    }

    let quantity = ctx.holding.underlying.quantity;
    let (direction, available) = if hedge_volume > 0.0 {
        (
            Direction::Long,
            if quantity < 0 {
                quantity.unsigned_abs() as f64
            } else {
                0.0
            },
        )
    } else {
        (
            Direction::Short,
            if quantity > 0 { quantity as f64 } else { 0.0 },
        )
    };

    Some(HedgePlan {
        symbol: contract.symbol.clone(),
        direction,
        available,
        order_volume: hedge_volume.abs(),
    })
}

/// Submit up to two market orders: the closable slice first, the fresh open
/// for the remainder.
fn execute_hedge_orders(
    strategy_name: &str,
    plan: &HedgePlan,
    ctx: &HedgeContext<'_>,
    out: &mut Intents,
) {
    let mut remaining = plan.order_volume;
    if plan.available > 0.0 {
        let close_volume = plan.available.min(plan.order_volume);
        submit_hedge_order(strategy_name, plan, close_volume, ctx, out);
        remaining -= close_volume;
    }
    if remaining > 0.0 {
        submit_hedge_order(strategy_name, plan, remaining, ctx, out);
    }
}

fn submit_hedge_order(
    strategy_name: &str,
    plan: &HedgePlan,
    volume: f64,
    ctx: &HedgeContext<'_>,
    out: &mut Intents,
) {
    let Some(contract) = ctx.contract else {
        return;
    };
    out.orders.push(OrderRequest {
        symbol: contract.symbol.clone(),
        exchange: contract.exchange,
        direction: plan.direction,
        order_type: OrderType::Market,
        volume,
        price: 0.0,
        reference: format!("{APP_NAME}_{strategy_name}"),
        is_combo: false,
        legs: Vec::new(),
        combo_type: None,
    });
    out.logs.push(LogRecord::new(
        APP_NAME,
        LogLevel::Info,
        format!(
            "hedge order: dir={:?} vol={volume} symbol={}",
            plan.direction, plan.symbol
        ),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltra_core::{Exchange, Product, Status};

    fn underlying_contract() -> ContractData {
        ContractData {
            symbol: "SPXW".into(),
            exchange: Exchange::Local,
            name: "SPXW".into(),
            product: Product::Index,
            size: 1.0,
            pricetick: 0.01,
            min_volume: 1.0,
            ..ContractData::default()
        }
    }

    fn underlying_data() -> UnderlyingData {
        // Only theo_delta and the symbol matter to the planner.
        let mut portfolio = voltra_portfolio::Portfolio::new("t");
        portfolio.set_underlying(&underlying_contract());
        portfolio.underlying().unwrap().clone()
    }

    fn holding_with_delta(delta: f64, underlying_qty: i64) -> StrategyHolding {
        let mut holding = StrategyHolding::default();
        holding.summary.delta = delta;
        holding.underlying.quantity = underlying_qty;
        holding
    }

    fn registered_engine() -> HedgeEngine {
        let mut engine = HedgeEngine::new();
        engine.register_strategy(
            "demo_backtest",
            HedgeConfig {
                timer_trigger: 1,
                delta_target: 0.0,
                delta_range: 5.0,
            },
        );
        engine
    }

    fn run(engine: &HedgeEngine, holding: &StrategyHolding, active: &[OrderData]) -> Intents {
        let underlying = underlying_data();
        let contract = underlying_contract();
        let ctx = HedgeContext {
            holding,
            underlying: Some(&underlying),
            contract: Some(&contract),
            active_orders: active,
        };
        let mut out = Intents::default();
        engine.process_hedging("demo_backtest", &ctx, &mut out);
        out
    }

    #[test]
    fn in_band_delta_emits_nothing() {
        let engine = registered_engine();
        let out = run(&engine, &holding_with_delta(3.0, 0), &[]);
        assert!(out.orders.is_empty() && out.cancels.is_empty());
    }

    #[test]
    fn positive_delta_emits_single_short() {
        let engine = registered_engine();
        let out = run(&engine, &holding_with_delta(57.0, 0), &[]);
        assert_eq!(out.orders.len(), 1);
        let order = &out.orders[0];
        assert_eq!(order.direction, Direction::Short);
        assert_eq!(order.volume, 57.0);
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.reference, "Hedge_demo_backtest");
    }

    #[test]
    fn opposite_position_splits_close_then_open() {
        let engine = registered_engine();
        // Long 20 shares held while the hedge direction is short: the first
        // order closes the 20, the second opens the remaining 37.
        let out = run(&engine, &holding_with_delta(57.0, 20), &[]);
        assert_eq!(out.orders.len(), 2);
        assert_eq!(out.orders[0].volume, 20.0);
        assert_eq!(out.orders[1].volume, 37.0);
        assert!(out
            .orders
            .iter()
            .all(|order| order.direction == Direction::Short));
    }

    #[test]
    fn outstanding_hedge_order_suppresses_and_cancels() {
        let engine = registered_engine();
        let mut active = OrderRequest {
            symbol: "SPXW".into(),
            exchange: Exchange::Local,
            direction: Direction::Short,
            order_type: OrderType::Market,
            volume: 57.0,
            price: 0.0,
            reference: "Hedge_demo_backtest".into(),
            is_combo: false,
            legs: Vec::new(),
            combo_type: None,
        }
        .create_order_data("oid-1");
        active.status = Status::NotTraded;
        let out = run(&engine, &holding_with_delta(57.0, 0), &[active]);
        assert!(out.orders.is_empty());
        assert_eq!(out.cancels.len(), 1);
        assert_eq!(out.cancels[0].orderid, "oid-1");
    }

    #[test]
    fn sub_share_volume_is_skipped() {
        let engine = registered_engine();
        let out = run(&engine, &holding_with_delta(5.5, 0), &[]);
        assert!(out.orders.is_empty());
    }

    #[test]
    fn unregistered_strategy_is_ignored() {
        let engine = HedgeEngine::new();
        let out = run(&engine, &holding_with_delta(57.0, 0), &[]);
        assert!(out.is_empty());
    }
}
