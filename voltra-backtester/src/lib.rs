//! Backtest composition: a single-threaded dispatcher over precomputed
//! snapshots with a strict next-bar fill model.
//!
//! The driver advances one bar at a time. For each bar it applies the
//! snapshot, settles orders queued during the previous bar against the
//! fresh BBO, and then raises the Timer event through the fixed handler
//! chain (position metrics, hedge controller, strategy hooks). Orders a
//! strategy sends on bar `t` therefore cannot fill before bar `t + 1`.

pub mod reporting;
pub mod runner;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use voltra_core::{
    CancelRequest, ContractData, Direction, Event, Intents, LogLevel, OrderData, OrderId,
    OrderRequest, OrderType, PortfolioSnapshot, Status, StrategySetting, Symbol, TradeData,
};
use voltra_data::HistoricalDataEngine;
use voltra_execution::ExecutionEngine;
use voltra_hedge::{HedgeContext, HedgeEngine};
use voltra_portfolio::Portfolio;
use voltra_position::PositionEngine;
use voltra_strategy::{HedgeDirective, StrategyCtx, StrategyEngine};

pub use reporting::{build_report, BacktestReport, ChartData, TimestepMetric};
pub use runner::{merge_metrics, run_files, DailyOutcome, RunSettings};

/// Execution-model knobs of the simulated gateway.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionModel {
    /// Per-contract fee (e.g. 0.35 per contract per fill).
    pub fee_rate: f64,
    /// Market-order slippage in basis points; never applied to limits.
    pub slippage_bps: f64,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        Self {
            fee_rate: 0.35,
            slippage_bps: 5.0,
        }
    }
}

/// Final tallies of one backtest run.
#[derive(Clone, Debug, Default)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub portfolio_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processed_timesteps: usize,
    pub total_rows: usize,
    pub total_orders: usize,
    pub final_pnl: f64,
    pub max_delta: f64,
    pub max_gamma: f64,
    pub max_theta: f64,
    pub max_drawdown: f64,
    pub cumulative_fees: f64,
    pub errors: Vec<String>,
}

type PendingQueue = Arc<Mutex<VecDeque<(OrderId, OrderRequest)>>>;

/// The engine wiring portfolio, OMS, positions, hedging, and strategies
/// behind the synchronous event dispatcher.
pub struct BacktestEngine {
    portfolio: Portfolio,
    contracts: HashMap<Symbol, ContractData>,
    snapshots: Vec<PortfolioSnapshot>,
    total_rows: usize,
    execution: ExecutionEngine,
    positions: PositionEngine,
    hedge: HedgeEngine,
    strategies: StrategyEngine,
    pending_orders: PendingQueue,
    order_counter: Arc<Mutex<u64>>,
    trade_counter: u64,
    fee_rate: f64,
    slippage_bps: f64,
    cumulative_fees: f64,
    current_time: DateTime<Utc>,
    metrics: Vec<TimestepMetric>,
    errors: Vec<String>,
}

impl BacktestEngine {
    /// Build an engine from loaded historical data.
    pub fn from_data(data: &mut HistoricalDataEngine, model: ExecutionModel) -> Result<Self> {
        if model.fee_rate < 0.0 {
            bail!("fee_rate must be >= 0");
        }
        if !data.has_data() {
            bail!("no data loaded");
        }
        let contracts = data.contracts().clone();
        let snapshots = data.snapshots().to_vec();
        let total_rows = data.meta().row_count;
        let portfolio = data
            .take_portfolio()
            .context("historical engine holds no portfolio")?;

        let pending_orders: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let order_counter = Arc::new(Mutex::new(0u64));
        let mut execution = ExecutionEngine::new();
        {
            let pending = Arc::clone(&pending_orders);
            let counter = Arc::clone(&order_counter);
            execution.set_send_impl(Box::new(move |req| {
                let mut counter = counter.lock().expect("order counter poisoned");
                *counter += 1;
                let orderid = format!("backtest_order_{}", *counter);
                pending
                    .lock()
                    .expect("pending queue poisoned")
                    .push_back((orderid.clone(), req.clone()));
                orderid
            }));
        }

        Ok(Self {
            portfolio,
            contracts,
            snapshots,
            total_rows,
            execution,
            positions: PositionEngine::new(),
            hedge: HedgeEngine::new(),
            strategies: StrategyEngine::new(),
            pending_orders,
            order_counter,
            trade_counter: 0,
            fee_rate: model.fee_rate,
            slippage_bps: model.slippage_bps.max(0.0),
            cumulative_fees: 0.0,
            current_time: Utc::now(),
            metrics: Vec::new(),
            errors: Vec::new(),
        })
    }

    /// Register the strategy `<class>_backtest` for this run.
    pub fn add_strategy(&mut self, class_name: &str, setting: &StrategySetting) -> Result<String> {
        let name = self
            .strategies
            .add_strategy(class_name, &self.portfolio.name, setting)
            .with_context(|| format!("failed to add strategy class '{class_name}'"))?;
        self.positions.get_or_create_holding(&name);
        self.execution.ensure_strategy_key(&name);
        Ok(name)
    }

    /// Register a pre-built strategy instance, bypassing the class registry.
    pub fn add_strategy_instance(
        &mut self,
        class_name: &str,
        setting: &StrategySetting,
        logic: Box<dyn voltra_strategy::Strategy>,
    ) -> String {
        let name = self
            .strategies
            .add_boxed(class_name, &self.portfolio.name, setting, logic);
        self.positions.get_or_create_holding(&name);
        self.execution.ensure_strategy_key(&name);
        name
    }

    #[must_use]
    pub fn cumulative_fees(&self) -> f64 {
        self.cumulative_fees
    }

    #[must_use]
    pub fn metrics(&self) -> &[TimestepMetric] {
        &self.metrics
    }

    #[must_use]
    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    #[must_use]
    pub fn execution(&self) -> &ExecutionEngine {
        &self.execution
    }

    #[must_use]
    pub fn positions(&self) -> &PositionEngine {
        &self.positions
    }

    /// Drive the full run: init/start the strategy, then replay every bar.
    pub fn run(&mut self) -> Result<BacktestResult> {
        let Some(strategy_name) = self.strategies.names().first().cloned() else {
            bail!("no strategy added; call add_strategy first");
        };
        if self.snapshots.is_empty() {
            bail!("no snapshots to replay");
        }

        self.current_time = self.snapshots[0].datetime;
        self.lifecycle(&strategy_name, Lifecycle::Init);
        self.lifecycle(&strategy_name, Lifecycle::Start);

        let mut max_delta = 0.0f64;
        let mut max_gamma = 0.0f64;
        let mut max_theta = 0.0f64;
        let mut peak_pnl = 0.0f64;
        let mut max_drawdown = 0.0f64;

        let snapshots = std::mem::take(&mut self.snapshots);
        for (step, snapshot) in snapshots.iter().enumerate() {
            self.current_time = snapshot.datetime;
            self.dispatch(Event::Snapshot(snapshot.clone()));
            // Orders queued on the previous bar settle against this bar's
            // freshly applied BBO, before any strategy logic runs.
            self.execute_pending_orders();
            self.dispatch(Event::Timer);

            let summary = self
                .positions
                .holding(&strategy_name)
                .map(|holding| holding.summary)
                .unwrap_or_default();
            max_delta = max_delta.max(summary.delta.abs());
            max_gamma = max_gamma.max(summary.gamma.abs());
            max_theta = max_theta.max(summary.theta.abs());
            if step == 0 {
                peak_pnl = summary.pnl;
            } else {
                peak_pnl = peak_pnl.max(summary.pnl);
            }
            max_drawdown = max_drawdown.max(peak_pnl - summary.pnl);

            self.metrics.push(TimestepMetric {
                timestep: step,
                timestamp: snapshot.datetime,
                pnl: summary.pnl,
                delta: summary.delta,
                gamma: summary.gamma,
                theta: summary.theta,
                fees: self.cumulative_fees,
            });
        }
        self.snapshots = snapshots;

        let mut errors = self.errors.clone();
        if let Some(shell) = self.strategies.get(&strategy_name) {
            if !shell.error_msg().is_empty() {
                errors.push(shell.error_msg().to_string());
            }
        }

        let final_pnl = self
            .positions
            .holding(&strategy_name)
            .map_or(0.0, |holding| holding.summary.pnl);
        info!(
            strategy = %strategy_name,
            timesteps = self.metrics.len(),
            final_pnl,
            fees = self.cumulative_fees,
            "backtest complete"
        );
        Ok(BacktestResult {
            strategy_name,
            portfolio_name: self.portfolio.name.clone(),
            start_time: self.metrics.first().map(|m| m.timestamp),
            end_time: self.metrics.last().map(|m| m.timestamp),
            processed_timesteps: self.metrics.len(),
            total_rows: self.total_rows,
            total_orders: *self.order_counter.lock().expect("order counter poisoned") as usize,
            final_pnl,
            max_delta,
            max_gamma,
            max_theta,
            max_drawdown,
            cumulative_fees: self.cumulative_fees,
            errors,
        })
    }

    /// Route one event through its fixed handler chain.
    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Snapshot(snapshot) => self.portfolio.apply_frame(&snapshot),
            Event::Timer => self.dispatch_timer(),
            Event::Order(order) => self.dispatch_order(order),
            Event::Trade(trade) => self.dispatch_trade(trade),
            Event::Contract(_) => {}
        }
    }

    /// Timer chain: position metrics, hedge controller, strategy hooks.
    fn dispatch_timer(&mut self) {
        {
            let portfolio = &self.portfolio;
            self.positions
                .process_timer_event(|name| (name == portfolio.name).then_some(portfolio));
        }

        for strategy_name in self.strategies.names() {
            let mut intents = Intents::default();
            {
                let Some(holding) = self.positions.holding(&strategy_name) else {
                    continue;
                };
                let active_orders = self.execution.strategy_active_orders(&strategy_name);
                let ctx = HedgeContext {
                    holding,
                    underlying: self.portfolio.underlying(),
                    contract: self.contracts.get(&self.portfolio.underlying_symbol),
                    active_orders: &active_orders,
                };
                self.hedge.process_hedging(&strategy_name, &ctx, &mut intents);
            }
            self.emit_intents(&strategy_name, intents);
        }

        for strategy_name in self.strategies.names() {
            let mut intents = Intents::default();
            let mut directives = Vec::new();
            {
                let Some(shell) = self.strategies.get_mut(&strategy_name) else {
                    continue;
                };
                let mut ctx = StrategyCtx {
                    strategy_name: &strategy_name,
                    portfolio: &self.portfolio,
                    holding: self.positions.holding(&strategy_name),
                    contracts: &self.contracts,
                    intents: &mut intents,
                    hedge_directives: &mut directives,
                };
                shell.on_timer(&mut ctx);
            }
            self.apply_hedge_directives(&strategy_name, directives);
            self.emit_intents(&strategy_name, intents);
        }
    }

    fn dispatch_order(&mut self, order: OrderData) {
        let owner = self
            .execution
            .strategy_name_for_order(&order.orderid)
            .map(str::to_string)
            .or_else(|| self.strategies.names().first().cloned())
            .unwrap_or_default();
        self.execution.store_order(&owner, &order);
        self.positions.process_order(&order);

        let mut intents = Intents::default();
        let mut directives = Vec::new();
        if let Some(shell) = self.strategies.get_mut(&owner) {
            let mut ctx = StrategyCtx {
                strategy_name: &owner,
                portfolio: &self.portfolio,
                holding: self.positions.holding(&owner),
                contracts: &self.contracts,
                intents: &mut intents,
                hedge_directives: &mut directives,
            };
            shell.on_order(&mut ctx, &order);
        }
        self.apply_hedge_directives(&owner, directives);
        self.emit_intents(&owner, intents);
    }

    fn dispatch_trade(&mut self, trade: TradeData) {
        self.execution.store_trade(&trade);
        let owner = self
            .execution
            .strategy_name_for_order(&trade.orderid)
            .map(str::to_string)
            .or_else(|| self.strategies.names().first().cloned())
            .unwrap_or_default();
        self.positions.process_trade(&owner, &trade);

        let mut intents = Intents::default();
        let mut directives = Vec::new();
        if let Some(shell) = self.strategies.get_mut(&owner) {
            let mut ctx = StrategyCtx {
                strategy_name: &owner,
                portfolio: &self.portfolio,
                holding: self.positions.holding(&owner),
                contracts: &self.contracts,
                intents: &mut intents,
                hedge_directives: &mut directives,
            };
            shell.on_trade(&mut ctx, &trade);
        }
        self.apply_hedge_directives(&owner, directives);
        self.emit_intents(&owner, intents);
    }

    fn apply_hedge_directives(&mut self, strategy_name: &str, directives: Vec<HedgeDirective>) {
        for directive in directives {
            match directive {
                HedgeDirective::Register(config) => {
                    self.hedge.register_strategy(strategy_name, config);
                }
                HedgeDirective::Unregister => self.hedge.unregister_strategy(strategy_name),
            }
        }
    }

    /// Re-emit collected intents through the execution engine.
    fn emit_intents(&mut self, strategy_name: &str, intents: Intents) {
        for request in intents.orders {
            let orderid = self.execution.send_order(strategy_name, &request);
            if orderid.is_empty() {
                debug!(strategy = strategy_name, symbol = %request.symbol, "order rejected");
                continue;
            }
            // Accepted orders are visible as Submitting until the next bar
            // settles them, so suppression logic sees them as active.
            let mut order = request.create_order_data(orderid);
            order.datetime = Some(self.current_time);
            self.execution.add_order(order);
        }
        for cancel in intents.cancels {
            self.cancel_order(&cancel);
        }
        for log in intents.logs {
            match log.level {
                LogLevel::Debug => debug!(source = %log.source, "{}", log.message),
                LogLevel::Info => info!(source = %log.source, "{}", log.message),
                LogLevel::Warning => tracing::warn!(source = %log.source, "{}", log.message),
                LogLevel::Error | LogLevel::Critical => {
                    tracing::error!(source = %log.source, "{}", log.message);
                }
            }
        }
    }

    fn cancel_order(&mut self, req: &CancelRequest) {
        self.execution.remove_order_tracking(&req.orderid);
        // Pending (not yet evaluated) orders cancel by dropping them from
        // the queue; already-stored orders transition to cancelled.
        self.pending_orders
            .lock()
            .expect("pending queue poisoned")
            .retain(|(orderid, _)| orderid != &req.orderid);
        let cancelled = self.execution.order_mut(&req.orderid).and_then(|order| {
            order.status.is_active().then(|| {
                order.status = Status::Cancelled;
                order.clone()
            })
        });
        if let Some(order) = cancelled {
            self.dispatch(Event::Order(order));
        }
    }

    fn lifecycle(&mut self, strategy_name: &str, phase: Lifecycle) {
        let mut intents = Intents::default();
        let mut directives = Vec::new();
        if let Some(shell) = self.strategies.get_mut(strategy_name) {
            let mut ctx = StrategyCtx {
                strategy_name,
                portfolio: &self.portfolio,
                holding: self.positions.holding(strategy_name),
                contracts: &self.contracts,
                intents: &mut intents,
                hedge_directives: &mut directives,
            };
            match phase {
                Lifecycle::Init => shell.on_init(&mut ctx),
                Lifecycle::Start => shell.on_start(&mut ctx),
                Lifecycle::Stop => shell.on_stop(&mut ctx),
            }
        }
        self.apply_hedge_directives(strategy_name, directives);
        self.emit_intents(strategy_name, intents);
    }

    /// BBO lookup used by the fill model.
    fn market_bid_ask(&self, symbol: &str) -> (f64, f64) {
        if let Some(option) = self.portfolio.option(symbol) {
            return (option.bid_price, option.ask_price);
        }
        if let Some(underlying) = self.portfolio.underlying() {
            if underlying.symbol == symbol {
                return (underlying.bid_price, underlying.ask_price);
            }
        }
        (0.0, 0.0)
    }

    /// Per-contract fee of one filled request.
    fn calculate_order_fee(&self, req: &OrderRequest) -> f64 {
        if self.fee_rate <= 0.0 {
            return 0.0;
        }
        let total_contracts = if req.is_combo {
            req.legs
                .iter()
                .map(|leg| (req.volume * f64::from(leg.ratio)).abs())
                .sum()
        } else {
            req.volume.abs()
        };
        total_contracts * self.fee_rate
    }

    /// Settle every order queued during the previous bar, in insertion
    /// order, against the current BBO. Orders submitted while settling
    /// (e.g. from an `on_trade` hook) stay queued for the next bar.
    pub fn execute_pending_orders(&mut self) {
        let batch: Vec<(OrderId, OrderRequest)> = self
            .pending_orders
            .lock()
            .expect("pending queue poisoned")
            .drain(..)
            .collect();
        for (orderid, req) in batch {
            self.execute_order(&req, &orderid);
        }
    }

    /// Crossing model, strict: a limit buy fills at the ask iff it reaches
    /// the ask, a limit sell at the bid iff it reaches the bid; no mid
    /// fills. Market orders take the BBO side with multiplicative slippage.
    fn execute_order(&mut self, req: &OrderRequest, orderid: &str) {
        let is_limit = req.order_type == OrderType::Limit && req.price > 0.0;
        let mut fill_price = 0.0;
        let mut filled = false;

        if req.is_combo && !req.legs.is_empty() {
            if let Some((total_bid, total_ask)) = self.combo_book(req) {
                if is_limit {
                    match req.direction {
                        Direction::Long if req.price >= total_ask && total_ask > 0.0 => {
                            fill_price = total_ask;
                            filled = true;
                        }
                        Direction::Short if req.price <= total_bid && total_bid > 0.0 => {
                            fill_price = total_bid;
                            filled = true;
                        }
                        _ => {}
                    }
                } else {
                    match req.direction {
                        Direction::Long => {
                            fill_price = total_ask;
                            filled = total_ask > 0.0;
                        }
                        Direction::Short => {
                            fill_price = total_bid;
                            filled = total_bid > 0.0;
                        }
                    }
                }
            }
        } else {
            let (bid, ask) = self.market_bid_ask(&req.symbol);
            if is_limit {
                match req.direction {
                    Direction::Long if req.price >= ask && ask > 0.0 => {
                        fill_price = ask;
                        filled = true;
                    }
                    Direction::Short if req.price <= bid && bid > 0.0 => {
                        fill_price = bid;
                        filled = true;
                    }
                    _ => {}
                }
            } else {
                match req.direction {
                    Direction::Long => {
                        fill_price = ask;
                        filled = ask > 0.0;
                    }
                    Direction::Short => {
                        fill_price = bid;
                        filled = bid > 0.0;
                    }
                }
            }
        }

        // Slippage applies to market fills only: buys degrade up, sells down.
        if filled && !is_limit && self.slippage_bps > 0.0 && fill_price > 0.0 {
            let mult = 1.0 + self.slippage_bps / 10_000.0;
            fill_price *= match req.direction {
                Direction::Long => mult,
                Direction::Short => 2.0 - mult,
            };
        }

        let mut order = req.create_order_data(orderid);
        order.datetime = Some(self.current_time);
        if filled {
            order.status = Status::AllTraded;
            order.traded = order.volume;
        } else {
            order.status = Status::NotTraded;
            order.traded = 0.0;
        }
        self.execution.add_order(order.clone());
        self.dispatch(Event::Order(order));

        if !filled {
            return;
        }

        self.trade_counter += 1;
        let trade_root = format!("backtest_trade_{}", self.trade_counter);
        self.dispatch(Event::Trade(TradeData {
            symbol: req.symbol.clone(),
            exchange: req.exchange,
            orderid: orderid.to_string(),
            tradeid: trade_root.clone(),
            direction: Some(req.direction),
            price: fill_price,
            volume: req.volume,
            datetime: Some(self.current_time),
        }));

        if req.is_combo {
            for (i, leg) in req.legs.iter().enumerate() {
                let (leg_bid, leg_ask) = self.market_bid_ask(&leg.symbol);
                let mut leg_price = match leg.direction {
                    Direction::Long => leg_ask,
                    Direction::Short => leg_bid,
                };
                if leg_price <= 0.0 {
                    leg_price = fill_price;
                }
                self.dispatch(Event::Trade(TradeData {
                    symbol: leg.symbol.clone(),
                    exchange: leg.exchange,
                    orderid: orderid.to_string(),
                    tradeid: format!("{trade_root}_leg_{i}"),
                    direction: Some(leg.direction),
                    price: leg_price,
                    volume: req.volume * f64::from(leg.ratio).abs(),
                    datetime: Some(self.current_time),
                }));
            }
        }

        let fee = self.calculate_order_fee(req);
        if fee > 0.0 {
            self.cumulative_fees += fee;
        }
    }

    /// Ratio-weighted combo book: sums of leg BBOs. `None` when any leg is
    /// missing both sides.
    fn combo_book(&self, req: &OrderRequest) -> Option<(f64, f64)> {
        let mut total_bid = 0.0;
        let mut total_ask = 0.0;
        for leg in &req.legs {
            let (bid, ask) = self.market_bid_ask(&leg.symbol);
            if bid <= 0.0 && ask <= 0.0 {
                return None;
            }
            let ratio = f64::from(leg.ratio).abs();
            total_bid += bid * ratio;
            total_ask += ask * ratio;
        }
        Some((total_bid, total_ask))
    }
}

enum Lifecycle {
    Init,
    Start,
    Stop,
}

impl BacktestEngine {
    /// Stop the strategy (fires `on_stop_logic` and settles any resulting
    /// close orders on the final BBO).
    pub fn stop(&mut self) {
        for strategy_name in self.strategies.names() {
            self.lifecycle(&strategy_name, Lifecycle::Stop);
        }
        self.execute_pending_orders();
    }
}
