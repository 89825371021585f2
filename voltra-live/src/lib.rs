//! Live trading composition: the event-driven runtime behind a broker
//! gateway and an external market-data feed.
//!
//! Two threads belong to the runtime: the event worker draining the queue
//! (the only thread that mutates portfolios, positions, and strategy
//! holdings) and the periodic timer. The gateway's API thread and the
//! market-data poller are external producers that enqueue events through
//! [`event::EventSender`]. The whole mutable core sits behind one mutex
//! shared by the worker and the control surface.

pub mod control;
pub mod event;
pub mod gateway;
pub mod marketdata;
pub mod persistence;
pub mod ring;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use voltra_core::{
    ContractData, Event, Intents, LogLevel, LogRecord, OrderData, Symbol, TradeData,
};
use voltra_execution::ExecutionEngine;
use voltra_hedge::{HedgeContext, HedgeEngine};
use voltra_portfolio::Portfolio;
use voltra_position::PositionEngine;
use voltra_strategy::{HedgeDirective, StrategyCtx, StrategyEngine, StrategyShell};

use control::{parse_setting_json, ControlRequest, ControlResponse, StrategyUpdate};
use event::{EventEngine, EventSender};
use gateway::Gateway;
use marketdata::MarketDataEngine;
use persistence::TradingRepository;
use ring::RingBuffer;

/// Timer ticks of disconnection tolerated before reconnect attempts begin.
const RECONNECT_AFTER_TICKS: u64 = 10;

/// Runtime configuration.
#[derive(Clone, Copy, Debug)]
pub struct LiveConfig {
    pub timer_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            timer_interval: Duration::from_secs(1),
        }
    }
}

/// All mutable engine state; dispatched into by the event worker and the
/// control surface under one lock.
pub struct LiveCore {
    portfolios: HashMap<String, Portfolio>,
    contracts: HashMap<Symbol, ContractData>,
    execution: ExecutionEngine,
    positions: PositionEngine,
    hedge: HedgeEngine,
    strategies: StrategyEngine,
    market_data: MarketDataEngine,
    gateway: Option<Box<dyn Gateway>>,
    repository: Option<Box<dyn TradingRepository>>,
    logs: Arc<RingBuffer<LogRecord>>,
    updates: Arc<RingBuffer<StrategyUpdate>>,
    disconnected_ticks: u64,
}

impl Default for LiveCore {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveCore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            portfolios: HashMap::new(),
            contracts: HashMap::new(),
            execution: ExecutionEngine::new(),
            positions: PositionEngine::new(),
            hedge: HedgeEngine::new(),
            strategies: StrategyEngine::new(),
            market_data: MarketDataEngine::new(),
            gateway: None,
            repository: None,
            logs: Arc::new(RingBuffer::default()),
            updates: Arc::new(RingBuffer::default()),
            disconnected_ticks: 0,
        }
    }

    /// Route one event through its fixed handler chain.
    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Timer => self.dispatch_timer(),
            Event::Snapshot(snapshot) => {
                if let Some(portfolio) = self.portfolios.get_mut(&snapshot.portfolio_name) {
                    portfolio.apply_frame(&snapshot);
                } else {
                    warn!(portfolio = %snapshot.portfolio_name, "snapshot for unknown portfolio");
                }
            }
            Event::Order(order) => self.dispatch_order(order),
            Event::Trade(trade) => self.dispatch_trade(trade),
            Event::Contract(contract) => self.dispatch_contract(&contract),
        }
    }

    /// Timer chain: gateway tick, position metric rollup, hedging for every
    /// strategy, then the strategies themselves.
    fn dispatch_timer(&mut self) {
        if let Some(gateway) = &mut self.gateway {
            gateway.process_timer();
            if gateway.is_connected() {
                self.disconnected_ticks = 0;
            } else {
                self.disconnected_ticks += 1;
                if self.disconnected_ticks >= RECONNECT_AFTER_TICKS {
                    info!(gateway = gateway.name(), "attempting gateway reconnect");
                    if let Err(err) = gateway.connect() {
                        error!(gateway = gateway.name(), error = %err, "reconnect failed");
                    }
                }
            }
        }

        {
            let portfolios = &self.portfolios;
            self.positions
                .process_timer_event(|name| portfolios.get(name));
        }

        for strategy_name in self.strategies.names() {
            let mut intents = Intents::default();
            {
                let Some(shell) = self.strategies.get(&strategy_name) else {
                    continue;
                };
                let Some(portfolio) = self.portfolios.get(shell.portfolio_name()) else {
                    continue;
                };
                let Some(holding) = self.positions.holding(&strategy_name) else {
                    continue;
                };
                let active_orders = self.execution.strategy_active_orders(&strategy_name);
                let ctx = HedgeContext {
                    holding,
                    underlying: portfolio.underlying(),
                    contract: self.contracts.get(&portfolio.underlying_symbol),
                    active_orders: &active_orders,
                };
                self.hedge
                    .process_hedging(&strategy_name, &ctx, &mut intents);
            }
            self.emit_intents(&strategy_name, intents);
        }

        for strategy_name in self.strategies.names() {
            let (intents, directives) =
                self.with_strategy_ctx(&strategy_name, |shell, ctx| shell.on_timer(ctx));
            self.apply_hedge_directives(&strategy_name, directives);
            self.emit_intents(&strategy_name, intents);
        }
    }

    fn dispatch_order(&mut self, order: OrderData) {
        let owner = self
            .execution
            .strategy_name_for_order(&order.orderid)
            .map(str::to_string)
            .unwrap_or_default();
        self.execution.store_order(&owner, &order);
        if !owner.is_empty() {
            if let Some(repository) = &self.repository {
                if let Err(err) = repository.save_order(&owner, &order) {
                    error!(orderid = %order.orderid, error = %err, "order persist failed");
                }
            }
        }
        self.positions.process_order(&order);
        if !owner.is_empty() {
            let (intents, directives) =
                self.with_strategy_ctx(&owner, |shell, ctx| shell.on_order(ctx, &order));
            self.apply_hedge_directives(&owner, directives);
            self.emit_intents(&owner, intents);
        }
    }

    fn dispatch_trade(&mut self, trade: TradeData) {
        self.execution.store_trade(&trade);
        let owner = self
            .execution
            .strategy_name_for_order(&trade.orderid)
            .map(str::to_string)
            .unwrap_or_default();
        if !owner.is_empty() {
            if let Some(repository) = &self.repository {
                if let Err(err) = repository.save_trade(&owner, &trade) {
                    error!(tradeid = %trade.tradeid, error = %err, "trade persist failed");
                }
            }
        }
        self.positions.process_trade(&owner, &trade);
        if !owner.is_empty() {
            let (intents, directives) =
                self.with_strategy_ctx(&owner, |shell, ctx| shell.on_trade(ctx, &trade));
            self.apply_hedge_directives(&owner, directives);
            self.emit_intents(&owner, intents);
        }
    }

    /// Register a contract and wire it into its portfolio's chains. Options
    /// land in the portfolio named after their underlying; non-options
    /// become that portfolio's underlying.
    fn dispatch_contract(&mut self, contract: &ContractData) {
        self.contracts
            .insert(contract.symbol.clone(), contract.clone());
        if let Some(repository) = &self.repository {
            if let Err(err) = repository.save_contract(contract) {
                error!(symbol = %contract.symbol, error = %err, "contract persist failed");
            }
        }
        let portfolio_name = contract
            .option_underlying
            .clone()
            .unwrap_or_else(|| {
                contract
                    .symbol
                    .split(['-', '.'])
                    .next()
                    .unwrap_or(contract.symbol.as_str())
                    .to_string()
            });
        let portfolio = self
            .portfolios
            .entry(portfolio_name.clone())
            .or_insert_with(|| Portfolio::new(portfolio_name));
        if contract.is_option() {
            portfolio.add_option(contract);
            portfolio.finalize_chains();
        } else {
            portfolio.set_underlying(contract);
        }
    }

    /// Run one shell hook with a fully wired context; returns the intents
    /// and hedge directives it produced.
    fn with_strategy_ctx<F>(&mut self, strategy_name: &str, hook: F) -> (Intents, Vec<HedgeDirective>)
    where
        F: FnOnce(&mut StrategyShell, &mut StrategyCtx<'_>),
    {
        let mut intents = Intents::default();
        let mut directives = Vec::new();
        let Some(portfolio_name) = self
            .strategies
            .get(strategy_name)
            .map(|shell| shell.portfolio_name().to_string())
        else {
            return (intents, directives);
        };
        let Some(portfolio) = self.portfolios.get(&portfolio_name) else {
            return (intents, directives);
        };
        let holding = self.positions.holding(strategy_name);
        if let Some(shell) = self.strategies.get_mut(strategy_name) {
            let mut ctx = StrategyCtx {
                strategy_name,
                portfolio,
                holding,
                contracts: &self.contracts,
                intents: &mut intents,
                hedge_directives: &mut directives,
            };
            hook(shell, &mut ctx);
        }
        (intents, directives)
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

    /// Re-emit collected intents: orders and cancels through the gateway,
    /// logs into the ring buffer.
    fn emit_intents(&mut self, strategy_name: &str, intents: Intents) {
        if self.gateway.is_none() && (!intents.orders.is_empty() || !intents.cancels.is_empty()) {
            self.push_log(LogRecord::new(
                "Main",
                LogLevel::Warning,
                "order intents dropped: no gateway connected",
            ));
        }
        if let Some(mut gateway) = self.gateway.take() {
            for request in &intents.orders {
                let orderid =
                    self.execution
                        .send_order_via(strategy_name, request, &mut |req| {
                            gateway.send_order(req)
                        });
                if orderid.is_empty() {
                    debug!(strategy = strategy_name, symbol = %request.symbol, "order rejected");
                    continue;
                }
                let mut order = request.create_order_data(orderid);
                order.datetime = Some(Utc::now());
                self.execution.add_order(order);
            }
            for cancel in &intents.cancels {
                self.execution.remove_order_tracking(&cancel.orderid);
                gateway.cancel_order(cancel);
            }
            self.gateway = Some(gateway);
        }
        for log in intents.logs {
            self.push_log(log);
        }
    }

    fn push_log(&self, log: LogRecord) {
        match log.level {
            LogLevel::Debug => debug!(source = %log.source, "{}", log.message),
            LogLevel::Info => info!(source = %log.source, "{}", log.message),
            LogLevel::Warning => warn!(source = %log.source, "{}", log.message),
            LogLevel::Error | LogLevel::Critical => {
                error!(source = %log.source, "{}", log.message);
            }
        }
        self.logs.push(log);
    }

    fn push_update(&self, strategy_name: &str) {
        let (class_name, portfolio) = strategy_name
            .split_once('_')
            .map_or((strategy_name, ""), |(class, portfolio)| (class, portfolio));
        self.updates.push(StrategyUpdate {
            strategy_name: strategy_name.to_string(),
            class_name: class_name.to_string(),
            portfolio: portfolio.to_string(),
            json_payload: "{}".to_string(),
        });
    }

    // ---------------------------------------------------------------------
    // Control operations
    // ---------------------------------------------------------------------

    fn add_strategy(
        &mut self,
        class_name: &str,
        portfolio_name: &str,
        setting_json: &str,
    ) -> Result<String, String> {
        if !self.portfolios.contains_key(portfolio_name) {
            return Err(format!("portfolio not found: {portfolio_name}"));
        }
        let setting = parse_setting_json(setting_json);
        let strategy_name = self
            .strategies
            .add_strategy(class_name, portfolio_name, &setting)
            .map_err(|err| err.to_string())?;
        self.positions.get_or_create_holding(&strategy_name);
        self.execution.ensure_strategy_key(&strategy_name);
        if let Some(repository) = &self.repository {
            match repository.load_holding(&strategy_name) {
                Ok(Some(record)) => {
                    if let Err(err) = self
                        .positions
                        .load_serialized_holding(&strategy_name, &record)
                    {
                        error!(strategy = %strategy_name, error = %err, "holding restore failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(strategy = %strategy_name, error = %err, "holding load failed");
                }
            }
        }
        self.push_update(&strategy_name);
        Ok(strategy_name)
    }

    fn init_strategy(&mut self, strategy_name: &str) -> Result<(), String> {
        if self.strategies.get(strategy_name).is_none() {
            return Err(format!("strategy not found: {strategy_name}"));
        }
        let (intents, directives) =
            self.with_strategy_ctx(strategy_name, |shell, ctx| shell.on_init(ctx));
        self.apply_hedge_directives(strategy_name, directives);
        self.emit_intents(strategy_name, intents);
        let chains = self
            .strategies
            .get(strategy_name)
            .map(|shell| shell.chain_subscriptions())
            .unwrap_or_default();
        self.market_data.subscribe_chains(strategy_name, &chains);
        self.push_update(strategy_name);
        Ok(())
    }

    fn start_strategy(&mut self, strategy_name: &str) -> Result<(), String> {
        if self.strategies.get(strategy_name).is_none() {
            return Err(format!("strategy not found: {strategy_name}"));
        }
        let (intents, directives) =
            self.with_strategy_ctx(strategy_name, |shell, ctx| shell.on_start(ctx));
        self.apply_hedge_directives(strategy_name, directives);
        self.emit_intents(strategy_name, intents);
        self.push_update(strategy_name);
        Ok(())
    }

    fn stop_strategy(&mut self, strategy_name: &str) -> Result<(), String> {
        if self.strategies.get(strategy_name).is_none() {
            return Err(format!("strategy not found: {strategy_name}"));
        }
        let (intents, directives) =
            self.with_strategy_ctx(strategy_name, |shell, ctx| shell.on_stop(ctx));
        self.apply_hedge_directives(strategy_name, directives);
        self.emit_intents(strategy_name, intents);
        self.checkpoint_holding(strategy_name);
        self.push_update(strategy_name);
        Ok(())
    }

    /// Removal order matters: stop, checkpoint, drop the holding, clear
    /// order tracking, then drop the shell.
    fn remove_strategy(&mut self, strategy_name: &str) -> Result<(), String> {
        if self.strategies.get(strategy_name).is_none() {
            return Err(format!("strategy not found: {strategy_name}"));
        }
        let (intents, directives) =
            self.with_strategy_ctx(strategy_name, |shell, ctx| shell.on_stop(ctx));
        self.apply_hedge_directives(strategy_name, directives);
        self.emit_intents(strategy_name, intents);
        self.checkpoint_holding(strategy_name);
        self.positions.remove_holding(strategy_name);
        self.execution.remove_strategy_tracking(strategy_name);
        self.hedge.unregister_strategy(strategy_name);
        self.market_data.unsubscribe_chains(strategy_name);
        self.strategies.remove(strategy_name);
        self.push_update(strategy_name);
        Ok(())
    }

    fn checkpoint_holding(&mut self, strategy_name: &str) {
        let Some(repository) = &self.repository else {
            return;
        };
        match self.positions.serialize_holding(strategy_name) {
            Ok(record) => {
                if let Err(err) = repository.save_holding(strategy_name, &record) {
                    error!(strategy = %strategy_name, error = %err, "holding checkpoint failed");
                }
            }
            Err(err) => {
                error!(strategy = %strategy_name, error = %err, "holding serialize failed");
            }
        }
    }
}

/// The live runtime: core behind its mutex plus the event machinery.
pub struct LiveEngine {
    core: Arc<Mutex<LiveCore>>,
    events: EventEngine,
}

impl LiveEngine {
    #[must_use]
    pub fn new(config: LiveConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(LiveCore::new())),
            events: EventEngine::new(config.timer_interval),
        }
    }

    /// Handle used by the gateway thread and market-data poller to enqueue
    /// `Order`/`Trade`/`Contract`/`Snapshot` events.
    #[must_use]
    pub fn event_sender(&self) -> EventSender {
        self.events.sender()
    }

    /// Direct access to the core, shared with the event worker.
    #[must_use]
    pub fn core(&self) -> Arc<Mutex<LiveCore>> {
        Arc::clone(&self.core)
    }

    pub fn set_gateway(&self, gateway: Box<dyn Gateway>) {
        self.core.lock().expect("live core poisoned").gateway = Some(gateway);
    }

    /// Install persistence: purge expired options, then replay stored
    /// contracts into the portfolios.
    pub fn set_repository(&self, repository: Box<dyn TradingRepository>) {
        let contracts = {
            let purged = repository.purge_expired_options(Utc::now());
            if let Err(err) = &purged {
                error!(error = %err, "expired option purge failed");
            }
            repository.load_contracts().unwrap_or_default()
        };
        let mut core = self.core.lock().expect("live core poisoned");
        core.repository = Some(repository);
        for contract in contracts {
            core.dispatch_contract(&contract);
        }
    }

    pub fn start(&mut self) {
        self.events.start(Arc::clone(&self.core));
    }

    pub fn stop(&mut self) {
        self.events.stop();
        let mut core = self.core.lock().expect("live core poisoned");
        for strategy_name in core.strategies.names() {
            core.checkpoint_holding(&strategy_name);
        }
        if let Some(gateway) = &mut core.gateway {
            gateway.disconnect();
        }
    }

    #[must_use]
    pub fn log_stream(&self) -> Arc<RingBuffer<LogRecord>> {
        Arc::clone(&self.core.lock().expect("live core poisoned").logs)
    }

    #[must_use]
    pub fn update_stream(&self) -> Arc<RingBuffer<StrategyUpdate>> {
        Arc::clone(&self.core.lock().expect("live core poisoned").updates)
    }

    /// The coarse control surface exposed to the RPC transport.
    pub fn handle_control(&self, request: ControlRequest) -> ControlResponse {
        let mut core = self.core.lock().expect("live core poisoned");
        match request {
            ControlRequest::ConnectGateway => match &mut core.gateway {
                Some(gateway) => match gateway.connect() {
                    Ok(()) => ControlResponse::Ok,
                    Err(err) => ControlResponse::error(format!("{err:#}")),
                },
                None => ControlResponse::error("no gateway installed"),
            },
            ControlRequest::DisconnectGateway => {
                if let Some(gateway) = &mut core.gateway {
                    gateway.disconnect();
                }
                ControlResponse::Ok
            }
            ControlRequest::StartMarketData => {
                core.market_data.start();
                ControlResponse::Ok
            }
            ControlRequest::StopMarketData => {
                core.market_data.stop();
                ControlResponse::Ok
            }
            ControlRequest::AddStrategy {
                class_name,
                portfolio_name,
                setting_json,
            } => match core.add_strategy(&class_name, &portfolio_name, &setting_json) {
                Ok(strategy_name) => ControlResponse::StrategyName { strategy_name },
                Err(message) => ControlResponse::error(message),
            },
            ControlRequest::InitStrategy { strategy_name } => {
                result_response(core.init_strategy(&strategy_name))
            }
            ControlRequest::StartStrategy { strategy_name } => {
                result_response(core.start_strategy(&strategy_name))
            }
            ControlRequest::StopStrategy { strategy_name } => {
                result_response(core.stop_strategy(&strategy_name))
            }
            ControlRequest::RemoveStrategy { strategy_name } => {
                result_response(core.remove_strategy(&strategy_name))
            }
            ControlRequest::ListPortfolios => {
                let mut names: Vec<String> = core.portfolios.keys().cloned().collect();
                names.sort();
                ControlResponse::Names { names }
            }
            ControlRequest::ListStrategyClasses => ControlResponse::Names {
                names: voltra_strategy::strategy_class_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            },
            ControlRequest::ListStrategies => ControlResponse::Names {
                names: core.strategies.names(),
            },
            ControlRequest::HistoricalOrders { strategy_name } => match &core.repository {
                Some(repository) => match repository.load_orders(&strategy_name) {
                    Ok(orders) => ControlResponse::Orders { orders },
                    Err(err) => ControlResponse::error(err.to_string()),
                },
                None => ControlResponse::error("no repository installed"),
            },
            ControlRequest::HistoricalTrades { strategy_name } => match &core.repository {
                Some(repository) => match repository.load_trades(&strategy_name) {
                    Ok(trades) => ControlResponse::Trades { trades },
                    Err(err) => ControlResponse::error(err.to_string()),
                },
                None => ControlResponse::error("no repository installed"),
            },
        }
    }
}

fn result_response(result: Result<(), String>) -> ControlResponse {
    match result {
        Ok(()) => ControlResponse::Ok,
        Err(message) => ControlResponse::error(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use voltra_core::{
        CancelRequest, Direction, Exchange, OptionType, OrderId, OrderRequest, OrderType, Product,
        Status, StrategySetting,
    };
    use voltra_strategy::{Strategy, StrategyResult};

    struct StubGateway {
        connected: Arc<AtomicBool>,
        sent: Arc<Mutex<Vec<OrderRequest>>>,
        cancelled: Arc<Mutex<Vec<CancelRequest>>>,
        counter: u64,
    }

    impl StubGateway {
        fn new() -> (Self, Arc<Mutex<Vec<OrderRequest>>>, Arc<AtomicBool>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let connected = Arc::new(AtomicBool::new(true));
            (
                Self {
                    connected: connected.clone(),
                    sent: sent.clone(),
                    cancelled: Arc::new(Mutex::new(Vec::new())),
                    counter: 0,
                },
                sent,
                connected,
            )
        }
    }

    impl Gateway for StubGateway {
        fn name(&self) -> &str {
            "stub"
        }

        fn connect(&mut self) -> anyhow::Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send_order(&mut self, _req: &OrderRequest) -> OrderId {
            self.counter += 1;
            let orderid = format!("gw-{}", self.counter);
            self.sent.lock().unwrap().push(_req.clone());
            orderid
        }

        fn cancel_order(&mut self, req: &CancelRequest) {
            self.cancelled.lock().unwrap().push(req.clone());
        }
    }

    struct BuyOnce {
        symbol: String,
        sent: bool,
        trades_seen: Arc<Mutex<usize>>,
    }

    impl Strategy for BuyOnce {
        fn on_timer_logic(&mut self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
            if !self.sent {
                self.sent = true;
                ctx.send_order(&self.symbol, Direction::Long, 0.0, 1.0, OrderType::Market);
            }
            Ok(())
        }

        fn on_trade(
            &mut self,
            _ctx: &mut StrategyCtx<'_>,
            _trade: &voltra_core::TradeData,
        ) -> StrategyResult<()> {
            *self.trades_seen.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn option_contract(symbol_tail: &str, option_type: OptionType) -> ContractData {
        let expiry = Utc::now() + chrono::Duration::hours(190);
        ContractData {
            symbol: format!("SPXW-{}-{symbol_tail}-2800-100", expiry.format("%Y%m%d")),
            exchange: Exchange::Smart,
            name: "test-option".into(),
            product: Product::Option,
            size: 100.0,
            pricetick: 0.01,
            min_volume: 1.0,
            option_strike: Some(2800.0),
            option_underlying: Some("SPXW".into()),
            option_type: Some(option_type),
            option_expiry: Some(expiry),
            option_index: Some("2800".into()),
        }
    }

    fn seeded_core() -> (LiveCore, Arc<Mutex<Vec<OrderRequest>>>, String) {
        let mut core = LiveCore::new();
        let underlying = ContractData {
            symbol: "SPXW.STK".into(),
            exchange: Exchange::Smart,
            name: "SPXW".into(),
            product: Product::Index,
            size: 1.0,
            pricetick: 0.01,
            min_volume: 1.0,
            option_underlying: Some("SPXW".into()),
            ..ContractData::default()
        };
        core.dispatch(Event::Contract(underlying));
        let call = option_contract("C", OptionType::Call);
        let call_symbol = call.symbol.clone();
        core.dispatch(Event::Contract(call));
        core.dispatch(Event::Contract(option_contract("P", OptionType::Put)));
        let (gateway, sent, _) = StubGateway::new();
        core.gateway = Some(Box::new(gateway));
        (core, sent, call_symbol)
    }

    #[test]
    fn contract_events_build_portfolios() {
        let (core, _, call_symbol) = seeded_core();
        let portfolio = core.portfolios.get("SPXW").unwrap();
        assert_eq!(portfolio.option_apply_order().len(), 2);
        assert!(portfolio.option(&call_symbol).is_some());
        assert!(portfolio.underlying().is_some());
        assert_eq!(core.contracts.len(), 3);
    }

    #[test]
    fn timer_routes_strategy_order_to_gateway_and_fill_updates_position() {
        let (mut core, sent, call_symbol) = seeded_core();
        let trades_seen = Arc::new(Mutex::new(0));
        let name = core.strategies.add_boxed(
            "BuyOnce",
            "SPXW",
            &StrategySetting::new(),
            Box::new(BuyOnce {
                symbol: call_symbol.clone(),
                sent: false,
                trades_seen: trades_seen.clone(),
            }),
        );
        core.positions.get_or_create_holding(&name);
        core.execution.ensure_strategy_key(&name);
        {
            let (intents, directives) =
                core.with_strategy_ctx(&name, |shell, ctx| {
                    shell.on_init(ctx);
                    shell.on_start(ctx);
                });
            core.apply_hedge_directives(&name, directives);
            core.emit_intents(&name, intents);
        }

        core.dispatch(Event::Timer);
        assert_eq!(sent.lock().unwrap().len(), 1);
        let order = core.execution.order("gw-1").unwrap().clone();
        assert_eq!(order.status, Status::Submitting);
        assert_eq!(core.execution.strategy_name_for_order("gw-1"), Some(name.as_str()));

        // Gateways report the execution before the terminal status; the
        // terminal status is what drops the strategy mapping.
        core.dispatch(Event::Trade(voltra_core::TradeData {
            symbol: call_symbol.clone(),
            exchange: Exchange::Smart,
            orderid: "gw-1".into(),
            tradeid: "gw-trade-1".into(),
            direction: Some(Direction::Long),
            price: 10.1,
            volume: 1.0,
            datetime: Some(Utc::now()),
        }));
        let mut filled = order.clone();
        filled.status = Status::AllTraded;
        filled.traded = 1.0;
        core.dispatch(Event::Order(filled));

        let holding = core.positions.holding(&name).unwrap();
        assert_eq!(holding.options[&call_symbol].quantity, 1);
        assert_eq!(*trades_seen.lock().unwrap(), 1);
        assert!(core.execution.strategy_name_for_order("gw-1").is_none());
    }

    #[test]
    fn engine_threads_start_and_stop_cleanly() {
        let mut engine = LiveEngine::new(LiveConfig {
            timer_interval: Duration::from_millis(10),
        });
        engine.start();
        assert!(engine.events.is_active());
        std::thread::sleep(Duration::from_millis(50));
        engine.stop();
        assert!(!engine.events.is_active());
    }

    #[test]
    fn control_surface_lists_and_validates() {
        voltra_strategy::register_builtin_strategies();
        let engine = LiveEngine::new(LiveConfig::default());
        {
            let mut core = engine.core.lock().unwrap();
            core.dispatch(Event::Contract(option_contract("C", OptionType::Call)));
        }
        let response = engine.handle_control(ControlRequest::ListPortfolios);
        assert!(matches!(
            response,
            ControlResponse::Names { ref names } if names == &vec!["SPXW".to_string()]
        ));
        let response = engine.handle_control(ControlRequest::AddStrategy {
            class_name: "StraddleCycle".into(),
            portfolio_name: "NOPE".into(),
            setting_json: "{}".into(),
        });
        assert!(matches!(response, ControlResponse::Error { .. }));
        let response = engine.handle_control(ControlRequest::AddStrategy {
            class_name: "StraddleCycle".into(),
            portfolio_name: "SPXW".into(),
            setting_json: r#"{"timer_trigger": 2}"#.into(),
        });
        assert!(matches!(
            response,
            ControlResponse::StrategyName { ref strategy_name }
                if strategy_name == "StraddleCycle_SPXW"
        ));
    }
}
