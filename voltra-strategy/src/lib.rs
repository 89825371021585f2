//! Strategy lifecycle shell, the global class registry, and the context
//! handed to strategy hooks.
//!
//! Concrete strategies implement [`Strategy`]; the [`StrategyShell`] wraps
//! each instance with the fixed lifecycle (init/start/stop, timer
//! decimation, error capture) and the [`StrategyEngine`] keeps the shells
//! by strategy name. Hooks never touch the execution engine directly: every
//! order, cancel, and hedge registration is collected as an intent on the
//! context and re-emitted by the dispatcher.

pub mod combo;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{info, warn};
use voltra_core::util::{round_to, COMBO_SYMBOL_PREFIX};
use voltra_core::{
    ComboType, ContractData, Direction, Intents, LogLevel, LogRecord, OrderData, OrderRequest,
    OrderType, StrategyHolding, StrategySetting, Symbol, TradeData,
};
use voltra_hedge::HedgeConfig;
use voltra_portfolio::{OptionData, Portfolio};

/// Result alias used by strategy hooks.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Failure variants surfaced by strategies and the registry.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Unknown class name at `add_strategy` time; fatal at startup.
    #[error("unknown strategy class: {0}")]
    UnknownClass(String),
    #[error("strategy not found: {0}")]
    NotFound(String),
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    /// Any other hook failure; flips the shell into its error state.
    #[error("{0}")]
    Internal(String),
}

/// Hedge registry changes requested by a hook, applied by the dispatcher
/// after the hook returns.
#[derive(Clone, Copy, Debug)]
pub enum HedgeDirective {
    Register(HedgeConfig),
    Unregister,
}

/// Read view plus intent sink handed to every strategy hook.
pub struct StrategyCtx<'a> {
    pub strategy_name: &'a str,
    pub portfolio: &'a Portfolio,
    pub holding: Option<&'a StrategyHolding>,
    pub contracts: &'a HashMap<Symbol, ContractData>,
    pub intents: &'a mut Intents,
    pub hedge_directives: &'a mut Vec<HedgeDirective>,
}

impl StrategyCtx<'_> {
    /// Emit a log intent attributed to the strategy.
    pub fn write_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.intents.logs.push(LogRecord::new(
            format!("Strategy/{}", self.strategy_name),
            level,
            message,
        ));
    }

    /// Queue a single-instrument order. Volume is rounded to the contract's
    /// minimum lot and limit prices to a cent; market orders carry price 0.
    /// Returns false when the contract is unknown.
    pub fn send_order(
        &mut self,
        symbol: &str,
        direction: Direction,
        price: f64,
        volume: f64,
        order_type: OrderType,
    ) -> bool {
        let Some(contract) = self.contracts.get(symbol) else {
            self.write_log(
                LogLevel::Warning,
                format!("order skipped, unknown contract: {symbol}"),
            );
            return false;
        };
        self.intents.orders.push(OrderRequest {
            symbol: contract.symbol.clone(),
            exchange: contract.exchange,
            direction,
            order_type,
            volume: round_to(volume, contract.min_volume),
            price: if order_type == OrderType::Market {
                0.0
            } else {
                round_to(price, 0.01)
            },
            reference: format!("Strategy_{}", self.strategy_name),
            is_combo: false,
            legs: Vec::new(),
            combo_type: None,
        });
        true
    }

    /// Queue a combo order built from named option roles. The combo's
    /// synthetic symbol is `combo_` + the canonical leg signature.
    pub fn send_combo_order(
        &mut self,
        combo_type: ComboType,
        roles: &HashMap<&str, &OptionData>,
        direction: Direction,
        price: f64,
        volume: i32,
        order_type: OrderType,
    ) -> StrategyResult<()> {
        let (legs, signature) =
            combo::build_combo(combo_type, roles, direction, volume, self.contracts)?;
        self.intents.orders.push(OrderRequest {
            symbol: format!("{COMBO_SYMBOL_PREFIX}{signature}"),
            exchange: voltra_core::Exchange::Smart,
            direction,
            order_type,
            volume: f64::from(volume.abs()),
            price: if order_type == OrderType::Market {
                0.0
            } else {
                round_to(price, 0.01)
            },
            reference: format!("Strategy_{}", self.strategy_name),
            is_combo: true,
            legs,
            combo_type: Some(combo_type),
        });
        Ok(())
    }

    /// Ask the hedge controller to start managing this strategy's delta.
    pub fn register_hedging(&mut self, config: HedgeConfig) {
        self.hedge_directives.push(HedgeDirective::Register(config));
    }

    pub fn unregister_hedging(&mut self) {
        self.hedge_directives.push(HedgeDirective::Unregister);
    }

    /// Market-close every combo, single-leg, and underlying position of the
    /// holding.
    pub fn close_all_positions(&mut self) {
        let Some(holding) = self.holding else {
            return;
        };
        let mut combo_closes: Vec<(Vec<Symbol>, Direction, f64)> = Vec::new();
        for combo in holding.combos.values() {
            if combo.base.quantity == 0 {
                continue;
            }
            let leg_symbols: Vec<Symbol> =
                combo.legs.iter().map(|leg| leg.symbol.clone()).collect();
            let direction = if combo.base.quantity > 0 {
                Direction::Short
            } else {
                Direction::Long
            };
            combo_closes.push((
                leg_symbols,
                direction,
                combo.base.quantity.unsigned_abs() as f64,
            ));
        }
        for (leg_symbols, direction, volume) in combo_closes {
            let mut roles: HashMap<&str, &OptionData> = HashMap::new();
            let resolved: Vec<(&Symbol, Option<&OptionData>)> = leg_symbols
                .iter()
                .map(|symbol| (symbol, self.portfolio.option(symbol)))
                .collect();
            for (symbol, option) in &resolved {
                if let Some(option) = *option {
                    roles.insert(symbol.as_str(), option);
                }
            }
            if roles.is_empty() {
                continue;
            }
            if let Err(err) = self.send_combo_order(
                ComboType::Custom,
                &roles,
                direction,
                0.0,
                volume as i32,
                OrderType::Market,
            ) {
                self.write_log(LogLevel::Warning, format!("close-all combo skipped: {err}"));
            }
        }

        let single_closes: Vec<(Symbol, Direction, f64)> = holding
            .options
            .values()
            .filter(|pos| pos.quantity != 0)
            .map(|pos| {
                (
                    pos.symbol.clone(),
                    if pos.quantity > 0 {
                        Direction::Short
                    } else {
                        Direction::Long
                    },
                    pos.quantity.unsigned_abs() as f64,
                )
            })
            .collect();
        for (symbol, direction, volume) in single_closes {
            self.send_order(&symbol, direction, 0.0, volume, OrderType::Market);
        }

        if holding.underlying.quantity != 0 {
            let direction = if holding.underlying.quantity > 0 {
                Direction::Short
            } else {
                Direction::Long
            };
            let volume = holding.underlying.quantity.unsigned_abs() as f64;
            let symbol = holding.underlying.symbol.clone();
            self.send_order(&symbol, direction, 0.0, volume, OrderType::Market);
        }
    }
}

/// Lifecycle hooks a concrete strategy implements. Every hook may fail;
/// a failure flips the shell into its error state and stops future timer
/// callbacks until the strategy is restarted.
pub trait Strategy: Send {
    fn on_init_logic(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        Ok(())
    }

    fn on_start_logic(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        Ok(())
    }

    fn on_stop_logic(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        Ok(())
    }

    fn on_timer_logic(&mut self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()>;

    fn on_order(&mut self, _ctx: &mut StrategyCtx<'_>, _order: &OrderData) -> StrategyResult<()> {
        Ok(())
    }

    fn on_trade(&mut self, _ctx: &mut StrategyCtx<'_>, _trade: &TradeData) -> StrategyResult<()> {
        Ok(())
    }

    /// Chain keys the live market-data engine should subscribe for this
    /// strategy. Defaults to none.
    fn chain_subscriptions(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Fixed lifecycle wrapper around one strategy instance.
pub struct StrategyShell {
    strategy_name: String,
    portfolio_name: String,
    logic: Box<dyn Strategy>,
    inited: bool,
    started: bool,
    error: bool,
    error_msg: String,
    timer_trigger: i64,
    timer_count: i64,
}

impl StrategyShell {
    #[must_use]
    pub fn new(
        strategy_name: impl Into<String>,
        portfolio_name: impl Into<String>,
        setting: &StrategySetting,
        logic: Box<dyn Strategy>,
    ) -> Self {
        let timer_trigger = setting
            .get("timer_trigger")
            .map_or(1, |value| (*value as i64).max(1));
        Self {
            strategy_name: strategy_name.into(),
            portfolio_name: portfolio_name.into(),
            logic,
            inited: false,
            started: false,
            error: false,
            error_msg: String::new(),
            timer_trigger,
            timer_count: 0,
        }
    }

    #[must_use]
    pub fn strategy_name(&self) -> &str {
        &self.strategy_name
    }

    #[must_use]
    pub fn portfolio_name(&self) -> &str {
        &self.portfolio_name
    }

    #[must_use]
    pub fn inited(&self) -> bool {
        self.inited
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn error(&self) -> bool {
        self.error
    }

    #[must_use]
    pub fn error_msg(&self) -> &str {
        &self.error_msg
    }

    #[must_use]
    pub fn chain_subscriptions(&self) -> Vec<String> {
        self.logic.chain_subscriptions()
    }

    pub fn on_init(&mut self, ctx: &mut StrategyCtx<'_>) {
        self.inited = true;
        let result = self.logic.on_init_logic(ctx);
        self.absorb(result);
    }

    pub fn on_start(&mut self, ctx: &mut StrategyCtx<'_>) {
        if self.error {
            return;
        }
        self.started = true;
        let result = self.logic.on_start_logic(ctx);
        self.absorb(result);
    }

    pub fn on_stop(&mut self, ctx: &mut StrategyCtx<'_>) {
        self.started = false;
        let result = self.logic.on_stop_logic(ctx);
        self.absorb(result);
    }

    /// Timer decimation: the hook fires on the first Timer event and then
    /// every `timer_trigger`-th one.
    pub fn on_timer(&mut self, ctx: &mut StrategyCtx<'_>) {
        if !self.started || self.error {
            return;
        }
        let fire = self.timer_count == 0;
        self.timer_count = (self.timer_count + 1) % self.timer_trigger;
        if fire {
            let result = self.logic.on_timer_logic(ctx);
            self.absorb(result);
        }
    }

    pub fn on_order(&mut self, ctx: &mut StrategyCtx<'_>, order: &OrderData) {
        let result = self.logic.on_order(ctx, order);
        self.absorb(result);
    }

    pub fn on_trade(&mut self, ctx: &mut StrategyCtx<'_>, trade: &TradeData) {
        let result = self.logic.on_trade(ctx, trade);
        self.absorb(result);
    }

    /// Clear the error state so the strategy can be started again.
    pub fn reset_error(&mut self) {
        self.error = false;
        self.error_msg.clear();
    }

    fn absorb(&mut self, result: StrategyResult<()>) {
        if let Err(err) = result {
            self.error = true;
            self.started = false;
            self.error_msg = err.to_string();
            warn!(strategy = %self.strategy_name, error = %self.error_msg, "strategy faulted");
        }
    }
}

// -------------------------------------------------------------------------
// Strategy registry
// -------------------------------------------------------------------------

/// Factory contract used to construct strategies from settings.
pub trait StrategyFactory: Send + Sync {
    /// User-facing class name (e.g. `StraddleCycle`).
    fn class_name(&self) -> &'static str;

    fn build(&self, setting: &StrategySetting) -> Box<dyn Strategy>;
}

static STRATEGY_REGISTRY: Lazy<RwLock<HashMap<&'static str, Arc<dyn StrategyFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a factory with the process-wide registry. Registering a name
/// twice replaces the previous factory.
pub fn register_strategy_factory(factory: Arc<dyn StrategyFactory>) {
    let mut registry = STRATEGY_REGISTRY.write().expect("registry poisoned");
    if registry.insert(factory.class_name(), factory.clone()).is_some() {
        warn!(
            class = factory.class_name(),
            "duplicate strategy registration; overriding previous factory"
        );
    }
}

/// Registered class names in sorted order.
#[must_use]
pub fn strategy_class_names() -> Vec<&'static str> {
    let registry = STRATEGY_REGISTRY.read().expect("registry poisoned");
    let mut names: Vec<&'static str> = registry.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Build a strategy instance by class name.
pub fn create_strategy(
    class_name: &str,
    setting: &StrategySetting,
) -> StrategyResult<Box<dyn Strategy>> {
    let registry = STRATEGY_REGISTRY.read().expect("registry poisoned");
    registry
        .get(class_name)
        .map(|factory| factory.build(setting))
        .ok_or_else(|| StrategyError::UnknownClass(class_name.to_string()))
}

/// Register the built-in strategy classes; call once at startup.
pub fn register_builtin_strategies() {
    register_strategy_factory(Arc::new(StraddleCycleFactory));
}

// -------------------------------------------------------------------------
// Strategy engine (shell container)
// -------------------------------------------------------------------------

/// Container of strategy shells keyed by `<class>_<portfolio>` name. The
/// dispatcher resolves owners through the execution engine and calls the
/// shells through this map.
#[derive(Default)]
pub struct StrategyEngine {
    strategies: BTreeMap<String, StrategyShell>,
}

impl StrategyEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate `class_name` on `portfolio_name`; the resulting strategy
    /// name is `<class>_<portfolio>`.
    pub fn add_strategy(
        &mut self,
        class_name: &str,
        portfolio_name: &str,
        setting: &StrategySetting,
    ) -> StrategyResult<String> {
        let logic = create_strategy(class_name, setting)?;
        Ok(self.add_boxed(class_name, portfolio_name, setting, logic))
    }

    /// Wrap an already-built strategy instance in a shell under the usual
    /// `<class>_<portfolio>` name.
    pub fn add_boxed(
        &mut self,
        class_name: &str,
        portfolio_name: &str,
        setting: &StrategySetting,
        logic: Box<dyn Strategy>,
    ) -> String {
        let strategy_name = format!("{class_name}_{portfolio_name}");
        let shell = StrategyShell::new(strategy_name.clone(), portfolio_name, setting, logic);
        self.strategies.insert(strategy_name.clone(), shell);
        info!(strategy = %strategy_name, "strategy added");
        strategy_name
    }

    #[must_use]
    pub fn get(&self, strategy_name: &str) -> Option<&StrategyShell> {
        self.strategies.get(strategy_name)
    }

    pub fn get_mut(&mut self, strategy_name: &str) -> Option<&mut StrategyShell> {
        self.strategies.get_mut(strategy_name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.strategies.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// The single shell, when exactly one strategy is loaded (the backtest
    /// composition runs one strategy per engine).
    pub fn sole_mut(&mut self) -> Option<&mut StrategyShell> {
        if self.strategies.len() == 1 {
            self.strategies.values_mut().next()
        } else {
            None
        }
    }

    #[must_use]
    pub fn sole(&self) -> Option<&StrategyShell> {
        if self.strategies.len() == 1 {
            self.strategies.values().next()
        } else {
            None
        }
    }

    pub fn remove(&mut self, strategy_name: &str) -> Option<StrategyShell> {
        self.strategies.remove(strategy_name)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut StrategyShell)> {
        self.strategies.iter_mut()
    }
}

// -------------------------------------------------------------------------
// Built-in sample strategy
// -------------------------------------------------------------------------

/// Minimal cycle strategy for exercising the runtime end to end: every
/// three timer ticks it opens one ATM straddle on the nearest weekly chain,
/// holds one tick, then closes everything.
pub struct StraddleCycle {
    position_size: i32,
    chain_symbol: Option<String>,
    step_in_cycle: u8,
}

impl StraddleCycle {
    #[must_use]
    pub fn new(setting: &StrategySetting) -> Self {
        Self {
            position_size: setting.get("position_size").map_or(1, |v| *v as i32).max(1),
            chain_symbol: None,
            step_in_cycle: 0,
        }
    }

    fn has_position(holding: Option<&StrategyHolding>) -> bool {
        holding.is_some_and(|holding| {
            holding.options.values().any(|pos| pos.quantity != 0)
                || holding.combos.values().any(|combo| combo.base.quantity != 0)
        })
    }

    fn enter_atm_straddle(&self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        let Some(chain_symbol) = &self.chain_symbol else {
            return Ok(());
        };
        let Some(chain) = ctx.portfolio.chain(chain_symbol) else {
            return Ok(());
        };
        let atm_index = chain.atm_index.clone();
        if atm_index.is_empty() {
            return Ok(());
        }
        let (Some(call_id), Some(put_id)) = (chain.call_id(&atm_index), chain.put_id(&atm_index))
        else {
            return Ok(());
        };
        let call = &ctx.portfolio.options()[call_id];
        let put = &ctx.portfolio.options()[put_id];
        let roles: HashMap<&str, &OptionData> = HashMap::from([("call", call), ("put", put)]);
        ctx.send_combo_order(
            ComboType::Straddle,
            &roles,
            Direction::Long,
            0.0,
            self.position_size,
            OrderType::Market,
        )
    }
}

impl Strategy for StraddleCycle {
    fn on_init_logic(&mut self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        let chains = ctx.portfolio.chains_by_expiry(7, 7);
        let Some(front) = chains.first() else {
            return Err(StrategyError::InvalidConfig(
                "no 7-DTE chain available".into(),
            ));
        };
        self.chain_symbol = Some(front.clone());
        ctx.write_log(
            LogLevel::Info,
            format!("straddle cycle initialized on chain {front}"),
        );
        Ok(())
    }

    fn on_stop_logic(&mut self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        ctx.close_all_positions();
        Ok(())
    }

    fn on_timer_logic(&mut self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        self.step_in_cycle = (self.step_in_cycle + 1) % 3;
        let has_position = Self::has_position(ctx.holding);
        match self.step_in_cycle {
            0 => {
                if has_position {
                    ctx.close_all_positions();
                }
                Ok(())
            }
            1 => {
                if !has_position {
                    self.enter_atm_straddle(ctx)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn chain_subscriptions(&self) -> Vec<String> {
        self.chain_symbol.clone().into_iter().collect()
    }
}

struct StraddleCycleFactory;

impl StrategyFactory for StraddleCycleFactory {
    fn class_name(&self) -> &'static str {
        "StraddleCycle"
    }

    fn build(&self, setting: &StrategySetting) -> Box<dyn Strategy> {
        Box::new(StraddleCycle::new(setting))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStrategy {
        fired: Arc<AtomicUsize>,
        fail_on: Option<usize>,
    }

    impl Strategy for CountingStrategy {
        fn on_timer_logic(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
            let count = self.fired.fetch_add(1, Ordering::Relaxed) + 1;
            if self.fail_on == Some(count) {
                return Err(StrategyError::Internal("boom".into()));
            }
            Ok(())
        }
    }

    fn drive(shell: &mut StrategyShell, ticks: usize) {
        let portfolio = Portfolio::new("backtest");
        let contracts = HashMap::new();
        for _ in 0..ticks {
            let mut intents = Intents::default();
            let mut directives = Vec::new();
            let mut ctx = StrategyCtx {
                strategy_name: "CountingStrategy_backtest",
                portfolio: &portfolio,
                holding: None,
                contracts: &contracts,
                intents: &mut intents,
                hedge_directives: &mut directives,
            };
            shell.on_timer(&mut ctx);
        }
    }

    fn shell_with(trigger: f64, fail_on: Option<usize>) -> (StrategyShell, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let setting = StrategySetting::from([("timer_trigger".to_string(), trigger)]);
        let mut shell = StrategyShell::new(
            "CountingStrategy_backtest",
            "backtest",
            &setting,
            Box::new(CountingStrategy {
                fired: fired.clone(),
                fail_on,
            }),
        );
        let portfolio = Portfolio::new("backtest");
        let contracts = HashMap::new();
        let mut intents = Intents::default();
        let mut directives = Vec::new();
        let mut ctx = StrategyCtx {
            strategy_name: "CountingStrategy_backtest",
            portfolio: &portfolio,
            holding: None,
            contracts: &contracts,
            intents: &mut intents,
            hedge_directives: &mut directives,
        };
        shell.on_init(&mut ctx);
        shell.on_start(&mut ctx);
        (shell, fired)
    }

    #[test]
    fn timer_decimation_fires_first_then_every_nth() {
        let (mut shell, fired) = shell_with(3.0, None);
        drive(&mut shell, 1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        drive(&mut shell, 2);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        drive(&mut shell, 1);
        // Fires at ticks 1, 4, 7, ...
        assert_eq!(fired.load(Ordering::Relaxed), 2);
        drive(&mut shell, 3);
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn hook_failure_flips_error_and_stops_timers() {
        let (mut shell, fired) = shell_with(1.0, Some(2));
        drive(&mut shell, 2);
        assert!(shell.error());
        assert!(!shell.started());
        assert_eq!(shell.error_msg(), "boom");
        // Further timers are no-ops.
        drive(&mut shell, 3);
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn registry_builds_known_classes_and_rejects_unknown() {
        register_builtin_strategies();
        assert!(strategy_class_names().contains(&"StraddleCycle"));
        let setting = StrategySetting::new();
        assert!(create_strategy("StraddleCycle", &setting).is_ok());
        assert!(matches!(
            create_strategy("NoSuchClass", &setting),
            Err(StrategyError::UnknownClass(_))
        ));
    }

    #[test]
    fn engine_names_follow_class_portfolio_convention() {
        register_builtin_strategies();
        let mut engine = StrategyEngine::new();
        let setting = StrategySetting::new();
        let name = engine
            .add_strategy("StraddleCycle", "backtest", &setting)
            .unwrap();
        assert_eq!(name, "StraddleCycle_backtest");
        assert!(engine.get(&name).is_some());
        assert!(engine.sole().is_some());
        assert!(matches!(
            engine.add_strategy("Ghost", "backtest", &setting),
            Err(StrategyError::UnknownClass(_))
        ));
    }
}
