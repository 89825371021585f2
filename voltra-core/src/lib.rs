//! Fundamental data types shared across the entire workspace.

pub mod position;
pub mod util;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use position::{ComboPosition, HoldingSummary, Position, StrategyHolding};

/// Alias used for human-readable instrument symbols (e.g., `SPXW-20260302-C-2800-100`).
pub type Symbol = String;
/// Unique identifier assigned to orders (gateway or backtest provided).
pub type OrderId = String;
/// Unique identifier assigned to fills.
pub type TradeId = String;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// Signed unit used when applying fills to positions.
    #[must_use]
    pub fn sign(self) -> i64 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }
}

/// Order lifecycle states tracked by the execution engine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Submitting,
    NotTraded,
    PartTraded,
    AllTraded,
    Cancelled,
    Rejected,
}

impl Status {
    /// An active order may still receive fills or be cancelled.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Submitting | Self::NotTraded | Self::PartTraded)
    }

    /// Terminal states admit no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::AllTraded | Self::Cancelled | Self::Rejected)
    }

    /// Whether `self -> next` is an allowed transition of the status machine.
    ///
    /// `Submitting` may move anywhere, `NotTraded` anywhere but back to
    /// `Submitting`, `PartTraded` may only keep filling or cancel, and the
    /// terminal states are absorbing.
    #[must_use]
    pub fn can_transition(self, next: Status) -> bool {
        match self {
            Self::Submitting => next != Self::Submitting,
            Self::NotTraded => !matches!(next, Self::Submitting | Self::NotTraded),
            Self::PartTraded => {
                matches!(next, Self::PartTraded | Self::AllTraded | Self::Cancelled)
            }
            Self::AllTraded | Self::Cancelled | Self::Rejected => false,
        }
    }
}

/// Product family of a contract.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    Equity,
    Futures,
    Option,
    Index,
    Forex,
    Spot,
    Etf,
    #[default]
    Unknown,
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

/// Call or put.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// `+1` for calls, `-1` for puts; the sign used by the IV inversion.
    #[must_use]
    pub fn sign(self) -> f64 {
        match self {
            Self::Call => 1.0,
            Self::Put => -1.0,
        }
    }

    /// Single-letter token used in platform option symbols.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }
}

/// Typed catalog of multi-leg structures understood by the combo builder.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboType {
    #[default]
    Custom,
    Spread,
    Straddle,
    Strangle,
    DiagonalSpread,
    RatioSpread,
    RiskReversal,
    Butterfly,
    InverseButterfly,
    IronCondor,
    IronButterfly,
    Condor,
    BoxSpread,
}

/// Venue routing tag carried on contracts and orders.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Smart,
    Nyse,
    Nasdaq,
    Amex,
    Cboe,
    #[default]
    Local,
}

/// Immutable descriptor of a tradable instrument.
///
/// Options carry the `option_*` fields; the bare underlying leaves them
/// unset. The platform symbol is the primary key everywhere.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ContractData {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub name: String,
    pub product: Product,
    /// Contract multiplier (100 for listed options, 1 for the underlying).
    pub size: f64,
    pub pricetick: f64,
    pub min_volume: f64,
    pub option_strike: Option<f64>,
    pub option_underlying: Option<Symbol>,
    pub option_type: Option<OptionType>,
    pub option_expiry: Option<DateTime<Utc>>,
    /// String form of the strike, used as the chain index key.
    pub option_index: Option<String>,
}

impl ContractData {
    #[must_use]
    pub fn is_option(&self) -> bool {
        self.product == Product::Option
    }
}

/// One leg of a combo order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Leg {
    pub symbol: Symbol,
    pub exchange: Exchange,
    /// Per-combo-unit quantity of this leg; sign is carried by `direction`.
    pub ratio: i32,
    pub direction: Direction,
    pub price: Option<f64>,
}

/// Desired order placement parameters submitted by strategies and the hedger.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub direction: Direction,
    pub order_type: OrderType,
    pub volume: f64,
    pub price: f64,
    /// Provenance tag, e.g. `Strategy_<name>` or `Hedge_<name>`.
    pub reference: String,
    pub is_combo: bool,
    #[serde(default)]
    pub legs: Vec<Leg>,
    pub combo_type: Option<ComboType>,
}

impl OrderRequest {
    /// Materialize the tracked order state for a freshly assigned id.
    #[must_use]
    pub fn create_order_data(&self, orderid: impl Into<OrderId>) -> OrderData {
        OrderData {
            symbol: self.symbol.clone(),
            exchange: self.exchange,
            orderid: orderid.into(),
            order_type: self.order_type,
            direction: Some(self.direction),
            price: self.price,
            volume: self.volume,
            traded: 0.0,
            status: Status::Submitting,
            datetime: None,
            reference: self.reference.clone(),
            is_combo: self.is_combo,
            legs: self.legs.clone(),
            combo_type: self.combo_type,
        }
    }
}

/// Order state maintained inside the execution engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderData {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub orderid: OrderId,
    pub order_type: OrderType,
    pub direction: Option<Direction>,
    pub price: f64,
    pub volume: f64,
    /// Filled volume; invariant `0 <= traded <= volume` while non-terminal.
    pub traded: f64,
    pub status: Status,
    pub datetime: Option<DateTime<Utc>>,
    pub reference: String,
    pub is_combo: bool,
    #[serde(default)]
    pub legs: Vec<Leg>,
    pub combo_type: Option<ComboType>,
}

impl OrderData {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Build the cancel intent for this order.
    #[must_use]
    pub fn create_cancel_request(&self) -> CancelRequest {
        CancelRequest {
            orderid: self.orderid.clone(),
            symbol: self.symbol.clone(),
            exchange: self.exchange,
            is_combo: self.is_combo,
            legs: self.legs.clone(),
        }
    }
}

/// Cancel intent routed back through the execution engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CancelRequest {
    pub orderid: OrderId,
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub is_combo: bool,
    #[serde(default)]
    pub legs: Vec<Leg>,
}

/// Immutable record of one execution.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TradeData {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub orderid: OrderId,
    pub tradeid: TradeId,
    pub direction: Option<Direction>,
    pub price: f64,
    pub volume: f64,
    pub datetime: Option<DateTime<Utc>>,
}

/// A compact, positional market frame for one portfolio.
///
/// The option vectors are aligned with the portfolio's apply order; no
/// per-option symbols or timestamps travel on the wire. Producers that have
/// precomputed greeks may fill the optional vectors, the portfolio ignores
/// them otherwise.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PortfolioSnapshot {
    pub portfolio_name: String,
    pub datetime: DateTime<Utc>,
    pub underlying_bid: f64,
    pub underlying_ask: f64,
    pub underlying_last: f64,
    pub bid: Vec<f64>,
    pub ask: Vec<f64>,
    pub last: Vec<f64>,
    #[serde(default)]
    pub delta: Vec<f64>,
    #[serde(default)]
    pub gamma: Vec<f64>,
    #[serde(default)]
    pub theta: Vec<f64>,
    #[serde(default)]
    pub vega: Vec<f64>,
    #[serde(default)]
    pub iv: Vec<f64>,
}

/// Log levels mirrored from the numeric scheme of the log sink.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// One log record produced by an engine handler as an intent.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogRecord {
    pub source: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    #[must_use]
    pub fn new(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            level,
            message: message.into(),
        }
    }
}

/// Events routed by the dispatcher.
#[derive(Clone, Debug)]
pub enum Event {
    Timer,
    Snapshot(PortfolioSnapshot),
    Order(OrderData),
    Trade(TradeData),
    Contract(ContractData),
}

/// Intents collected from handlers during a dispatch and re-emitted by the
/// dispatcher through the execution engine.
#[derive(Debug, Default)]
pub struct Intents {
    pub orders: Vec<OrderRequest>,
    pub cancels: Vec<CancelRequest>,
    pub logs: Vec<LogRecord>,
}

impl Intents {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.cancels.is_empty() && self.logs.is_empty()
    }
}

/// Flat `{name -> number}` strategy settings map parsed from JSON payloads.
/// Unknown keys are ignored by the consumers.
pub type StrategySetting = HashMap<String, f64>;
