//! The execution engine owns the order book: it routes send/cancel intents
//! to an injected transport, tags every live order with its owning strategy,
//! and keeps the active-order indices that hedging and the strategy bridge
//! read.
//!
//! The engine itself is synchronization-free; the backtest drives it from a
//! single thread and the live runtime wraps it in one mutex shared by the
//! dispatcher and gateway callback threads.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, warn};
use voltra_core::{OrderData, OrderId, OrderRequest, Status, Symbol, TradeData, TradeId};

/// Transport half of order submission: returns the assigned order id, or an
/// empty string when the order was rejected outright.
pub type SendImpl = Box<dyn FnMut(&OrderRequest) -> OrderId + Send>;

/// Order/trade store plus strategy-to-order bookkeeping.
#[derive(Default)]
pub struct ExecutionEngine {
    send_impl: Option<SendImpl>,
    orders: HashMap<OrderId, OrderData>,
    trades: HashMap<TradeId, TradeData>,
    strategy_active_orders: HashMap<String, BTreeSet<OrderId>>,
    orderid_strategy_name: HashMap<OrderId, String>,
    all_active_order_ids: BTreeSet<OrderId>,
    /// Account-level net position placeholder, tracked separately from the
    /// strategy-level position engine. Unused by the current control flow.
    account_position: HashMap<Symbol, f64>,
}

impl ExecutionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the transport used by [`Self::send_order`].
    pub fn set_send_impl(&mut self, send_impl: SendImpl) {
        self.send_impl = Some(send_impl);
    }

    /// Validate, submit, and start tracking an order for `strategy_name`.
    ///
    /// An empty returned id means rejection; rejected orders are never
    /// tracked and callers must treat the empty id as "no order exists".
    pub fn send_order(&mut self, strategy_name: &str, req: &OrderRequest) -> OrderId {
        if !self.pre_trade_risk_check(strategy_name, req) {
            return OrderId::new();
        }
        let orderid = match &mut self.send_impl {
            Some(send) => send(req),
            None => OrderId::new(),
        };
        if !orderid.is_empty() {
            self.register_active_order(strategy_name, &orderid);
        }
        orderid
    }

    /// Like [`Self::send_order`], but with the transport supplied by the
    /// caller instead of the installed [`SendImpl`]. The live runtime uses
    /// this to route through whichever gateway is currently connected.
    pub fn send_order_via(
        &mut self,
        strategy_name: &str,
        req: &OrderRequest,
        transport: &mut dyn FnMut(&OrderRequest) -> OrderId,
    ) -> OrderId {
        if !self.pre_trade_risk_check(strategy_name, req) {
            return OrderId::new();
        }
        let orderid = transport(req);
        if !orderid.is_empty() {
            self.register_active_order(strategy_name, &orderid);
        }
        orderid
    }

    /// Placeholder pre-trade gate; always passes. Extend before production.
    fn pre_trade_risk_check(&self, _strategy_name: &str, _req: &OrderRequest) -> bool {
        true
    }

    /// Index a freshly accepted order under its strategy.
    pub fn register_active_order(&mut self, strategy_name: &str, orderid: &str) {
        if orderid.is_empty() {
            return;
        }
        self.strategy_active_orders
            .entry(strategy_name.to_string())
            .or_default()
            .insert(orderid.to_string());
        self.orderid_strategy_name
            .insert(orderid.to_string(), strategy_name.to_string());
        self.all_active_order_ids.insert(orderid.to_string());
    }

    /// Upsert an order; a terminal status drops it from the active indices.
    ///
    /// Updates arriving after an order has gone terminal violate the status
    /// machine and are discarded.
    pub fn store_order(&mut self, strategy_name: &str, order: &OrderData) {
        if let Some(existing) = self.orders.get(&order.orderid) {
            if existing.status.is_terminal() && existing.status != order.status {
                warn!(
                    orderid = %order.orderid,
                    from = ?existing.status,
                    to = ?order.status,
                    "status update after terminal state discarded"
                );
                return;
            }
        }
        self.orders.insert(order.orderid.clone(), order.clone());
        if matches!(
            order.status,
            Status::Cancelled | Status::Rejected | Status::AllTraded
        ) {
            if let Some(active) = self.strategy_active_orders.get_mut(strategy_name) {
                active.remove(&order.orderid);
            }
            self.orderid_strategy_name.remove(&order.orderid);
            self.all_active_order_ids.remove(&order.orderid);
        }
    }

    /// Insert order state without touching the tracking indices.
    pub fn add_order(&mut self, order: OrderData) {
        self.orders.insert(order.orderid.clone(), order);
    }

    /// Append-only trade store keyed by trade id.
    pub fn store_trade(&mut self, trade: &TradeData) {
        self.trades.insert(trade.tradeid.clone(), trade.clone());
    }

    #[must_use]
    pub fn order(&self, orderid: &str) -> Option<&OrderData> {
        self.orders.get(orderid)
    }

    pub fn order_mut(&mut self, orderid: &str) -> Option<&mut OrderData> {
        self.orders.get_mut(orderid)
    }

    #[must_use]
    pub fn trade(&self, tradeid: &str) -> Option<&TradeData> {
        self.trades.get(tradeid)
    }

    /// The strategy that owns `orderid`, when still tracked.
    #[must_use]
    pub fn strategy_name_for_order(&self, orderid: &str) -> Option<&str> {
        self.orderid_strategy_name.get(orderid).map(String::as_str)
    }

    #[must_use]
    pub fn all_orders(&self) -> Vec<OrderData> {
        self.orders.values().cloned().collect()
    }

    #[must_use]
    pub fn all_trades(&self) -> Vec<TradeData> {
        self.trades.values().cloned().collect()
    }

    /// Every tracked order that is still active, in id order.
    #[must_use]
    pub fn all_active_orders(&self) -> Vec<OrderData> {
        self.all_active_order_ids
            .iter()
            .filter_map(|oid| self.orders.get(oid))
            .filter(|order| order.is_active())
            .cloned()
            .collect()
    }

    /// Active order ids belonging to one strategy, in id order.
    #[must_use]
    pub fn strategy_active_order_ids(&self, strategy_name: &str) -> Vec<OrderId> {
        self.strategy_active_orders
            .get(strategy_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Active [`OrderData`] snapshots for one strategy.
    #[must_use]
    pub fn strategy_active_orders(&self, strategy_name: &str) -> Vec<OrderData> {
        self.strategy_active_order_ids(strategy_name)
            .iter()
            .filter_map(|oid| self.orders.get(oid))
            .cloned()
            .collect()
    }

    /// Drop an order from every tracking index. Idempotent; called from
    /// cancel paths and the dispatcher.
    pub fn remove_order_tracking(&mut self, orderid: &str) {
        if let Some(strategy) = self.orderid_strategy_name.remove(orderid) {
            if let Some(active) = self.strategy_active_orders.get_mut(&strategy) {
                active.remove(orderid);
            }
        }
        self.all_active_order_ids.remove(orderid);
    }

    /// Cascade removal of every tracked order of a strategy, used when a
    /// strategy is being removed from the runtime.
    pub fn remove_strategy_tracking(&mut self, strategy_name: &str) {
        if let Some(orderids) = self.strategy_active_orders.remove(strategy_name) {
            for orderid in orderids {
                self.orderid_strategy_name.remove(&orderid);
                self.all_active_order_ids.remove(&orderid);
            }
        }
        debug!(strategy = strategy_name, "strategy order tracking removed");
    }

    /// Ensure the per-strategy set exists so later lookups are non-allocating.
    pub fn ensure_strategy_key(&mut self, strategy_name: &str) {
        self.strategy_active_orders
            .entry(strategy_name.to_string())
            .or_default();
    }

    pub fn set_account_position(&mut self, symbol: &str, position: f64) {
        self.account_position.insert(symbol.to_string(), position);
    }

    #[must_use]
    pub fn account_position(&self, symbol: &str) -> f64 {
        self.account_position.get(symbol).copied().unwrap_or(0.0)
    }

    /// Reset everything; used when a runtime shuts down.
    pub fn clear(&mut self) {
        self.orders.clear();
        self.trades.clear();
        self.strategy_active_orders.clear();
        self.orderid_strategy_name.clear();
        self.all_active_order_ids.clear();
        self.account_position.clear();
    }
}
