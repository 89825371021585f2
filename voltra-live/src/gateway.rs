//! The broker gateway seam: the trait a wire adapter implements, plus the
//! status-deduplication ledger and broker error-code policy shared by
//! implementations.

use std::collections::{HashMap, HashSet};

use voltra_core::{CancelRequest, OrderId, OrderRequest, Status};

/// Broker error codes that are connection chatter, not failures.
const HARMLESS_BROKER_CODES: [i32; 4] = [202, 2104, 2106, 2158];

/// Whether a broker error code should be suppressed instead of logged.
#[must_use]
pub fn is_harmless_broker_code(code: i32) -> bool {
    HARMLESS_BROKER_CODES.contains(&code)
}

/// Contract the live runtime expects from a broker adapter.
///
/// The adapter owns its own API thread and pushes `Order`/`Trade`/
/// `Contract` events into the runtime through the event sender it was
/// given at construction; only order submission and cancellation flow the
/// other way through this trait.
pub trait Gateway: Send {
    fn name(&self) -> &str;

    fn connect(&mut self) -> anyhow::Result<()>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Submit an order; an empty id means the gateway rejected it outright.
    fn send_order(&mut self, req: &OrderRequest) -> OrderId;

    fn cancel_order(&mut self, req: &CancelRequest);

    /// Called on every Timer event; adapters use it for housekeeping such
    /// as heartbeats. Default is a no-op.
    fn process_timer(&mut self) {}
}

/// De-duplicates broker status callbacks on `(status, filled)` so only real
/// changes become `Order` events, and remembers completed orders so late
/// `openOrder`-style replays are ignored.
#[derive(Default)]
pub struct StatusLedger {
    last: HashMap<OrderId, (Status, f64)>,
    completed: HashSet<OrderId>,
}

impl StatusLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh order at its initial state.
    pub fn track(&mut self, orderid: &str, status: Status) {
        self.last.insert(orderid.to_string(), (status, 0.0));
    }

    /// Whether the status callback represents a change worth emitting.
    /// Terminal transitions retire the order from the ledger.
    pub fn should_emit(&mut self, orderid: &str, status: Status, filled: f64) -> bool {
        if self.completed.contains(orderid) {
            return false;
        }
        let entry = self.last.entry(orderid.to_string()).or_insert((
            Status::Submitting,
            f64::NEG_INFINITY,
        ));
        if *entry == (status, filled) {
            return false;
        }
        *entry = (status, filled);
        if status.is_terminal() {
            self.last.remove(orderid);
            self.completed.insert(orderid.to_string());
        }
        true
    }

    #[must_use]
    pub fn is_completed(&self, orderid: &str) -> bool {
        self.completed.contains(orderid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_status_is_suppressed() {
        let mut ledger = StatusLedger::new();
        ledger.track("oid-1", Status::Submitting);
        assert!(ledger.should_emit("oid-1", Status::NotTraded, 0.0));
        assert!(!ledger.should_emit("oid-1", Status::NotTraded, 0.0));
        assert!(ledger.should_emit("oid-1", Status::PartTraded, 1.0));
        // Same status, more fill: still a change.
        assert!(ledger.should_emit("oid-1", Status::PartTraded, 2.0));
    }

    #[test]
    fn terminal_status_retires_the_order() {
        let mut ledger = StatusLedger::new();
        ledger.track("oid-1", Status::Submitting);
        assert!(ledger.should_emit("oid-1", Status::AllTraded, 3.0));
        assert!(ledger.is_completed("oid-1"));
        assert!(!ledger.should_emit("oid-1", Status::AllTraded, 3.0));
        assert!(!ledger.should_emit("oid-1", Status::Cancelled, 3.0));
    }

    #[test]
    fn harmless_codes_match_policy() {
        for code in [202, 2104, 2106, 2158] {
            assert!(is_harmless_broker_code(code));
        }
        assert!(!is_harmless_broker_code(1100));
    }
}
