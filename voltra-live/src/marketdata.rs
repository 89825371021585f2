//! Market-data bookkeeping: which chains each strategy subscribed and
//! whether the external feed is running. The feed itself (HTTP poller or
//! broker stream) lives outside the runtime and injects `Snapshot` and
//! `Contract` events through the event sender.

use std::collections::{BTreeSet, HashMap};

use tracing::info;

/// Per-strategy chain subscriptions plus the running flag of the feed.
#[derive(Default)]
pub struct MarketDataEngine {
    strategy_chains: HashMap<String, BTreeSet<String>>,
    running: bool,
}

impl MarketDataEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.running = true;
        info!("market data started");
    }

    pub fn stop(&mut self) {
        self.running = false;
        info!("market data stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn subscribe_chains(&mut self, strategy_name: &str, chain_symbols: &[String]) {
        let entry = self
            .strategy_chains
            .entry(strategy_name.to_string())
            .or_default();
        for chain in chain_symbols {
            entry.insert(chain.clone());
        }
    }

    pub fn unsubscribe_chains(&mut self, strategy_name: &str) {
        self.strategy_chains.remove(strategy_name);
    }

    /// Chains subscribed by `strategy_name`, sorted.
    #[must_use]
    pub fn chains_for(&self, strategy_name: &str) -> Vec<String> {
        self.strategy_chains
            .get(strategy_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of all subscriptions, sorted; the feed polls these.
    #[must_use]
    pub fn all_chains(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = BTreeSet::new();
        for chains in self.strategy_chains.values() {
            all.extend(chains.iter().cloned());
        }
        all.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_union_and_remove() {
        let mut engine = MarketDataEngine::new();
        engine.subscribe_chains("a", &["SPXW_20260306".into(), "SPXW_20260309".into()]);
        engine.subscribe_chains("b", &["SPXW_20260309".into()]);
        assert_eq!(engine.chains_for("a").len(), 2);
        assert_eq!(engine.all_chains(), ["SPXW_20260306", "SPXW_20260309"]);
        engine.unsubscribe_chains("a");
        assert!(engine.chains_for("a").is_empty());
        assert_eq!(engine.all_chains(), ["SPXW_20260309"]);
    }
}
