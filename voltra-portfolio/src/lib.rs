//! Per-portfolio market state: the underlying, its option chains, and the
//! positional snapshot-apply path that recomputes IV and greeks for every
//! tracked option.
//!
//! Ownership is arena-shaped: the portfolio owns all [`OptionData`] records
//! in one vector and every cross-reference (chain membership, the apply
//! order) is an index into it. `finalize_chains` freezes the apply order;
//! adding options afterwards requires re-finalizing before the next frame.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::warn;
use voltra_core::util::chain_key_of_symbol;
use voltra_core::{ContractData, Exchange, OptionType, PortfolioSnapshot, Symbol};
use voltra_quant::{
    bs_greeks, implied_volatility, pick_iv_input_price, years_to_expiry, IvPriceMode,
};

/// Trading days used for the chain-level year fraction.
const ANNUAL_TRADING_DAYS: f64 = 240.0;

/// Mutable per-option market state.
#[derive(Clone, Debug)]
pub struct OptionData {
    pub symbol: Symbol,
    pub exchange: Exchange,
    /// Contract multiplier; greeks below are scaled by it.
    pub size: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub mid_price: f64,
    pub strike_price: Option<f64>,
    /// String form of the strike, keying the call/put maps of the chain.
    pub chain_index: Option<String>,
    pub option_type: OptionType,
    pub option_expiry: Option<DateTime<Utc>>,
    pub chain_symbol: String,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub mid_iv: f64,
}

impl OptionData {
    fn from_contract(contract: &ContractData) -> Self {
        Self {
            symbol: contract.symbol.clone(),
            exchange: contract.exchange,
            size: contract.size,
            bid_price: 0.0,
            ask_price: 0.0,
            mid_price: 0.0,
            strike_price: contract.option_strike,
            chain_index: contract.option_index.clone(),
            option_type: contract.option_type.unwrap_or(OptionType::Call),
            option_expiry: contract.option_expiry,
            chain_symbol: chain_key_of_symbol(&contract.symbol),
            delta: 0.0,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
            mid_iv: 0.0,
        }
    }

    #[must_use]
    pub fn is_call(&self) -> bool {
        self.option_type == OptionType::Call
    }

    /// Spot-over-strike ratio, optionally log-transformed.
    #[must_use]
    pub fn moneyness(&self, spot: f64, use_log: bool) -> Option<f64> {
        let strike = self.strike_price?;
        if strike == 0.0 {
            return None;
        }
        let ratio = spot / strike;
        if use_log {
            if ratio <= 0.0 {
                return None;
            }
            Some(ratio.ln())
        } else {
            Some(ratio)
        }
    }

    /// Whether the option is out of the money at `spot`.
    #[must_use]
    pub fn is_otm(&self, spot: f64) -> bool {
        let Some(strike) = self.strike_price else {
            return false;
        };
        if self.is_call() {
            strike > spot
        } else {
            strike < spot
        }
    }
}

/// Underlying quote state plus the theoretical delta used by the hedger.
#[derive(Clone, Debug)]
pub struct UnderlyingData {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub size: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub mid_price: f64,
    pub theo_delta: f64,
}

impl UnderlyingData {
    fn from_contract(contract: &ContractData) -> Self {
        Self {
            symbol: contract.symbol.clone(),
            exchange: contract.exchange,
            size: contract.size,
            bid_price: 0.0,
            ask_price: 0.0,
            mid_price: 0.0,
            theo_delta: if contract.size > 0.0 {
                contract.size
            } else {
                1.0
            },
        }
    }

    /// Refresh the BBO and derived mid.
    pub fn update_quote(&mut self, bid: f64, ask: f64) {
        self.bid_price = bid;
        self.ask_price = ask;
        self.mid_price = 0.5 * (bid + ask);
    }
}

/// All options sharing one expiry under one underlying.
#[derive(Debug, Default)]
pub struct ChainData {
    pub chain_symbol: String,
    option_ids: Vec<usize>,
    calls: HashMap<String, usize>,
    puts: HashMap<String, usize>,
    indexes: Vec<String>,
    index_set: HashSet<String>,
    pub atm_price: f64,
    pub atm_index: String,
    pub days_to_expiry: i64,
    pub time_to_expiry: f64,
}

impl ChainData {
    fn new(chain_symbol: impl Into<String>) -> Self {
        Self {
            chain_symbol: chain_symbol.into(),
            ..Self::default()
        }
    }

    fn add_option(&mut self, id: usize, option: &OptionData, dte_ref: DateTime<Utc>) {
        self.option_ids.push(id);
        if let Some(index) = &option.chain_index {
            if option.is_call() {
                self.calls.insert(index.clone(), id);
            } else {
                self.puts.insert(index.clone(), id);
            }
            if self.index_set.insert(index.clone()) {
                self.indexes.push(index.clone());
            }
        }
        if self.days_to_expiry == 0 {
            if let Some(expiry) = option.option_expiry {
                let hours = (expiry - dte_ref).num_hours();
                self.days_to_expiry = if hours > 0 { hours / 24 } else { 0 };
                self.time_to_expiry = self.days_to_expiry as f64 / ANNUAL_TRADING_DAYS;
            }
        }
    }

    /// Sort strike indexes numerically; strings that fail to parse fall back
    /// to a lexicographic sort of the whole list.
    fn sort_indexes(&mut self) {
        if self.indexes.is_empty() {
            return;
        }
        let mut keyed: Vec<(f64, String)> = Vec::with_capacity(self.indexes.len());
        let mut numeric = true;
        for index in &self.indexes {
            match index.parse::<f64>() {
                Ok(value) => keyed.push((value, index.clone())),
                Err(_) => {
                    numeric = false;
                    break;
                }
            }
        }
        if numeric {
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            self.indexes = keyed.into_iter().map(|(_, s)| s).collect();
        } else {
            self.indexes.sort();
        }
    }

    /// Ids of this chain's options in insertion order.
    #[must_use]
    pub fn option_ids(&self) -> &[usize] {
        &self.option_ids
    }

    /// Sorted strike-index strings.
    #[must_use]
    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    #[must_use]
    pub fn call_id(&self, index: &str) -> Option<usize> {
        self.calls.get(index).copied()
    }

    #[must_use]
    pub fn put_id(&self, index: &str) -> Option<usize> {
        self.puts.get(index).copied()
    }

    /// Re-select the at-the-money strike.
    ///
    /// With a live spot the nearest strike wins (first of the sorted list on
    /// ties); with no spot the median of the sorted strikes anchors the
    /// chain.
    fn calculate_atm_price(&mut self, options: &[OptionData], spot: f64) {
        let mut entries: Vec<(f64, String)> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for (index, id) in self.calls.iter().chain(self.puts.iter()) {
            if let Some(strike) = options[*id].strike_price {
                if seen.insert(index.as_str()) {
                    entries.push((strike, index.clone()));
                }
            }
        }
        if entries.is_empty() {
            self.atm_price = 0.0;
            self.atm_index.clear();
            return;
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (strike, index) = if spot > 0.0 {
            // First of the sorted strikes wins ties.
            let mut best = entries[0].clone();
            for entry in &entries[1..] {
                if (entry.0 - spot).abs() < (best.0 - spot).abs() {
                    best = entry.clone();
                }
            }
            best
        } else {
            entries[entries.len() / 2].clone()
        };
        self.atm_price = strike;
        self.atm_index = index;
    }

    /// Mid IV at the ATM strike, preferring the call side.
    #[must_use]
    pub fn atm_iv(&self, options: &[OptionData]) -> Option<f64> {
        if self.atm_index.is_empty() {
            return None;
        }
        for id in [
            self.calls.get(&self.atm_index),
            self.puts.get(&self.atm_index),
        ]
        .into_iter()
        .flatten()
        {
            let iv = options[*id].mid_iv;
            if iv != 0.0 {
                return Some(iv);
            }
        }
        None
    }

    fn best_iv<'a, I>(ids: I, options: &[OptionData], spot: f64, target: f64) -> Option<f64>
    where
        I: Iterator<Item = &'a usize>,
    {
        let mut best = None;
        let mut min_diff = f64::MAX;
        for &id in ids {
            let opt = &options[id];
            if opt.mid_iv == 0.0 || !opt.is_otm(spot) {
                continue;
            }
            let size = if opt.size != 0.0 { opt.size } else { 1.0 };
            let per_unit_delta = opt.delta / size;
            let diff = (per_unit_delta.abs() - target).abs();
            if diff < min_diff {
                min_diff = diff;
                best = Some(opt.mid_iv);
            }
        }
        best
    }

    /// Call/put IV ratio at the OTM options closest to `delta_target`
    /// (expressed in delta points, default 25).
    #[must_use]
    pub fn skew(&self, options: &[OptionData], spot: f64, delta_target: f64) -> Option<f64> {
        let target = delta_target / 100.0;
        let call_iv = Self::best_iv(self.calls.values(), options, spot, target)?;
        let put_iv = Self::best_iv(self.puts.values(), options, spot, target)?;
        if put_iv == 0.0 {
            return None;
        }
        Some(call_iv / put_iv)
    }
}

/// Named container of chains and an underlying, with the frozen apply order
/// that aligns compact snapshots to option slots.
#[derive(Debug)]
pub struct Portfolio {
    pub name: String,
    options: Vec<OptionData>,
    option_index: HashMap<Symbol, usize>,
    chains: BTreeMap<String, ChainData>,
    underlying: Option<UnderlyingData>,
    pub underlying_symbol: Symbol,
    apply_order: Vec<usize>,
    finalized: bool,
    risk_free_rate: f64,
    iv_price_mode: IvPriceMode,
    dte_ref: DateTime<Utc>,
}

impl Portfolio {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Vec::new(),
            option_index: HashMap::new(),
            chains: BTreeMap::new(),
            underlying: None,
            underlying_symbol: Symbol::new(),
            apply_order: Vec::new(),
            finalized: false,
            risk_free_rate: 0.05,
            iv_price_mode: IvPriceMode::Mid,
            dte_ref: Utc::now(),
        }
    }

    pub fn set_risk_free_rate(&mut self, rate: f64) {
        if rate.is_finite() {
            self.risk_free_rate = rate;
        }
    }

    pub fn set_iv_price_mode(&mut self, mode: IvPriceMode) {
        self.iv_price_mode = mode;
    }

    /// Reference timestamp for days-to-expiry, so a historical run computes
    /// DTE against its data window instead of wall clock.
    pub fn set_dte_ref(&mut self, reference: DateTime<Utc>) {
        self.dte_ref = reference;
    }

    #[must_use]
    pub fn dte_ref(&self) -> DateTime<Utc> {
        self.dte_ref
    }

    pub fn set_underlying(&mut self, contract: &ContractData) {
        self.underlying = Some(UnderlyingData::from_contract(contract));
        self.underlying_symbol = contract.symbol.clone();
    }

    #[must_use]
    pub fn underlying(&self) -> Option<&UnderlyingData> {
        self.underlying.as_ref()
    }

    pub fn underlying_mut(&mut self) -> Option<&mut UnderlyingData> {
        self.underlying.as_mut()
    }

    /// Register (or replace) an option contract and link it into its chain.
    /// Invalidates the apply order until the next [`Self::finalize_chains`].
    pub fn add_option(&mut self, contract: &ContractData) {
        let option = OptionData::from_contract(contract);
        let chain_symbol = option.chain_symbol.clone();
        match self.option_index.get(&contract.symbol) {
            Some(&existing) => {
                self.options[existing] = option;
            }
            None => {
                self.options.push(option);
                let id = self.options.len() - 1;
                self.option_index.insert(contract.symbol.clone(), id);
                let chain = self
                    .chains
                    .entry(chain_symbol.clone())
                    .or_insert_with(|| ChainData::new(chain_symbol));
                chain.add_option(id, &self.options[id], self.dte_ref);
            }
        }
        self.finalized = false;
    }

    /// Sort every chain's strike indexes and rebuild the apply order:
    /// chains in key order, options in symbol order within each chain.
    pub fn finalize_chains(&mut self) {
        for chain in self.chains.values_mut() {
            chain.sort_indexes();
        }
        let options = &self.options;
        let mut order = Vec::with_capacity(options.len());
        for chain in self.chains.values() {
            let mut ids = chain.option_ids.clone();
            ids.sort_by(|&a, &b| options[a].symbol.cmp(&options[b].symbol));
            order.extend(ids);
        }
        self.apply_order = order;
        self.finalized = true;
    }

    /// The fixed sequence of option slots that compact snapshots index.
    #[must_use]
    pub fn option_apply_order(&self) -> &[usize] {
        &self.apply_order
    }

    #[must_use]
    pub fn options(&self) -> &[OptionData] {
        &self.options
    }

    #[must_use]
    pub fn option(&self, symbol: &str) -> Option<&OptionData> {
        self.option_index.get(symbol).map(|&id| &self.options[id])
    }

    #[must_use]
    pub fn option_id(&self, symbol: &str) -> Option<usize> {
        self.option_index.get(symbol).copied()
    }

    #[must_use]
    pub fn chain(&self, chain_symbol: &str) -> Option<&ChainData> {
        self.chains.get(chain_symbol)
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainData> {
        self.chains.values()
    }

    /// Chain keys whose days-to-expiry falls in `[min_dte, max_dte]`, in key
    /// order so the nearest expiry comes first.
    #[must_use]
    pub fn chains_by_expiry(&self, min_dte: i64, max_dte: i64) -> Vec<String> {
        self.chains
            .iter()
            .filter(|(_, chain)| (min_dte..=max_dte).contains(&chain.days_to_expiry))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Apply a compact market frame: write the underlying BBO, recompute IV
    /// and greeks for every option slot in parallel, write results back, and
    /// refresh every chain's ATM selection.
    ///
    /// A frame whose vectors do not match the apply order length is dropped
    /// with a warning; an unfinalized portfolio likewise.
    pub fn apply_frame(&mut self, snapshot: &PortfolioSnapshot) {
        self.apply_frame_with(snapshot, true);
    }

    /// Run the solver single-threaded; used to cross-check determinism of
    /// the parallel path.
    pub fn apply_frame_serial(&mut self, snapshot: &PortfolioSnapshot) {
        self.apply_frame_with(snapshot, false);
    }

    fn apply_frame_with(&mut self, snapshot: &PortfolioSnapshot, parallel: bool) {
        if let Some(underlying) = &mut self.underlying {
            underlying.bid_price = snapshot.underlying_bid;
            underlying.ask_price = snapshot.underlying_ask;
            underlying.mid_price = snapshot.underlying_last;
        }
        if !self.finalized {
            warn!(portfolio = %self.name, "apply_frame before finalize_chains; frame dropped");
            return;
        }
        let n = self.apply_order.len();
        if snapshot.bid.len() != n || snapshot.ask.len() != n || snapshot.last.len() != n {
            warn!(
                portfolio = %self.name,
                expected = n,
                got = snapshot.bid.len(),
                "snapshot length mismatch; frame dropped"
            );
            return;
        }

        let spot = snapshot_spot(snapshot);
        let mut slots = vec![GreekSlot::default(); n];
        if parallel {
            self.solve_slots(snapshot, spot, &mut slots);
        } else {
            for (pos, slot) in slots.iter_mut().enumerate() {
                let opt = &self.options[self.apply_order[pos]];
                solve_one(
                    opt,
                    snapshot,
                    pos,
                    spot,
                    self.risk_free_rate,
                    self.iv_price_mode,
                    slot,
                );
            }
        }

        for (pos, &id) in self.apply_order.iter().enumerate() {
            let opt = &mut self.options[id];
            let bid = snapshot.bid[pos];
            let ask = snapshot.ask[pos];
            let last = snapshot.last[pos];
            opt.bid_price = bid;
            opt.ask_price = ask;
            opt.mid_price = if bid > 0.0 && ask > 0.0 {
                0.5 * (bid + ask)
            } else if bid > 0.0 {
                bid
            } else {
                last
            };
            let size = if opt.size != 0.0 { opt.size } else { 1.0 };
            let slot = &slots[pos];
            opt.delta = slot.delta * size;
            opt.gamma = slot.gamma * size;
            opt.theta = slot.theta * size;
            opt.vega = slot.vega * size;
            opt.mid_iv = slot.iv;
        }

        self.calculate_atm_price();
    }

    /// Partition the option slots across hardware threads. Every worker
    /// writes only its own disjoint chunk of `slots`, so no synchronization
    /// is needed; the join at scope exit publishes the results.
    fn solve_slots(&self, snapshot: &PortfolioSnapshot, spot: f64, slots: &mut [GreekSlot]) {
        let n = slots.len();
        if n == 0 {
            return;
        }
        let workers = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let chunk = n.div_ceil(workers);
        let options = &self.options;
        let apply_order = &self.apply_order;
        let rate = self.risk_free_rate;
        let mode = self.iv_price_mode;
        thread::scope(|scope| {
            for (w, chunk_slots) in slots.chunks_mut(chunk).enumerate() {
                let start = w * chunk;
                scope.spawn(move || {
                    for (offset, slot) in chunk_slots.iter_mut().enumerate() {
                        let pos = start + offset;
                        let opt = &options[apply_order[pos]];
                        solve_one(opt, snapshot, pos, spot, rate, mode, slot);
                    }
                });
            }
        });
    }

    /// Refresh the ATM strike of every chain against the current mid.
    pub fn calculate_atm_price(&mut self) {
        let spot = self
            .underlying
            .as_ref()
            .map_or(0.0, |underlying| underlying.mid_price);
        let options = &self.options;
        for chain in self.chains.values_mut() {
            chain.calculate_atm_price(options, spot);
        }
    }
}

/// IV input spot: underlying BBO mid when quoted, else the last value.
fn snapshot_spot(snapshot: &PortfolioSnapshot) -> f64 {
    if snapshot.underlying_bid > 0.0 || snapshot.underlying_ask > 0.0 {
        if snapshot.underlying_bid > 0.0 && snapshot.underlying_ask > 0.0 {
            0.5 * (snapshot.underlying_bid + snapshot.underlying_ask)
        } else if snapshot.underlying_bid > 0.0 {
            snapshot.underlying_bid
        } else {
            snapshot.underlying_ask
        }
    } else {
        snapshot.underlying_last
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct GreekSlot {
    iv: f64,
    delta: f64,
    gamma: f64,
    theta: f64,
    vega: f64,
}

fn solve_one(
    opt: &OptionData,
    snapshot: &PortfolioSnapshot,
    pos: usize,
    spot: f64,
    rate: f64,
    mode: IvPriceMode,
    slot: &mut GreekSlot,
) {
    let strike = opt.strike_price.unwrap_or(0.0);
    let t = years_to_expiry(snapshot.datetime, opt.option_expiry);
    if spot <= 0.0 || strike <= 0.0 || t <= 0.0 {
        return;
    }
    let price = pick_iv_input_price(snapshot.bid[pos], snapshot.ask[pos], mode);
    if price <= 0.0 {
        return;
    }
    let is_call = opt.is_call();
    let iv = implied_volatility(price, spot, strike, t, is_call);
    let greeks = bs_greeks(is_call, spot, strike, t, rate, iv);
    slot.iv = iv;
    slot.delta = greeks.delta;
    slot.gamma = greeks.gamma;
    slot.theta = greeks.theta;
    slot.vega = greeks.vega;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use voltra_core::util::option_symbol;
    use voltra_core::Product;

    fn option_contract(
        underlying: &str,
        expiry: DateTime<Utc>,
        option_type: OptionType,
        strike: f64,
    ) -> ContractData {
        let symbol = option_symbol(underlying, expiry, option_type, strike, 100);
        ContractData {
            symbol: symbol.clone(),
            exchange: Exchange::Local,
            name: symbol,
            product: Product::Option,
            size: 100.0,
            pricetick: 0.01,
            min_volume: 1.0,
            option_strike: Some(strike),
            option_underlying: Some(underlying.to_string()),
            option_type: Some(option_type),
            option_expiry: Some(expiry),
            option_index: Some(format!("{}", strike as i64)),
        }
    }

    fn underlying_contract(symbol: &str) -> ContractData {
        ContractData {
            symbol: symbol.to_string(),
            exchange: Exchange::Local,
            name: symbol.to_string(),
            product: Product::Index,
            size: 1.0,
            pricetick: 0.01,
            min_volume: 1.0,
            ..ContractData::default()
        }
    }

    fn seeded_portfolio(strikes: &[f64]) -> (Portfolio, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2026, 2, 23, 15, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2026, 3, 2, 21, 0, 0).unwrap();
        let mut portfolio = Portfolio::new("backtest");
        portfolio.set_dte_ref(start);
        portfolio.set_underlying(&underlying_contract("SPXW"));
        for &strike in strikes {
            portfolio.add_option(&option_contract("SPXW", expiry, OptionType::Call, strike));
            portfolio.add_option(&option_contract("SPXW", expiry, OptionType::Put, strike));
        }
        portfolio.finalize_chains();
        (portfolio, start)
    }

    fn flat_snapshot(portfolio: &Portfolio, at: DateTime<Utc>, bid: f64, ask: f64) -> PortfolioSnapshot {
        let n = portfolio.option_apply_order().len();
        PortfolioSnapshot {
            portfolio_name: portfolio.name.clone(),
            datetime: at,
            underlying_bid: 4499.5,
            underlying_ask: 4500.5,
            underlying_last: 4500.0,
            bid: vec![bid; n],
            ask: vec![ask; n],
            last: vec![0.5 * (bid + ask); n],
            ..PortfolioSnapshot::default()
        }
    }

    #[test]
    fn finalize_sorts_indexes_and_apply_order() {
        let (portfolio, _) = seeded_portfolio(&[4600.0, 4400.0, 4500.0]);
        let chain = portfolio.chain("SPXW_20260302").unwrap();
        assert_eq!(chain.indexes(), ["4400", "4500", "4600"]);
        let order = portfolio.option_apply_order();
        let symbols: Vec<_> = order
            .iter()
            .map(|&id| portfolio.options()[id].symbol.clone())
            .collect();
        let mut sorted = symbols.clone();
        sorted.sort();
        assert_eq!(symbols, sorted);
    }

    #[test]
    fn apply_frame_writes_iv_and_scaled_greeks() {
        let (mut portfolio, start) = seeded_portfolio(&[4400.0, 4500.0, 4600.0]);
        let snapshot = flat_snapshot(&portfolio, start, 49.0, 51.0);
        portfolio.apply_frame(&snapshot);
        for &id in portfolio.option_apply_order() {
            let opt = &portfolio.options()[id];
            assert_eq!(opt.bid_price, 49.0);
            assert_eq!(opt.mid_price, 50.0);
            assert!(opt.mid_iv > 0.0 && opt.mid_iv <= voltra_quant::MAX_VOL);
            assert!(opt.delta.abs() <= opt.size);
        }
        let chain = portfolio.chain("SPXW_20260302").unwrap();
        assert_eq!(chain.atm_index, "4500");
    }

    #[test]
    fn length_mismatch_is_a_no_op_for_options() {
        let (mut portfolio, start) = seeded_portfolio(&[4500.0]);
        let mut snapshot = flat_snapshot(&portfolio, start, 10.0, 11.0);
        snapshot.bid.push(1.0);
        portfolio.apply_frame(&snapshot);
        for opt in portfolio.options() {
            assert_eq!(opt.bid_price, 0.0);
            assert_eq!(opt.mid_iv, 0.0);
        }
    }

    #[test]
    fn parallel_and_serial_apply_agree_bitwise() {
        let strikes: Vec<f64> = (0..60).map(|i| 4200.0 + 10.0 * i as f64).collect();
        let (mut parallel, start) = seeded_portfolio(&strikes);
        let (mut serial, _) = seeded_portfolio(&strikes);
        let snapshot = flat_snapshot(&parallel, start, 24.6, 25.4);
        parallel.apply_frame(&snapshot);
        serial.apply_frame_serial(&snapshot);
        for (a, b) in parallel.options().iter().zip(serial.options()) {
            assert_eq!(a.mid_iv.to_bits(), b.mid_iv.to_bits(), "{}", a.symbol);
            assert_eq!(a.delta.to_bits(), b.delta.to_bits());
            assert_eq!(a.gamma.to_bits(), b.gamma.to_bits());
            assert_eq!(a.theta.to_bits(), b.theta.to_bits());
            assert_eq!(a.vega.to_bits(), b.vega.to_bits());
        }
    }

    #[test]
    fn atm_median_when_spot_dark() {
        let (mut portfolio, start) = seeded_portfolio(&[4400.0, 4500.0, 4600.0]);
        let mut snapshot = flat_snapshot(&portfolio, start, 10.0, 11.0);
        snapshot.underlying_bid = 0.0;
        snapshot.underlying_ask = 0.0;
        snapshot.underlying_last = 0.0;
        portfolio.apply_frame(&snapshot);
        let chain = portfolio.chain("SPXW_20260302").unwrap();
        assert_eq!(chain.atm_index, "4500");
    }

    #[test]
    fn chains_by_expiry_filters_on_dte() {
        let (portfolio, _) = seeded_portfolio(&[4500.0]);
        assert_eq!(portfolio.chains_by_expiry(7, 7), ["SPXW_20260302"]);
        assert!(portfolio.chains_by_expiry(8, 30).is_empty());
    }

    #[test]
    fn unfinalized_portfolio_drops_frames() {
        let (mut portfolio, start) = seeded_portfolio(&[4500.0]);
        let expiry = Utc.with_ymd_and_hms(2026, 3, 2, 21, 0, 0).unwrap();
        portfolio.add_option(&option_contract("SPXW", expiry, OptionType::Call, 4700.0));
        let snapshot = flat_snapshot(&portfolio, start, 10.0, 11.0);
        portfolio.apply_frame(&snapshot);
        assert!(portfolio.options().iter().all(|o| o.mid_iv == 0.0));
        portfolio.finalize_chains();
        let snapshot = flat_snapshot(&portfolio, start, 10.0, 11.0);
        portfolio.apply_frame(&snapshot);
        assert!(portfolio.options().iter().any(|o| o.mid_iv > 0.0));
    }
}
