//! Parquet-backed historical frames and the snapshot precompute.
//!
//! The loader groups quote rows by `ts_recv` into frames, builds the
//! portfolio and contract set from the symbols it saw, and then converts
//! every frame into a positional [`PortfolioSnapshot`] against the frozen
//! apply order, carrying unquoted options forward from the previous frame.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, Float64Array, StringArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{info, warn};
use voltra_core::util::{option_symbol, STOCK_SUFFIX};
use voltra_core::{ContractData, Exchange, PortfolioSnapshot, Product, Symbol};
use voltra_portfolio::Portfolio;
use voltra_quant::IvPriceMode;

use crate::occ::parse_occ_symbol;

const TIME_COLUMN: &str = "ts_recv";

/// One option quote row inside a frame.
#[derive(Clone, Debug, Default)]
pub struct QuoteRow {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    pub underlying_bid: f64,
    pub underlying_ask: f64,
}

/// All rows sharing one `ts_recv` value.
#[derive(Clone, Debug)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub rows: Vec<QuoteRow>,
}

/// Summary of a completed load.
#[derive(Clone, Debug, Default)]
pub struct LoadMeta {
    pub row_count: usize,
    pub frame_count: usize,
    pub option_count: usize,
    pub ts_start: Option<DateTime<Utc>>,
    pub ts_end: Option<DateTime<Utc>>,
}

/// Owns the loaded frames, the portfolio built from them, and the
/// precomputed per-frame snapshots the backtest replays.
pub struct HistoricalDataEngine {
    underlying_symbol: String,
    risk_free_rate: f64,
    iv_price_mode: IvPriceMode,
    portfolio: Option<Portfolio>,
    contracts: HashMap<Symbol, ContractData>,
    snapshots: Vec<PortfolioSnapshot>,
    meta: LoadMeta,
}

impl Default for HistoricalDataEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoricalDataEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            underlying_symbol: String::new(),
            risk_free_rate: 0.05,
            iv_price_mode: IvPriceMode::Mid,
            portfolio: None,
            contracts: HashMap::new(),
            snapshots: Vec::new(),
            meta: LoadMeta::default(),
        }
    }

    pub fn set_risk_free_rate(&mut self, rate: f64) {
        if rate.is_finite() {
            self.risk_free_rate = rate;
        }
        if let Some(portfolio) = &mut self.portfolio {
            portfolio.set_risk_free_rate(rate);
        }
    }

    pub fn set_iv_price_mode(&mut self, mode: IvPriceMode) {
        self.iv_price_mode = mode;
        if let Some(portfolio) = &mut self.portfolio {
            portfolio.set_iv_price_mode(mode);
        }
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.portfolio.is_some() && !self.snapshots.is_empty()
    }

    #[must_use]
    pub fn meta(&self) -> &LoadMeta {
        &self.meta
    }

    #[must_use]
    pub fn portfolio(&self) -> Option<&Portfolio> {
        self.portfolio.as_ref()
    }

    pub fn portfolio_mut(&mut self) -> Option<&mut Portfolio> {
        self.portfolio.as_mut()
    }

    /// Take ownership of the loaded portfolio, leaving the engine drained.
    pub fn take_portfolio(&mut self) -> Option<Portfolio> {
        self.portfolio.take()
    }

    #[must_use]
    pub fn contracts(&self) -> &HashMap<Symbol, ContractData> {
        &self.contracts
    }

    #[must_use]
    pub fn snapshots(&self) -> &[PortfolioSnapshot] {
        &self.snapshots
    }

    /// Load one parquet file and build portfolio, contracts, and snapshots.
    /// The underlying root is inferred from the path when not provided.
    pub fn load_parquet(&mut self, path: &Path, underlying_symbol: Option<&str>) -> Result<()> {
        let underlying = match underlying_symbol {
            Some(symbol) if !symbol.is_empty() => symbol.to_string(),
            _ => crate::occ::infer_underlying_from_filename(&path.to_string_lossy()),
        };
        let frames =
            read_frames(path).with_context(|| format!("failed to load {}", path.display()))?;
        self.load_frames(&underlying, frames)
    }

    /// Build state from already-grouped frames. This is the seam the tests
    /// and the backtest harness share with the parquet path.
    pub fn load_frames(&mut self, underlying_symbol: &str, frames: Vec<Frame>) -> Result<()> {
        if frames.is_empty() {
            bail!("no frames in input data");
        }
        self.underlying_symbol = if underlying_symbol.is_empty() {
            "UNKNOWN".to_string()
        } else {
            underlying_symbol.to_string()
        };
        self.portfolio = None;
        self.contracts.clear();
        self.snapshots.clear();

        // DTE reference: midnight UTC of the first frame, so chain selection
        // is deterministic from the data window rather than wall clock.
        let first_ts = frames[0].timestamp;
        let dte_ref = Utc
            .from_utc_datetime(&first_ts.date_naive().and_time(NaiveTime::MIN));

        let mut symbols: Vec<&str> = {
            let mut set: HashSet<&str> = HashSet::new();
            for frame in &frames {
                for row in &frame.rows {
                    set.insert(row.symbol.as_str());
                }
            }
            set.into_iter().collect()
        };
        symbols.sort_unstable();

        let mut portfolio = Portfolio::new("backtest");
        portfolio.set_dte_ref(dte_ref);
        portfolio.set_risk_free_rate(self.risk_free_rate);
        portfolio.set_iv_price_mode(self.iv_price_mode);

        // The tradable underlying carries the stock suffix so its fills
        // route to the underlying position bucket.
        let underlying_contract = ContractData {
            symbol: format!("{}{STOCK_SUFFIX}", self.underlying_symbol),
            exchange: Exchange::Local,
            name: self.underlying_symbol.clone(),
            product: Product::Index,
            size: 1.0,
            pricetick: 0.01,
            min_volume: 1.0,
            ..ContractData::default()
        };
        portfolio.set_underlying(&underlying_contract);
        self.contracts
            .insert(underlying_contract.symbol.clone(), underlying_contract);

        let mut occ_to_platform: HashMap<String, Symbol> = HashMap::new();
        let mut option_count = 0usize;
        for occ in &symbols {
            let Some((expiry, strike, option_type)) = parse_occ_symbol(occ) else {
                warn!(symbol = %occ, "unparseable OCC symbol skipped");
                continue;
            };
            let platform = option_symbol(&self.underlying_symbol, expiry, option_type, strike, 100);
            let contract = ContractData {
                symbol: platform.clone(),
                exchange: Exchange::Local,
                name: (*occ).to_string(),
                product: Product::Option,
                size: 100.0,
                pricetick: 0.01,
                min_volume: 1.0,
                option_strike: Some(strike),
                option_underlying: Some(self.underlying_symbol.clone()),
                option_type: Some(option_type),
                option_expiry: Some(expiry),
                option_index: Some(format!("{}", strike as i64)),
            };
            portfolio.add_option(&contract);
            self.contracts.insert(platform.clone(), contract);
            occ_to_platform.insert((*occ).to_string(), platform);
            option_count += 1;
        }
        portfolio.finalize_chains();

        // OCC symbol -> slot in the frozen apply order.
        let mut occ_to_slot: HashMap<&str, usize> = HashMap::new();
        let slot_by_symbol: HashMap<&str, usize> = portfolio
            .option_apply_order()
            .iter()
            .enumerate()
            .map(|(pos, &id)| (portfolio.options()[id].symbol.as_str(), pos))
            .collect();
        for (occ, platform) in &occ_to_platform {
            if let Some(&slot) = slot_by_symbol.get(platform.as_str()) {
                occ_to_slot.insert(occ.as_str(), slot);
            }
        }

        let n = portfolio.option_apply_order().len();
        let mut row_count = 0usize;
        let mut snapshots: Vec<PortfolioSnapshot> = Vec::with_capacity(frames.len());
        for frame in &frames {
            row_count += frame.rows.len();
            let mut snapshot = match snapshots.last() {
                Some(prev) => PortfolioSnapshot {
                    portfolio_name: portfolio.name.clone(),
                    datetime: frame.timestamp,
                    underlying_bid: 0.0,
                    underlying_ask: 0.0,
                    underlying_last: 0.0,
                    bid: prev.bid.clone(),
                    ask: prev.ask.clone(),
                    last: prev.last.clone(),
                    ..PortfolioSnapshot::default()
                },
                None => PortfolioSnapshot {
                    portfolio_name: portfolio.name.clone(),
                    datetime: frame.timestamp,
                    bid: vec![0.0; n],
                    ask: vec![0.0; n],
                    last: vec![0.0; n],
                    ..PortfolioSnapshot::default()
                },
            };
            let mut underlying_bid = 0.0;
            let mut underlying_ask = 0.0;
            for row in &frame.rows {
                if row.underlying_bid > 0.0 {
                    underlying_bid = row.underlying_bid;
                }
                if row.underlying_ask > 0.0 {
                    underlying_ask = row.underlying_ask;
                }
                let Some(&slot) = occ_to_slot.get(row.symbol.as_str()) else {
                    continue;
                };
                snapshot.bid[slot] = row.bid;
                snapshot.ask[slot] = row.ask;
                snapshot.last[slot] = if row.bid > 0.0 && row.ask > 0.0 {
                    0.5 * (row.bid + row.ask)
                } else if row.bid > 0.0 {
                    row.bid
                } else {
                    row.ask
                };
            }
            snapshot.underlying_bid = underlying_bid;
            snapshot.underlying_ask = underlying_ask;
            snapshot.underlying_last = if underlying_bid > 0.0 && underlying_ask > 0.0 {
                0.5 * (underlying_bid + underlying_ask)
            } else if underlying_bid > 0.0 {
                underlying_bid
            } else {
                underlying_ask
            };
            snapshots.push(snapshot);
        }

        self.meta = LoadMeta {
            row_count,
            frame_count: frames.len(),
            option_count,
            ts_start: frames.first().map(|frame| frame.timestamp),
            ts_end: frames.last().map(|frame| frame.timestamp),
        };
        info!(
            underlying = %self.underlying_symbol,
            frames = self.meta.frame_count,
            options = option_count,
            rows = row_count,
            "historical data loaded"
        );
        self.portfolio = Some(portfolio);
        self.snapshots = snapshots;
        Ok(())
    }
}

/// Read a parquet file and group its rows by `ts_recv`.
///
/// Non-decreasing timestamps group in a single pass; out-of-order input
/// falls back to map-grouping, which sorts by timestamp.
pub fn read_frames(path: &Path) -> Result<Vec<Frame>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("failed to read parquet metadata")?
        .with_batch_size(8_192)
        .build()
        .context("failed to build parquet reader")?;

    let mut ordered: Vec<(i64, QuoteRow)> = Vec::new();
    let mut in_order = true;
    let mut prev_ts = i64::MIN;
    for batch in reader {
        let batch = batch.context("failed to decode record batch")?;
        decode_batch(&batch, &mut |ts, row| {
            if ts < prev_ts {
                in_order = false;
            }
            prev_ts = ts;
            ordered.push((ts, row));
        })?;
    }

    if in_order {
        let mut frames: Vec<Frame> = Vec::new();
        let mut current_ts = i64::MIN;
        for (ts, row) in ordered {
            if frames.is_empty() || ts != current_ts {
                frames.push(Frame {
                    timestamp: nanos_to_datetime(ts)?,
                    rows: Vec::new(),
                });
                current_ts = ts;
            }
            frames
                .last_mut()
                .expect("frame pushed above")
                .rows
                .push(row);
        }
        Ok(frames)
    } else {
        let mut grouped: BTreeMap<i64, Vec<QuoteRow>> = BTreeMap::new();
        for (ts, row) in ordered {
            grouped.entry(ts).or_default().push(row);
        }
        grouped
            .into_iter()
            .map(|(ts, rows)| {
                Ok(Frame {
                    timestamp: nanos_to_datetime(ts)?,
                    rows,
                })
            })
            .collect()
    }
}

fn nanos_to_datetime(nanos: i64) -> Result<DateTime<Utc>> {
    let secs = nanos.div_euclid(1_000_000_000);
    let sub = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, sub)
        .with_context(|| format!("timestamp overflow for {nanos}"))
}

fn decode_batch(batch: &RecordBatch, sink: &mut impl FnMut(i64, QuoteRow)) -> Result<()> {
    let schema = batch.schema();
    let column = |name: &str| -> Result<usize> {
        schema
            .column_with_name(name)
            .map(|(idx, _)| idx)
            .with_context(|| format!("column '{name}' missing from parquet schema"))
    };
    let ts_idx = column(TIME_COLUMN)?;
    let symbol_idx = column("symbol")?;
    let bid_idx = column("bid_px")?;
    let ask_idx = column("ask_px")?;
    let und_bid_idx = column("underlying_bid_px")?;
    let und_ask_idx = column("underlying_ask_px")?;

    let symbols = batch
        .column(symbol_idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .context("symbol column is not utf8")?;
    let bids = float_column(batch, bid_idx, "bid_px")?;
    let asks = float_column(batch, ask_idx, "ask_px")?;
    let und_bids = float_column(batch, und_bid_idx, "underlying_bid_px")?;
    let und_asks = float_column(batch, und_ask_idx, "underlying_ask_px")?;

    for row in 0..batch.num_rows() {
        let ts = timestamp_nanos(batch, ts_idx, row)?;
        if symbols.is_null(row) {
            continue;
        }
        sink(
            ts,
            QuoteRow {
                symbol: symbols.value(row).to_string(),
                bid: value_or_zero(bids, row),
                ask: value_or_zero(asks, row),
                underlying_bid: value_or_zero(und_bids, row),
                underlying_ask: value_or_zero(und_asks, row),
            },
        );
    }
    Ok(())
}

fn float_column<'a>(batch: &'a RecordBatch, idx: usize, name: &str) -> Result<&'a Float64Array> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Float64Array>()
        .with_context(|| format!("column '{name}' is not float64"))
}

fn value_or_zero(array: &Float64Array, row: usize) -> f64 {
    if array.is_null(row) {
        0.0
    } else {
        array.value(row)
    }
}

fn timestamp_nanos(batch: &RecordBatch, idx: usize, row: usize) -> Result<i64> {
    let column = batch.column(idx);
    match column.data_type() {
        DataType::Timestamp(unit, _) => {
            use arrow::datatypes::TimeUnit;
            let nanos = match unit {
                TimeUnit::Nanosecond => column
                    .as_any()
                    .downcast_ref::<TimestampNanosecondArray>()
                    .context("nanosecond column downcast failed")?
                    .value(row),
                TimeUnit::Microsecond => {
                    column
                        .as_any()
                        .downcast_ref::<TimestampMicrosecondArray>()
                        .context("microsecond column downcast failed")?
                        .value(row)
                        * 1_000
                }
                TimeUnit::Millisecond => {
                    column
                        .as_any()
                        .downcast_ref::<TimestampMillisecondArray>()
                        .context("millisecond column downcast failed")?
                        .value(row)
                        * 1_000_000
                }
                TimeUnit::Second => bail!("second-resolution timestamps unsupported"),
            };
            Ok(nanos)
        }
        other => bail!("unsupported {TIME_COLUMN} type: {other}"),
    }
}
