//! Historical market-data ingestion for the backtester: the OCC symbol
//! grammar and the parquet frame loader that turns quote rows into compact
//! portfolio snapshots.

pub mod history;
pub mod occ;

pub use history::{Frame, HistoricalDataEngine, LoadMeta, QuoteRow};
pub use occ::{infer_underlying_from_filename, parse_occ_symbol};
