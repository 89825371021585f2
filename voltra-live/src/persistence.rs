//! Durable state: contracts, orders, trades, and holding checkpoints.
//!
//! One SQLite connection per live engine; every call takes a scoped lock so
//! the gateway, market-data, and dispatcher threads serialize on it. Rows
//! store the typed payload as JSON keyed by the platform identifiers.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use voltra_core::{ContractData, OrderData, TradeData};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Persistence seam of the live runtime.
pub trait TradingRepository: Send {
    fn save_contract(&self, contract: &ContractData) -> RepositoryResult<()>;

    fn load_contracts(&self) -> RepositoryResult<Vec<ContractData>>;

    /// Remove option contracts whose expiry predates `today`. Returns the
    /// number of rows purged.
    fn purge_expired_options(&self, today: DateTime<Utc>) -> RepositoryResult<usize>;

    fn save_order(&self, strategy_name: &str, order: &OrderData) -> RepositoryResult<()>;

    fn load_orders(&self, strategy_name: &str) -> RepositoryResult<Vec<OrderData>>;

    fn save_trade(&self, strategy_name: &str, trade: &TradeData) -> RepositoryResult<()>;

    fn load_trades(&self, strategy_name: &str) -> RepositoryResult<Vec<TradeData>>;

    fn save_holding(&self, strategy_name: &str, record: &[u8]) -> RepositoryResult<()>;

    fn load_holding(&self, strategy_name: &str) -> RepositoryResult<Option<Vec<u8>>>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contracts (
    symbol TEXT PRIMARY KEY,
    is_option INTEGER NOT NULL DEFAULT 0,
    expiry TEXT,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS orders (
    orderid TEXT PRIMARY KEY,
    strategy TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS trades (
    tradeid TEXT PRIMARY KEY,
    strategy TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS holdings (
    strategy TEXT PRIMARY KEY,
    payload BLOB NOT NULL
);
"#;

/// [`TradingRepository`] backed by a single SQLite file.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open(path: &Path) -> RepositoryResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> RepositoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TradingRepository for SqliteRepository {
    fn save_contract(&self, contract: &ContractData) -> RepositoryResult<()> {
        let payload = serde_json::to_string(contract)?;
        let expiry = contract.option_expiry.map(|e| e.to_rfc3339());
        let conn = self.conn.lock().expect("repository poisoned");
        conn.execute(
            "INSERT INTO contracts (symbol, is_option, expiry, payload)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol) DO UPDATE SET
                 is_option = excluded.is_option,
                 expiry = excluded.expiry,
                 payload = excluded.payload",
            params![
                contract.symbol,
                contract.is_option() as i64,
                expiry,
                payload
            ],
        )?;
        Ok(())
    }

    fn load_contracts(&self) -> RepositoryResult<Vec<ContractData>> {
        let conn = self.conn.lock().expect("repository poisoned");
        let mut stmt = conn.prepare("SELECT payload FROM contracts")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut contracts = Vec::new();
        for payload in rows {
            contracts.push(serde_json::from_str(&payload?)?);
        }
        Ok(contracts)
    }

    fn purge_expired_options(&self, today: DateTime<Utc>) -> RepositoryResult<usize> {
        let conn = self.conn.lock().expect("repository poisoned");
        let purged = conn.execute(
            "DELETE FROM contracts WHERE is_option = 1 AND expiry IS NOT NULL AND expiry < ?1",
            params![today.to_rfc3339()],
        )?;
        Ok(purged)
    }

    fn save_order(&self, strategy_name: &str, order: &OrderData) -> RepositoryResult<()> {
        let payload = serde_json::to_string(order)?;
        let conn = self.conn.lock().expect("repository poisoned");
        conn.execute(
            "INSERT INTO orders (orderid, strategy, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(orderid) DO UPDATE SET strategy = excluded.strategy,
                 payload = excluded.payload",
            params![order.orderid, strategy_name, payload],
        )?;
        Ok(())
    }

    fn load_orders(&self, strategy_name: &str) -> RepositoryResult<Vec<OrderData>> {
        let conn = self.conn.lock().expect("repository poisoned");
        let mut stmt =
            conn.prepare("SELECT payload FROM orders WHERE strategy = ?1 ORDER BY orderid")?;
        let rows = stmt.query_map(params![strategy_name], |row| row.get::<_, String>(0))?;
        let mut orders = Vec::new();
        for payload in rows {
            orders.push(serde_json::from_str(&payload?)?);
        }
        Ok(orders)
    }

    fn save_trade(&self, strategy_name: &str, trade: &TradeData) -> RepositoryResult<()> {
        let payload = serde_json::to_string(trade)?;
        let conn = self.conn.lock().expect("repository poisoned");
        conn.execute(
            "INSERT INTO trades (tradeid, strategy, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(tradeid) DO UPDATE SET strategy = excluded.strategy,
                 payload = excluded.payload",
            params![trade.tradeid, strategy_name, payload],
        )?;
        Ok(())
    }

    fn load_trades(&self, strategy_name: &str) -> RepositoryResult<Vec<TradeData>> {
        let conn = self.conn.lock().expect("repository poisoned");
        let mut stmt =
            conn.prepare("SELECT payload FROM trades WHERE strategy = ?1 ORDER BY tradeid")?;
        let rows = stmt.query_map(params![strategy_name], |row| row.get::<_, String>(0))?;
        let mut trades = Vec::new();
        for payload in rows {
            trades.push(serde_json::from_str(&payload?)?);
        }
        Ok(trades)
    }

    fn save_holding(&self, strategy_name: &str, record: &[u8]) -> RepositoryResult<()> {
        let conn = self.conn.lock().expect("repository poisoned");
        conn.execute(
            "INSERT INTO holdings (strategy, payload) VALUES (?1, ?2)
             ON CONFLICT(strategy) DO UPDATE SET payload = excluded.payload",
            params![strategy_name, record],
        )?;
        Ok(())
    }

    fn load_holding(&self, strategy_name: &str) -> RepositoryResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("repository poisoned");
        conn.query_row(
            "SELECT payload FROM holdings WHERE strategy = ?1",
            params![strategy_name],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(RepositoryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use voltra_core::{Exchange, OptionType, Product};

    fn option_contract(symbol: &str, expiry: DateTime<Utc>) -> ContractData {
        ContractData {
            symbol: symbol.into(),
            exchange: Exchange::Local,
            name: symbol.into(),
            product: Product::Option,
            size: 100.0,
            pricetick: 0.01,
            min_volume: 1.0,
            option_strike: Some(2800.0),
            option_underlying: Some("SPXW".into()),
            option_type: Some(OptionType::Call),
            option_expiry: Some(expiry),
            option_index: Some("2800".into()),
        }
    }

    #[test]
    fn contracts_round_trip_and_purge() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let past = Utc.with_ymd_and_hms(2025, 1, 17, 21, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2026, 3, 9, 21, 0, 0).unwrap();
        repo.save_contract(&option_contract("SPXW-20250117-C-2800-100", past))
            .unwrap();
        repo.save_contract(&option_contract("SPXW-20260309-C-2800-100", future))
            .unwrap();

        let today = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(repo.purge_expired_options(today).unwrap(), 1);
        let remaining = repo.load_contracts().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].symbol, "SPXW-20260309-C-2800-100");
    }

    #[test]
    fn holding_blob_round_trips() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        assert!(repo.load_holding("demo").unwrap().is_none());
        repo.save_holding("demo", b"{\"x\":1}").unwrap();
        assert_eq!(repo.load_holding("demo").unwrap().unwrap(), b"{\"x\":1}");
        repo.save_holding("demo", b"{\"x\":2}").unwrap();
        assert_eq!(repo.load_holding("demo").unwrap().unwrap(), b"{\"x\":2}");
    }
}
