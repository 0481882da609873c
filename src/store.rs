// =============================================================================
// Per-symbol SQLite store — kline cache, signal audit, trade log
// =============================================================================
//
// Each trader owns one database file (`data/trade_data_<sym>.db`). Klines are
// upserted by (symbol, timeframe, timestamp) so the unfinished tail candle is
// overwritten on the next tick; the stored history feeds the pipeline's merge
// step after a restart.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::market::candles::Candle;
use crate::types::AdvisorDecision;

/// One kline row with the indicator columns persisted alongside it.
#[derive(Debug, Clone)]
pub struct KlineRow {
    pub candle: Candle,
    pub rsi: Option<f64>,
    pub adx: Option<f64>,
    pub atr: Option<f64>,
    pub macd: Option<f64>,
    pub volatility_status: Option<String>,
}

#[derive(Clone)]
pub struct DataStore {
    pool: SqlitePool,
}

impl DataStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("failed to create data directory")?;
            }
        }

        let url = format!("sqlite://{}", path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .context("failed to open sqlite store")?;

        let store = Self { pool };
        store.init().await?;
        info!(path = %path.display(), "data store opened");
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS klines (
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                rsi REAL,
                adx REAL,
                atr REAL,
                macd REAL,
                volatility_status TEXT,
                PRIMARY KEY (symbol, timeframe, timestamp)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create klines table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                signal TEXT NOT NULL,
                confidence TEXT NOT NULL,
                reason TEXT,
                price REAL,
                amount REAL,
                status TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create signals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                price REAL NOT NULL,
                amount REAL NOT NULL,
                cost REAL NOT NULL,
                fee REAL NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create trades table")?;

        Ok(())
    }

    /// Upsert kline rows (API data wins over a stored unfinished candle).
    pub async fn save_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        rows: &[KlineRow],
    ) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO klines
                (symbol, timeframe, timestamp, open, high, low, close, volume,
                 rsi, adx, atr, macd, volatility_status)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(symbol)
            .bind(timeframe)
            .bind(row.candle.timestamp_ms)
            .bind(row.candle.open)
            .bind(row.candle.high)
            .bind(row.candle.low)
            .bind(row.candle.close)
            .bind(row.candle.volume)
            .bind(row.rsi)
            .bind(row.adx)
            .bind(row.atr)
            .bind(row.macd)
            .bind(row.volatility_status.as_deref())
            .execute(&self.pool)
            .await
            .context("failed to upsert kline")?;
        }
        debug!(symbol, timeframe, count = rows.len(), "klines persisted");
        Ok(())
    }

    /// Most recent candles in ascending timestamp order.
    pub async fn recent_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, open, high, low, close, volume
            FROM klines
            WHERE symbol = ? AND timeframe = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to read klines")?;

        let mut out: Vec<Candle> = rows
            .iter()
            .map(|r| Candle {
                timestamp_ms: r.get::<i64, _>(0),
                open: r.get::<f64, _>(1),
                high: r.get::<f64, _>(2),
                low: r.get::<f64, _>(3),
                close: r.get::<f64, _>(4),
                volume: r.get::<f64, _>(5),
            })
            .collect();
        out.reverse();
        Ok(out)
    }

    /// Record an advisor decision and its execution status for the audit
    /// trail.
    pub async fn save_signal(
        &self,
        symbol: &str,
        decision: &AdvisorDecision,
        price: f64,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO signals (symbol, signal, confidence, reason, price, amount, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(decision.signal.to_string())
        .bind(decision.confidence.to_string())
        .bind(decision.reason.as_str())
        .bind(price)
        .bind(decision.amount)
        .bind(status)
        .execute(&self.pool)
        .await
        .context("failed to record signal")?;
        Ok(())
    }

    /// Record one executed fill (the guard calls this after every accepted
    /// live order: opens, closes, reduces and flips alike).
    pub async fn save_trade(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        amount: f64,
        fee: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (symbol, side, price, amount, cost, fee)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(side)
        .bind(price)
        .bind(amount)
        .bind(price * amount)
        .bind(fee)
        .execute(&self.pool)
        .await
        .context("failed to record trade")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn trade_count(&self, symbol: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM trades WHERE symbol = ?")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await
            .context("failed to count trades")?;
        Ok(row.get::<i64, _>(0))
    }
}
