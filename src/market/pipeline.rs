// =============================================================================
// Market data pipeline — store merge, cleaning, indicators, regime
// =============================================================================
//
// One fetch produces everything a tick needs: the cleaned candle window, the
// indicator frame, the regime label and the live ticker price. The local
// store is merged in first (restart resume), the API batch wins timestamp
// collisions, and the labelled tail row is persisted back without blocking
// the tick.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::error::OracleError;
use crate::market::candles::{self, Candle};
use crate::market::indicators::{self, IndicatorFrame};
use crate::okx::Exchange;
use crate::store::{DataStore, KlineRow};
use crate::types::MarketRegime;

/// Candles requested from both the store and the API per tick.
const FETCH_LIMIT: u32 = 200;
/// Merged history kept in memory.
const HISTORY_CAP: usize = 500;
/// Hard deadline on the exchange OHLCV call.
const OHLCV_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a trader tick needs to know about the market.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: String,
    pub regime: MarketRegime,
    /// Live ticker price (falls back to the kline close).
    pub price: f64,
    pub kline_close: f64,
    /// (ticker - close) / close in percent; tells the advisor about lag.
    pub price_divergence: f64,
    /// Last close vs. previous close in percent.
    pub price_change: f64,
    /// Advisor feed window (most recent `feed_limit(timeframe)` bars).
    pub candles: Vec<Candle>,
    pub indicators: IndicatorFrame,
    /// Venue minimums surfaced to the advisor prompt.
    pub min_amount: f64,
    pub min_notional: f64,
}

pub struct MarketPipeline {
    exchange: Arc<dyn Exchange>,
    store: DataStore,
    symbol: String,
    timeframe: String,
}

impl MarketPipeline {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: DataStore,
        symbol: String,
        timeframe: String,
    ) -> Self {
        Self {
            exchange,
            store,
            symbol,
            timeframe,
        }
    }

    /// Run the full pipeline once. Errors mean the caller should skip this
    /// tick for the symbol.
    pub async fn fetch(&self) -> Result<MarketSnapshot> {
        // 1. Local history (best effort) + fresh API batch.
        let stored = match self
            .store
            .recent_klines(&self.symbol, &self.timeframe, FETCH_LIMIT)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "local kline read failed");
                Vec::new()
            }
        };

        let fresh = timeout(
            OHLCV_TIMEOUT,
            self.exchange
                .fetch_ohlcv(&self.symbol, &self.timeframe, FETCH_LIMIT),
        )
        .await
        .map_err(|_| OracleError::ApiConnection("OHLCV fetch timed out".into()))??;

        if fresh.is_empty() && stored.is_empty() {
            return Err(
                OracleError::DataProcessing(format!("no candles for {}", self.symbol)).into(),
            );
        }

        // 2-4. Merge (API wins), align to the timeframe grid, clean prints.
        let merged = candles::merge(&stored, &fresh);
        let mut series = candles::normalize(&merged, &self.timeframe);
        if series.len() > HISTORY_CAP {
            series.drain(..series.len() - HISTORY_CAP);
        }
        let cleaned = candles::clean(&mut series);
        if cleaned > 0 {
            debug!(symbol = %self.symbol, cleaned, "outlier closes replaced");
        }

        // 5. Indicators.
        let frame = indicators::compute_frame(&series).ok_or_else(|| {
            OracleError::DataProcessing(format!(
                "insufficient history for {} ({} bars)",
                self.symbol,
                series.len()
            ))
        })?;

        // 6. Regime.
        let regime = indicators::classify_regime(&frame);

        // 7. Persist the labelled tail row off the hot path.
        self.persist_tail(&series, &frame, regime);

        // Real-time tick correction.
        let last = series[series.len() - 1];
        let prev_close = if series.len() > 1 {
            series[series.len() - 2].close
        } else {
            last.close
        };

        let price = match self.exchange.fetch_ticker(&self.symbol).await {
            Ok(t) if t.last > 0.0 => t.last,
            Ok(_) => last.close,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "ticker fetch failed, using kline close");
                last.close
            }
        };

        let price_divergence = if last.close > 0.0 {
            (price - last.close) / last.close * 100.0
        } else {
            0.0
        };
        let price_change = if prev_close > 0.0 {
            (last.close - prev_close) / prev_close * 100.0
        } else {
            0.0
        };

        let (min_amount, min_notional) = self
            .exchange
            .market(&self.symbol)
            .map(|m| (m.min_amount_coins(), m.min_cost))
            .unwrap_or((0.0001, 5.0));

        // Advisor feed window.
        let feed = candles::feed_limit(&self.timeframe);
        let window: Vec<Candle> = series[series.len().saturating_sub(feed)..].to_vec();

        Ok(MarketSnapshot {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe.clone(),
            regime,
            price,
            kline_close: last.close,
            price_divergence,
            price_change,
            candles: window,
            indicators: frame,
            min_amount,
            min_notional,
        })
    }

    /// Fetch 1-minute candles for the fast-exit pattern scan.
    pub async fn fetch_1m(&self, limit: u32) -> Result<Vec<Candle>> {
        timeout(
            OHLCV_TIMEOUT,
            self.exchange.fetch_ohlcv(&self.symbol, "1m", limit),
        )
        .await
        .map_err(|_| OracleError::ApiConnection("1m OHLCV fetch timed out".into()))?
        .context("1m candle fetch failed")
    }

    fn persist_tail(&self, series: &[Candle], frame: &IndicatorFrame, regime: MarketRegime) {
        // Boot writes a deeper tail so a restart can resume without a gap.
        let depth = if series.len() >= 5 { 5 } else { series.len() };
        let rows: Vec<KlineRow> = series[series.len() - depth..]
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let is_last = i == depth - 1;
                KlineRow {
                    candle: *c,
                    rsi: is_last.then_some(frame.rsi),
                    adx: is_last.then_some(frame.adx),
                    atr: is_last.then_some(frame.atr),
                    macd: is_last.then_some(frame.macd),
                    volatility_status: is_last.then(|| regime.to_string()),
                }
            })
            .collect();

        let store = self.store.clone();
        let symbol = self.symbol.clone();
        let timeframe = self.timeframe.clone();
        tokio::spawn(async move {
            if let Err(e) = store.save_klines(&symbol, &timeframe, &rows).await {
                warn!(symbol = %symbol, error = %e, "kline persist failed");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::okx::{
        AccountBalance, FeeRates, Fill, LedgerEntry, MarketInfo, OrderAck, OrderRequest,
        PositionInfo, Ticker,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Minimal scripted exchange for pipeline tests.
    struct ScriptedExchange {
        candles: Mutex<Vec<Candle>>,
        ticker_last: f64,
    }

    #[async_trait]
    impl Exchange for ScriptedExchange {
        async fn load_markets(&self, _symbols: &[String]) -> Result<()> {
            Ok(())
        }
        fn market(&self, _symbol: &str) -> Option<MarketInfo> {
            Some(MarketInfo {
                inst_id: "ETH-USDT-SWAP".into(),
                is_contract: true,
                contract_size: 0.1,
                min_amount: 1.0,
                lot_size: 1.0,
                min_cost: 5.0,
            })
        }
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                last: self.ticker_last,
                bid: self.ticker_last,
                ask: self.ticker_last,
                change_24h_pct: Some(1.0),
            })
        }
        async fn fetch_ohlcv(&self, _s: &str, _tf: &str, _l: u32) -> Result<Vec<Candle>> {
            Ok(self.candles.lock().clone())
        }
        async fn fetch_balance(&self) -> Result<AccountBalance> {
            Ok(AccountBalance::default())
        }
        async fn fetch_positions(&self, _s: &str) -> Result<Vec<PositionInfo>> {
            Ok(Vec::new())
        }
        async fn fetch_my_trades(&self, _s: &str, _l: u32) -> Result<Vec<Fill>> {
            Ok(Vec::new())
        }
        async fn fetch_trading_fee(&self, _s: &str) -> Result<FeeRates> {
            Ok(FeeRates {
                taker: 0.0005,
                maker: 0.0002,
            })
        }
        async fn fetch_funding_rate(&self, _s: &str) -> Result<f64> {
            Ok(0.0001)
        }
        async fn fetch_ledger(&self, _c: &str, _l: u32) -> Result<Vec<LedgerEntry>> {
            Ok(Vec::new())
        }
        async fn create_order(&self, _req: &OrderRequest) -> Result<OrderAck> {
            Ok(OrderAck::default())
        }
        async fn set_leverage(&self, _s: &str, _l: u32, _m: &str) -> Result<()> {
            Ok(())
        }
    }

    fn candle_series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i % 7) as f64;
                Candle {
                    timestamp_ms: i as i64 * 60_000,
                    open: base - 0.2,
                    high: base + 0.5,
                    low: base - 0.5,
                    close: base,
                    volume: 10.0 + (i % 3) as f64,
                }
            })
            .collect()
    }

    async fn pipeline_with(
        candles: Vec<Candle>,
        ticker_last: f64,
    ) -> (tempfile::TempDir, MarketPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::open(dir.path().join("p.db")).await.unwrap();
        let ex = Arc::new(ScriptedExchange {
            candles: Mutex::new(candles),
            ticker_last,
        });
        let p = MarketPipeline::new(ex, store, "ETH/USDT:USDT".into(), "1m".into());
        (dir, p)
    }

    #[tokio::test]
    async fn snapshot_produced_from_api_data() {
        let (_dir, p) = pipeline_with(candle_series(80), 106.5).await;
        let snap = p.fetch().await.unwrap();

        assert_eq!(snap.symbol, "ETH/USDT:USDT");
        assert!((snap.price - 106.5).abs() < 1e-9);
        assert!(snap.kline_close > 0.0);
        assert_eq!(snap.candles.len(), candles::feed_limit("1m"));
        assert!(snap.indicators.atr > 0.0);
    }

    #[tokio::test]
    async fn short_history_is_a_data_error() {
        let (_dir, p) = pipeline_with(candle_series(5), 100.0).await;
        let err = p.fetch().await.unwrap_err();
        assert!(err.downcast_ref::<OracleError>().is_some());
    }

    #[tokio::test]
    async fn empty_feed_is_an_error() {
        let (_dir, p) = pipeline_with(Vec::new(), 100.0).await;
        assert!(p.fetch().await.is_err());
    }

    #[tokio::test]
    async fn divergence_reflects_ticker_gap() {
        let mut series = candle_series(80);
        let last_close = series.last().unwrap().close;
        series.last_mut().unwrap().close = last_close;
        let (_dir, p) = pipeline_with(series, last_close * 1.01).await;
        let snap = p.fetch().await.unwrap();
        assert!((snap.price_divergence - 1.0).abs() < 0.05);
    }
}
