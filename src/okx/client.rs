// =============================================================================
// OKX v5 REST client — base64 HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret and passphrase are never logged or serialized. Signed
// requests carry OK-ACCESS-KEY / OK-ACCESS-SIGN / OK-ACCESS-TIMESTAMP /
// OK-ACCESS-PASSPHRASE headers; the signature covers
// `timestamp + method + path + body`.
//
// Read endpoints retry transient failures with exponential backoff (3
// attempts, 1 s base, x2). Order placement is NOT retried here — the
// execution guard owns that policy (insufficient balance gets one reduced
// retry, everything else counts toward the circuit breaker).
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, instrument, warn};

use crate::error::OracleError;
use crate::market::candles::Candle;

use super::rate_limit::RateLimiter;
use super::{
    AccountBalance, AssetBalance, Exchange, FeeRates, Fill, LedgerEntry, LedgerKind, MarketInfo,
    OrderAck, OrderRequest, OrderType, PositionInfo, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://www.okx.com";
/// Requests per second fed to the shared token bucket.
const REQUESTS_PER_SECOND: u32 = 10;

/// OKX v5 REST client.
pub struct OkxClient {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    markets: RwLock<HashMap<String, MarketInfo>>,
}

impl OkxClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("OkxClient initialised (base_url={BASE_URL})");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: BASE_URL.to_string(),
            client,
            limiter: Arc::new(RateLimiter::new(REQUESTS_PER_SECOND)),
            markets: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol mapping
    // -------------------------------------------------------------------------

    /// Convert a unified symbol (`BTC/USDT:USDT` swap, `BTC/USDT` spot) to an
    /// OKX instId (`BTC-USDT-SWAP`, `BTC-USDT`).
    pub fn inst_id(symbol: &str) -> String {
        let is_swap = symbol.contains(':');
        let pair = symbol.split(':').next().unwrap_or(symbol);
        let dashed = pair.replace('/', "-");
        if is_swap {
            format!("{dashed}-SWAP")
        } else {
            dashed
        }
    }

    pub fn inst_type(symbol: &str) -> &'static str {
        if symbol.contains(':') {
            "SWAP"
        } else {
            "SPOT"
        }
    }

    /// OKX bar strings use uppercase hour/day suffixes (`1H`, `4H`, `1D`).
    pub fn bar(timeframe: &str) -> String {
        if timeframe.ends_with('h') || timeframe.ends_with('d') || timeframe.ends_with('w') {
            let (num, unit) = timeframe.split_at(timeframe.len() - 1);
            format!("{num}{}", unit.to_uppercase())
        } else {
            timeframe.to_string()
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn iso_timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn signed_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Vec<(&'static str, String)> {
        let ts = Self::iso_timestamp();
        let sig = self.sign(&ts, method, path, body);
        vec![
            ("OK-ACCESS-KEY", self.api_key.clone()),
            ("OK-ACCESS-SIGN", sig),
            ("OK-ACCESS-TIMESTAMP", ts),
            ("OK-ACCESS-PASSPHRASE", self.passphrase.clone()),
            ("Content-Type", "application/json".to_string()),
        ]
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Unwrap the `{code, msg, data}` envelope, mapping non-zero codes to
    /// `OracleError::ApiResponse`.
    fn unwrap_envelope(body: serde_json::Value) -> Result<serde_json::Value> {
        let code = body["code"].as_str().unwrap_or("");
        if code != "0" {
            let msg = body["msg"].as_str().unwrap_or("").to_string();
            // Order endpoints bury the useful code in data[0].sCode.
            let (code, msg) = match body["data"][0]["sCode"].as_str() {
                Some(s_code) if s_code != "0" => (
                    s_code.to_string(),
                    body["data"][0]["sMsg"].as_str().unwrap_or(&msg).to_string(),
                ),
                _ => (code.to_string(), msg),
            };
            return Err(OracleError::ApiResponse { code, message: msg }.into());
        }
        Ok(body["data"].clone())
    }

    async fn get_once(&self, path: &str, signed: bool) -> Result<serde_json::Value> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url);
        if signed {
            for (k, v) in self.signed_headers("GET", path, "") {
                req = req.header(k, v);
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|e| OracleError::ApiConnection(format!("GET {path}: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from GET {path}"))?;

        if !status.is_success() {
            return Err(OracleError::ApiResponse {
                code: status.as_str().to_string(),
                message: body.to_string(),
            }
            .into());
        }

        Self::unwrap_envelope(body)
    }

    /// GET with the shared retry policy for transient failures.
    async fn get(&self, path: &str, signed: bool) -> Result<serde_json::Value> {
        let strategy = ExponentialBackoff::from_millis(2).factor(500).take(3);
        Retry::spawn(strategy, || self.get_once(path, signed)).await
    }

    /// POST without retry — callers own the failure policy for writes.
    async fn post(&self, path: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        self.limiter.acquire().await;

        let body = payload.to_string();
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url).body(body.clone());
        for (k, v) in self.signed_headers("POST", path, &body) {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| OracleError::ApiConnection(format!("POST {path}: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from POST {path}"))?;

        if !status.is_success() {
            return Err(OracleError::ApiResponse {
                code: status.as_str().to_string(),
                message: body.to_string(),
            }
            .into());
        }

        Self::unwrap_envelope(body)
    }

    // -------------------------------------------------------------------------
    // Parsing helpers
    // -------------------------------------------------------------------------

    /// OKX reports numbers as strings; tolerate both shapes and empty fields.
    fn num(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }
}

#[async_trait]
impl Exchange for OkxClient {
    #[instrument(skip(self), name = "okx::load_markets")]
    async fn load_markets(&self, symbols: &[String]) -> Result<()> {
        for symbol in symbols {
            let inst_id = Self::inst_id(symbol);
            let inst_type = Self::inst_type(symbol);
            let path =
                format!("/api/v5/public/instruments?instType={inst_type}&instId={inst_id}");
            let data = self.get(&path, false).await?;

            let inst = data
                .as_array()
                .and_then(|a| a.first())
                .with_context(|| format!("instrument {inst_id} not found"))?;

            let is_contract = inst_type == "SWAP";
            let contract_size = if is_contract {
                let ct_val = Self::num(&inst["ctVal"]);
                if ct_val > 0.0 {
                    ct_val
                } else {
                    1.0
                }
            } else {
                1.0
            };
            let min_amount = Self::num(&inst["minSz"]).max(0.0);
            let lot_size = Self::num(&inst["lotSz"]).max(0.0);

            let info = MarketInfo {
                inst_id: inst_id.clone(),
                is_contract,
                contract_size,
                min_amount,
                lot_size,
                // OKX does not publish a quote-notional floor per instrument;
                // 5 USDT is the venue's practical minimum.
                min_cost: 5.0,
            };

            debug!(symbol = %symbol, inst_id = %inst_id, contract_size, min_amount, "market loaded");
            self.markets.write().insert(symbol.clone(), info);
        }
        Ok(())
    }

    fn market(&self, symbol: &str) -> Option<MarketInfo> {
        self.markets.read().get(symbol).cloned()
    }

    #[instrument(skip(self), name = "okx::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let path = format!("/api/v5/market/ticker?instId={}", Self::inst_id(symbol));
        let data = self.get(&path, false).await?;
        let t = data
            .as_array()
            .and_then(|a| a.first())
            .context("empty ticker response")?;

        let last = Self::num(&t["last"]);
        let open_24h = Self::num(&t["open24h"]);
        let change_24h_pct = if open_24h > 0.0 {
            Some((last - open_24h) / open_24h * 100.0)
        } else {
            None
        };

        Ok(Ticker {
            last,
            bid: Self::num(&t["bidPx"]),
            ask: Self::num(&t["askPx"]),
            change_24h_pct,
        })
    }

    #[instrument(skip(self), name = "okx::fetch_ohlcv")]
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let path = format!(
            "/api/v5/market/candles?instId={}&bar={}&limit={}",
            Self::inst_id(symbol),
            Self::bar(timeframe),
            limit.min(300)
        );
        let data = self.get(&path, false).await?;
        let rows = data.as_array().context("candles response is not an array")?;

        // OKX returns newest-first; the pipeline wants ascending.
        let mut candles = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let arr = row.as_array().context("candle row is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed candle row with {} fields", arr.len());
                continue;
            }
            candles.push(Candle {
                timestamp_ms: arr[0]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| arr[0].as_i64().unwrap_or(0)),
                open: Self::num(&arr[1]),
                high: Self::num(&arr[2]),
                low: Self::num(&arr[3]),
                close: Self::num(&arr[4]),
                volume: Self::num(&arr[5]),
            });
        }

        debug!(symbol, timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "okx::fetch_balance")]
    async fn fetch_balance(&self) -> Result<AccountBalance> {
        let data = self.get("/api/v5/account/balance", true).await?;
        let acct = data
            .as_array()
            .and_then(|a| a.first())
            .context("empty balance response")?;

        let total_equity = Self::num(&acct["totalEq"]);
        let mut avail_usdt = 0.0;
        let mut details = Vec::new();

        if let Some(rows) = acct["details"].as_array() {
            for d in rows {
                let ccy = d["ccy"].as_str().unwrap_or("").to_string();
                let avail = Self::num(&d["availBal"]);
                let total = {
                    let cash = Self::num(&d["cashBal"]);
                    if cash > 0.0 {
                        cash
                    } else {
                        Self::num(&d["eq"])
                    }
                };
                if ccy == "USDT" {
                    avail_usdt = avail;
                }
                if avail > 0.0 || total > 0.0 {
                    details.push(AssetBalance { ccy, avail, total });
                }
            }
        }

        Ok(AccountBalance {
            total_equity,
            avail_usdt,
            details,
            unified_equity: total_equity > 0.0,
        })
    }

    #[instrument(skip(self), name = "okx::fetch_positions")]
    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<PositionInfo>> {
        let path = format!("/api/v5/account/positions?instId={}", Self::inst_id(symbol));
        let data = self.get(&path, true).await?;

        let mut out = Vec::new();
        if let Some(rows) = data.as_array() {
            for p in rows {
                let contracts = Self::num(&p["pos"]);
                if contracts == 0.0 {
                    continue;
                }
                // Net mode reports direction through the sign of `pos`.
                let side = match p["posSide"].as_str() {
                    Some("long") => "long",
                    Some("short") => "short",
                    _ if contracts < 0.0 => "short",
                    _ => "long",
                };
                out.push(PositionInfo {
                    symbol: symbol.to_string(),
                    side: side.to_string(),
                    contracts: contracts.abs(),
                    entry_price: Self::num(&p["avgPx"]),
                    unrealized_pnl: Self::num(&p["upl"]),
                    leverage: Self::num(&p["lever"]).max(1.0),
                });
            }
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "okx::fetch_my_trades")]
    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> Result<Vec<Fill>> {
        let path = format!(
            "/api/v5/trade/fills?instId={}&limit={}",
            Self::inst_id(symbol),
            limit.min(100)
        );
        let data = self.get(&path, true).await?;

        let mut fills = Vec::new();
        if let Some(rows) = data.as_array() {
            for f in rows {
                let price = Self::num(&f["fillPx"]);
                let amount = Self::num(&f["fillSz"]);
                fills.push(Fill {
                    id: f["tradeId"].as_str().unwrap_or("").to_string(),
                    side: f["side"].as_str().unwrap_or("").to_string(),
                    price,
                    amount,
                    cost: price * amount,
                    fee: Self::num(&f["fee"]).abs(),
                    pnl: Self::num(&f["fillPnl"]),
                    timestamp_ms: f["ts"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
                });
            }
        }
        Ok(fills)
    }

    #[instrument(skip(self), name = "okx::fetch_trading_fee")]
    async fn fetch_trading_fee(&self, symbol: &str) -> Result<FeeRates> {
        let path = format!(
            "/api/v5/account/trade-fee?instType={}&instId={}",
            Self::inst_type(symbol),
            Self::inst_id(symbol)
        );
        let data = self.get(&path, true).await?;
        let row = data
            .as_array()
            .and_then(|a| a.first())
            .context("empty trade-fee response")?;

        // OKX reports fee rates as negative numbers (rebates positive).
        Ok(FeeRates {
            taker: Self::num(&row["taker"]).abs(),
            maker: Self::num(&row["maker"]).abs(),
        })
    }

    #[instrument(skip(self), name = "okx::fetch_funding_rate")]
    async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64> {
        let path = format!(
            "/api/v5/public/funding-rate?instId={}",
            Self::inst_id(symbol)
        );
        let data = self.get(&path, false).await?;
        Ok(data
            .as_array()
            .and_then(|a| a.first())
            .map(|r| Self::num(&r["fundingRate"]))
            .unwrap_or(0.0))
    }

    #[instrument(skip(self), name = "okx::fetch_ledger")]
    async fn fetch_ledger(&self, currency: &str, limit: u32) -> Result<Vec<LedgerEntry>> {
        let path = format!(
            "/api/v5/asset/bills?ccy={}&limit={}",
            currency,
            limit.min(100)
        );
        let data = self.get(&path, true).await?;

        let mut entries = Vec::new();
        if let Some(rows) = data.as_array() {
            for b in rows {
                let kind = match b["type"].as_str() {
                    Some("1") => LedgerKind::Deposit,
                    Some("2") => LedgerKind::Withdrawal,
                    Some("130") | Some("131") | Some("150") => LedgerKind::Transfer,
                    _ => LedgerKind::Other,
                };
                entries.push(LedgerEntry {
                    id: b["billId"].as_str().unwrap_or("").to_string(),
                    kind,
                    amount: Self::num(&b["balChg"]),
                    currency: b["ccy"].as_str().unwrap_or(currency).to_string(),
                    timestamp_ms: b["ts"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
                });
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self, req), name = "okx::create_order", fields(symbol = %req.symbol, side = %req.side))]
    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        // Client order id lets fills be reconciled even if the ack is lost.
        let cl_ord_id = uuid::Uuid::new_v4().simple().to_string();
        let mut payload = serde_json::json!({
            "instId": Self::inst_id(&req.symbol),
            "tdMode": req.td_mode,
            "side": req.side.to_string(),
            "ordType": match req.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "sz": format!("{}", req.amount),
            "clOrdId": cl_ord_id,
        });
        if let Some(px) = req.price {
            payload["px"] = serde_json::json!(format!("{px}"));
        }
        if req.reduce_only {
            payload["reduceOnly"] = serde_json::json!(true);
        }
        if req.tgt_base_ccy {
            payload["tgtCcy"] = serde_json::json!("base_ccy");
        }

        debug!(amount = req.amount, reduce_only = req.reduce_only, "placing order");

        let data = self.post("/api/v5/trade/order", &payload).await?;
        let order_id = data
            .as_array()
            .and_then(|a| a.first())
            .and_then(|o| o["ordId"].as_str())
            .unwrap_or("")
            .to_string();

        debug!(order_id = %order_id, "order placed");
        Ok(OrderAck { order_id })
    }

    #[instrument(skip(self), name = "okx::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32, mgn_mode: &str) -> Result<()> {
        let payload = serde_json::json!({
            "instId": Self::inst_id(symbol),
            "lever": leverage.to_string(),
            "mgnMode": mgn_mode,
        });
        self.post("/api/v5/account/set-leverage", &payload).await?;
        debug!(symbol, leverage, mgn_mode, "leverage set");
        Ok(())
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
