// =============================================================================
// Global risk manager — equity baseline, funding ledger, daily circuits
// =============================================================================
//
// Runs once per scheduler tick, serially. Holds the only copy of the
// baseline/deposit-offset accounting, the processed-ledger-id set and the
// global risk factor that scales every symbol's position sizer.
//
// The baseline identity it maintains:
//   smartBaseline + depositOffset + realizedPnl + unrealizedPnl ≈ equity
// Violations are absorbed by a one-shot self-calibration instead of crashing.
//
// Traders are reached through the read-only `TraderHandle` view so risk never
// depends on trader internals (and traders never call into risk).
// =============================================================================

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RiskControlConfig;
use crate::notify::Notifier;
use crate::okx::{Exchange, LedgerEntry};
use crate::types::{Position, TradeMode};

/// Ledger entries sampled per detection pass.
const LEDGER_SAMPLE: u32 = 5;
/// Only ledger entries younger than this are considered.
const LEDGER_WINDOW_MS: i64 = 2 * 60 * 1000;
/// Processed-id memory cap.
const MAX_PROCESSED_IDS: usize = 200;
/// Calibration engages when display and realized pnl disagree by more.
const CALIBRATION_TOLERANCE: f64 = 2.0;
/// Intraday gain that arms the profit lock.
const PROFIT_LOCK_GAIN: f64 = 0.15;
/// Sizer scale once the profit lock is armed.
const PROFIT_LOCK_FACTOR: f64 = 0.5;
/// Intraday drawdown that trips the advisory stop.
const DAILY_DRAWDOWN_LIMIT: f64 = -0.15;
/// Minimum seconds between pnl history rows.
const CSV_INTERVAL_SECS: i64 = 60;

/// Read-only view of a trader, enough to value and flatten it.
#[async_trait]
pub trait TraderHandle: Send + Sync {
    fn symbol(&self) -> String;
    fn trade_mode(&self) -> TradeMode;
    async fn position(&self) -> Option<Position>;
    async fn close_all(&self) -> Result<()>;
}

/// Verdict of one risk tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskVerdict {
    Normal,
    /// Advisory: all openings should stop (daily drawdown tripped).
    Stopped(String),
    /// Hard global stop/take-profit breached: positions were flattened and
    /// the process should terminate.
    Terminate(String),
}

// =============================================================================
// Persistent state
// =============================================================================

fn today_tag() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalRiskState {
    #[serde(default)]
    pub smart_baseline: f64,
    #[serde(default)]
    pub deposit_offset: f64,
    #[serde(default)]
    pub processed_ledger_ids: Vec<String>,
    #[serde(default)]
    pub daily_start_equity: f64,
    #[serde(default)]
    pub daily_high_equity: f64,
    #[serde(default)]
    pub daily_date: String,
    #[serde(default)]
    pub is_risk_reduced: bool,
}

impl GlobalRiskState {
    fn load(path: &PathBuf) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("failed to create data dir")?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .context("failed to write risk state tmp")?;
        std::fs::rename(&tmp, path).context("failed to rename risk state")?;
        Ok(())
    }

    /// Daily-scoped fields reset when the calendar day changes.
    fn roll_daily(&mut self, equity: f64) -> bool {
        let today = today_tag();
        if self.daily_date != today {
            info!(old = %self.daily_date, new = %today, "risk day rolled");
            self.daily_date = today;
            self.daily_start_equity = equity;
            self.daily_high_equity = equity;
            self.is_risk_reduced = false;
            return true;
        }
        false
    }
}

// =============================================================================
// Pure accounting helpers
// =============================================================================

/// Boot-time baseline reconciliation: principal is locked when the account
/// holds at least the configured amount; shortfalls write the baseline down.
pub fn reconcile_baseline(equity: f64, initial_balance: f64) -> (f64, f64) {
    if initial_balance <= 0.0 {
        return (equity, 0.0);
    }
    if equity < initial_balance {
        // Covers both the within-5% micro-shortfall and a real write-down:
        // either way the live equity becomes the reference.
        (equity, 0.0)
    } else {
        // Lock the principal; the surplus is carved out as non-managed funds.
        (initial_balance, equity - initial_balance)
    }
}

/// Pnl jump that triggers a ledger query.
pub fn deposit_detection_threshold(baseline: f64) -> f64 {
    (baseline * 0.05).max(10.0)
}

/// Fold unseen funding-flow ledger entries into the offset. Returns the new
/// offset and the ids consumed.
pub fn apply_ledger_entries(
    offset: f64,
    entries: &[LedgerEntry],
    seen: &HashSet<String>,
    now_ms: i64,
) -> (f64, Vec<String>) {
    let mut offset = offset;
    let mut consumed = Vec::new();
    for entry in entries {
        if entry.id.is_empty() || seen.contains(&entry.id) {
            continue;
        }
        if now_ms - entry.timestamp_ms > LEDGER_WINDOW_MS {
            continue;
        }
        if !entry.is_funding_flow() {
            continue;
        }
        offset += entry.amount;
        consumed.push(entry.id.clone());
    }
    (offset, consumed)
}

// =============================================================================
// The manager
// =============================================================================

pub struct GlobalRiskManager {
    exchange: Arc<dyn Exchange>,
    traders: Vec<Arc<dyn TraderHandle>>,
    config: RiskControlConfig,
    notifier: Arc<Notifier>,

    state: GlobalRiskState,
    state_path: PathBuf,
    csv_path: PathBuf,

    initialized: bool,
    last_known_pnl: Option<f64>,
    realized_pnl_cache: Option<f64>,
    pnl_calibrated: bool,
    last_csv_at: i64,
}

impl GlobalRiskManager {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: RiskControlConfig,
        notifier: Arc<Notifier>,
        data_dir: &std::path::Path,
    ) -> Self {
        let state_path = data_dir.join("bot_state.json");
        let state = GlobalRiskState::load(&state_path);
        if state.smart_baseline > 0.0 {
            info!(
                baseline = state.smart_baseline,
                offset = state.deposit_offset,
                "global risk state restored"
            );
        }
        Self {
            exchange,
            traders: Vec::new(),
            config,
            notifier,
            state,
            state_path,
            csv_path: data_dir.join("pnl_history.csv"),
            initialized: false,
            last_known_pnl: None,
            realized_pnl_cache: None,
            pnl_calibrated: false,
            last_csv_at: 0,
        }
    }

    pub fn register(&mut self, trader: Arc<dyn TraderHandle>) {
        self.traders.push(trader);
    }

    pub fn unregister(&mut self, symbol: &str) {
        self.traders.retain(|t| t.symbol() != symbol);
    }

    /// Sizer scale for every symbol: 1.0 normally, halved once the daily
    /// profit lock armed.
    pub fn risk_factor(&self) -> f64 {
        if self.state.is_risk_reduced {
            PROFIT_LOCK_FACTOR
        } else {
            1.0
        }
    }

    fn persist(&self) {
        if let Err(e) = self.state.save(&self.state_path) {
            warn!(error = %e, "risk state save failed");
        }
    }

    // -------------------------------------------------------------------------
    // Equity
    // -------------------------------------------------------------------------

    /// Total account equity. Prefers the unified-account figure; otherwise
    /// sums free USDT and the market value of spot holdings.
    async fn total_equity(&self) -> Result<f64> {
        let balance = self.exchange.fetch_balance().await?;
        if balance.unified_equity {
            return Ok(balance.total_equity);
        }

        let mut equity = balance.avail_usdt;
        for trader in &self.traders {
            if trader.trade_mode() != TradeMode::Cash {
                continue;
            }
            let symbol = trader.symbol();
            let base = symbol.split('/').next().unwrap_or("");
            let holding = balance.asset_total(base);
            if holding > 0.0 {
                if let Ok(ticker) = self.exchange.fetch_ticker(&symbol).await {
                    equity += holding * ticker.last;
                }
            }
        }
        Ok(equity)
    }

    /// Aggregate realized pnl from recent fills across all symbols.
    async fn realized_pnl(&self) -> f64 {
        let mut total = 0.0;
        for trader in &self.traders {
            match self.exchange.fetch_my_trades(&trader.symbol(), 100).await {
                Ok(fills) => total += fills.iter().map(|f| f.pnl).sum::<f64>(),
                Err(e) => debug!(symbol = %trader.symbol(), error = %e, "fills unavailable"),
            }
        }
        total
    }

    // -------------------------------------------------------------------------
    // The tick
    // -------------------------------------------------------------------------

    pub async fn check(&mut self) -> RiskVerdict {
        let equity = match self.total_equity().await {
            Ok(e) if e > 0.0 => e,
            Ok(_) => return RiskVerdict::Normal,
            Err(e) => {
                warn!(error = %e, "equity fetch failed, skipping risk tick");
                return RiskVerdict::Normal;
            }
        };

        // Boot-time baseline reconciliation, forced on every restart so the
        // offset reflects the account as found.
        if !self.initialized {
            let (baseline, offset) = reconcile_baseline(equity, self.config.initial_balance_usdt);
            if offset > 0.0 {
                info!(
                    baseline,
                    offset, "principal locked; surplus carved out as non-managed funds"
                );
            }
            self.state.smart_baseline = baseline;
            self.state.deposit_offset = offset;
            self.initialized = true;
            self.persist();
        }

        if self.state.smart_baseline <= 0.0 {
            return RiskVerdict::Normal;
        }

        self.state.roll_daily(equity);

        let mut pnl = equity - self.state.deposit_offset - self.state.smart_baseline;

        // First-sample anomaly: a huge discrepancy right after boot is idle
        // balance the reconciliation missed, not pnl.
        if self.last_known_pnl.is_none() {
            let anomaly = (self.state.smart_baseline * 2.0).max(50.0);
            if pnl.abs() > anomaly {
                warn!(pnl, "first-sample pnl anomaly absorbed into deposit offset");
                self.state.deposit_offset += pnl;
                self.persist();
                pnl = 0.0;
            }
        }

        // Deposit/withdrawal detection on a sudden pnl jump.
        if let Some(last) = self.last_known_pnl {
            let delta = pnl - last;
            if delta.abs() > deposit_detection_threshold(self.state.smart_baseline) {
                pnl = self.detect_funding_flow(equity, pnl, delta).await;
            }
        }

        // Conservative offset backflow: when the offset eats into the managed
        // principal, earlier flow detection over-classified; release it.
        if self.state.deposit_offset > 0.0 && self.config.initial_balance_usdt > 0.0 {
            let adjusted = equity - self.state.deposit_offset;
            if adjusted < self.config.initial_balance_usdt * 0.95 {
                let gap = self.config.initial_balance_usdt - adjusted;
                let release = gap.min(self.state.deposit_offset);
                info!(release, "releasing over-carved deposit offset");
                self.state.deposit_offset -= release;
                self.persist();
                pnl = equity - self.state.deposit_offset - self.state.smart_baseline;
            }
        }

        // One-shot realized-pnl calibration.
        if !self.pnl_calibrated {
            if self.realized_pnl_cache.is_none() {
                self.realized_pnl_cache = Some(self.realized_pnl().await);
            }
            if let Some(realized) = self.realized_pnl_cache {
                if (pnl - realized).abs() > CALIBRATION_TOLERANCE {
                    let new_offset = equity - self.state.smart_baseline - realized;
                    if new_offset > 0.0 {
                        info!(
                            displayed = pnl,
                            realized, new_offset, "pnl self-calibration applied"
                        );
                        self.state.deposit_offset = new_offset;
                        self.persist();
                        pnl = equity - self.state.deposit_offset - self.state.smart_baseline;
                    }
                }
                self.pnl_calibrated = true;
            }
        }

        self.last_known_pnl = Some(pnl);
        let pnl_pct = pnl / self.state.smart_baseline * 100.0;

        debug!(
            baseline = self.state.smart_baseline,
            offset = self.state.deposit_offset,
            equity,
            pnl = format!("{pnl:+.2}"),
            pnl_pct = format!("{pnl_pct:+.2}%"),
            "account monitor"
        );

        self.record_pnl_csv(equity, pnl, pnl_pct);

        // Daily profit lock: big intraday gains halve every sizer.
        if self.state.daily_start_equity > 0.0 && !self.state.is_risk_reduced {
            let intraday = (equity - self.state.daily_start_equity) / self.state.daily_start_equity;
            if intraday >= PROFIT_LOCK_GAIN {
                info!(
                    gain = format!("{:.2}%", intraday * 100.0),
                    "daily profit lock armed — sizers halved"
                );
                self.state.is_risk_reduced = true;
                self.persist();
                self.notifier
                    .send(
                        "profit lock",
                        &format!(
                            "Intraday gain {:.2}% — position sizing halved for the day",
                            intraday * 100.0
                        ),
                    )
                    .await;
            }
        }

        // Daily drawdown circuit (advisory stop for all symbols).
        if equity > self.state.daily_high_equity {
            self.state.daily_high_equity = equity;
            self.persist();
        }
        if self.state.daily_high_equity > 0.0 {
            let drawdown = (equity - self.state.daily_high_equity) / self.state.daily_high_equity;
            if drawdown < DAILY_DRAWDOWN_LIMIT {
                let msg = format!(
                    "daily drawdown {:.2}% from peak {:.2}",
                    drawdown * 100.0,
                    self.state.daily_high_equity
                );
                error!("{msg}");
                self.notifier.send("daily drawdown", &msg).await;
                return RiskVerdict::Stopped(msg);
            }
        }

        // Hard global stop / take-profit.
        if let Some(reason) = self.hard_breach(pnl, pnl_pct) {
            error!(reason = %reason, "global hard limit breached — flattening everything");
            self.flatten_all().await;
            self.notifier
                .send("global stop", &format!("{reason} — all positions closed, shutting down"))
                .await;
            return RiskVerdict::Terminate(reason);
        }

        RiskVerdict::Normal
    }

    fn hard_breach(&self, pnl: f64, pnl_pct: f64) -> Option<String> {
        let c = &self.config;
        if c.max_profit_usdt > 0.0 && pnl >= c.max_profit_usdt {
            return Some(format!("profit target hit (+{pnl:.2} USDT)"));
        }
        if c.max_profit_rate > 0.0 && pnl_pct >= c.max_profit_rate * 100.0 {
            return Some(format!("profit target hit ({pnl_pct:+.2}%)"));
        }
        if c.max_loss_usdt > 0.0 && pnl <= -c.max_loss_usdt {
            return Some(format!("loss limit hit ({pnl:.2} USDT)"));
        }
        if c.max_loss_rate > 0.0 && pnl_pct <= -(c.max_loss_rate * 100.0) {
            return Some(format!("loss limit hit ({pnl_pct:.2}%)"));
        }
        None
    }

    async fn detect_funding_flow(&mut self, equity: f64, pnl: f64, delta: f64) -> f64 {
        info!(delta = format!("{delta:+.2}"), "pnl jump, querying funding ledger");

        let entries = match self.exchange.fetch_ledger("USDT", LEDGER_SAMPLE).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "ledger unavailable, keeping pnl as-is");
                return pnl;
            }
        };

        let seen: HashSet<String> = self.state.processed_ledger_ids.iter().cloned().collect();
        let now_ms = Utc::now().timestamp_millis();
        let (new_offset, consumed) =
            apply_ledger_entries(self.state.deposit_offset, &entries, &seen, now_ms);

        if consumed.is_empty() {
            return pnl;
        }

        info!(
            entries = consumed.len(),
            offset = new_offset,
            "funding flow folded into deposit offset"
        );
        self.state.deposit_offset = new_offset;
        self.state.processed_ledger_ids.extend(consumed);
        while self.state.processed_ledger_ids.len() > MAX_PROCESSED_IDS {
            self.state.processed_ledger_ids.remove(0);
        }
        self.persist();

        equity - self.state.deposit_offset - self.state.smart_baseline
    }

    /// Close every trader in parallel; individual failures are logged, not
    /// propagated.
    pub async fn flatten_all(&self) {
        let tasks = self.traders.iter().map(|t| {
            let t = t.clone();
            async move {
                if let Err(e) = t.close_all().await {
                    error!(symbol = %t.symbol(), error = %e, "flatten failed");
                }
            }
        });
        join_all(tasks).await;
    }

    fn record_pnl_csv(&mut self, equity: f64, pnl: f64, pnl_pct: f64) {
        let now = Utc::now().timestamp();
        if now - self.last_csv_at < CSV_INTERVAL_SECS {
            return;
        }
        self.last_csv_at = now;

        let header_needed = !self.csv_path.exists();
        let line = format!(
            "{},{:.2},{:.2},{:.2}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            equity,
            pnl,
            pnl_pct
        );
        let mut content = String::new();
        if header_needed {
            content.push_str("timestamp,total_equity,pnl_usdt,pnl_percent\n");
        }
        content.push_str(&line);

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .and_then(|mut f| f.write_all(content.as_bytes()));
        if let Err(e) = result {
            warn!(error = %e, "pnl history append failed");
        }
    }
}
