// =============================================================================
// Symbol trader — dual-track loop (protective monitor + throttled analysis)
// =============================================================================
//
// Every scheduler tick runs the monitor track: dynamic SL/TP, trailing stop
// and partial take-profit, the 1-minute fast-exit pattern scan, and the
// breakeven/candle hard-stop promotion. The analysis track (advisor call +
// execution guard) runs only when the AI interval has elapsed and the soft
// gate or a surge override lets it through.
//
// Within one symbol everything is serialized — at most one order in flight.
// =============================================================================

pub mod guard;
pub mod position;
pub mod sim;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::advisor::{AdvisorClient, AdvisorContext};
use crate::config::{SignalGateConfig, SymbolConfig, TradingConfig};
use crate::market::{MarketPipeline, MarketSnapshot};
use crate::notify::Notifier;
use crate::okx::Exchange;
use crate::signal::{
    check_technical_filters, detect_three_line_strike, PatternKind,
};
use crate::store::DataStore;
use crate::types::{
    Confidence, ExecStatus, MarketRegime, Position, Side, Signal, TradeMode,
};

use guard::ExecutionGuard;
use position::{
    evaluate_trailing, update_protective_stop, DynamicRiskState, PositionManager, TrailingAction,
};
use sim::Simulator;

/// Monitor-tick 1m candles fetched for the fast-exit scan.
const FAST_EXIT_1M_LIMIT: u32 = 10;
/// Volume ratio that wakes the analyser regardless of the soft gate.
const SURGE_VOLUME_RATIO: f64 = 3.0;
/// Intra-bar move (percent) that wakes the analyser.
const SURGE_INTRABAR_PCT: f64 = 0.5;
/// Intraday drawdown (fraction) tripping the per-symbol stop.
const DAILY_DRAWDOWN_LIMIT: f64 = -0.15;
/// Tick-error escalation ladder.
const ERRORS_WARN: u32 = 3;
const ERRORS_ALERT: u32 = 5;
const ERRORS_HALT: u32 = 10;
/// Halt duration after the error ladder tops out.
const ERROR_HALT_SECS: i64 = 1800;

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// One row of the scheduler dashboard.
#[derive(Debug, Clone)]
pub struct TickResult {
    pub symbol: String,
    pub price: f64,
    pub change_pct: f64,
    pub signal: String,
    pub confidence: String,
    pub status: ExecStatus,
    pub summary: String,
    pub regime: MarketRegime,
    pub pattern: Option<PatternKind>,
}

impl TickResult {
    fn monitoring(symbol: &str, snapshot: &MarketSnapshot, summary: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            price: snapshot.price,
            change_pct: snapshot.price_change,
            signal: "HOLD".into(),
            confidence: "LOW".into(),
            status: ExecStatus::Monitoring,
            summary,
            regime: snapshot.regime,
            pattern: None,
        }
    }

    fn offline(symbol: &str, status: ExecStatus, summary: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            price: 0.0,
            change_pct: 0.0,
            signal: "-".into(),
            confidence: "-".into(),
            status,
            summary,
            regime: MarketRegime::Normal,
            pattern: None,
        }
    }
}

// -----------------------------------------------------------------------------
// Surge override + soft gate (pure helpers)
// -----------------------------------------------------------------------------

/// A surge bypasses the soft gate: detected pattern, volume spike, or a
/// violent intra-bar move.
fn detect_surge(snapshot: &MarketSnapshot, pattern: Option<PatternKind>) -> Option<String> {
    if let Some(kind) = pattern {
        return Some(format!("pattern strike ({kind})"));
    }
    if snapshot.indicators.vol_ratio > SURGE_VOLUME_RATIO {
        return Some(format!("volume burst ({:.1}x)", snapshot.indicators.vol_ratio));
    }
    if let Some(last) = snapshot.candles.last() {
        if last.open > 0.0 {
            let intrabar = ((last.close - last.open) / last.open).abs() * 100.0;
            if intrabar > SURGE_INTRABAR_PCT {
                return Some(format!("intra-bar move ({intrabar:.2}%)"));
            }
        }
    }
    None
}

/// Regime-aware ADX/RSI window. `None` means the analyser may proceed.
fn gate_reason(snapshot: &MarketSnapshot, gate: &SignalGateConfig) -> Option<String> {
    let ind = &snapshot.indicators;
    if snapshot.regime == MarketRegime::HighTrend {
        if ind.adx < gate.adx_min {
            return Some(format!("trend too weak (ADX {:.1} < {})", ind.adx, gate.adx_min));
        }
        return None;
    }
    if ind.rsi < gate.rsi_min || ind.rsi > gate.rsi_max {
        return Some(format!(
            "RSI out of window ({:.1} not in [{}, {}])",
            ind.rsi, gate.rsi_min, gate.rsi_max
        ));
    }
    if ind.adx < gate.adx_min {
        return Some(format!("ADX below gate ({:.1} < {})", ind.adx, gate.adx_min));
    }
    None
}

// -----------------------------------------------------------------------------
// The trader
// -----------------------------------------------------------------------------

pub struct SymbolTrader {
    pub symbol: String,
    trade_mode: TradeMode,
    margin_mode: String,
    test_mode: bool,
    ai_interval: i64,
    analyze_on_bar_close: bool,
    gate: SignalGateConfig,
    max_profit_usdt: f64,
    max_loss_rate: f64,

    exchange: Arc<dyn Exchange>,
    advisor: Arc<AdvisorClient>,
    notifier: Arc<Notifier>,
    pipeline: MarketPipeline,
    store: DataStore,
    positions: PositionManager,
    pub guard: ExecutionGuard,
    sim: Option<Simulator>,

    pub state: DynamicRiskState,
    state_path: PathBuf,
    default_amount: f64,
    active_symbols: Arc<AtomicUsize>,

    last_analysis_at: i64,
    last_analyzed_bar_ts: Option<i64>,
    consecutive_errors: u32,
    halted_until: i64,
}

impl SymbolTrader {
    pub async fn new(
        sym_cfg: &SymbolConfig,
        trading: &TradingConfig,
        exchange: Arc<dyn Exchange>,
        advisor: Arc<AdvisorClient>,
        notifier: Arc<Notifier>,
        active_symbols: Arc<AtomicUsize>,
        data_dir: &std::path::Path,
    ) -> Result<Self> {
        let symbol = sym_cfg.symbol.clone();
        let file_tag = symbol.replace('/', "_").replace(':', "_");

        let store = DataStore::open(data_dir.join(format!("trade_data_{file_tag}.db")))
            .await
            .with_context(|| format!("store for {symbol}"))?;

        let pipeline = MarketPipeline::new(
            exchange.clone(),
            store.clone(),
            symbol.clone(),
            trading.timeframe.clone(),
        );

        let positions = PositionManager::new(exchange.clone(), symbol.clone(), sym_cfg.trade_mode);

        let mut guard = ExecutionGuard::new(
            exchange.clone(),
            symbol.clone(),
            sym_cfg.trade_mode,
            sym_cfg.leverage,
            sym_cfg.allocation,
            sym_cfg.amount,
            trading.test_mode,
            trading.max_slippage_percent,
            trading.min_confidence,
            trading.risk_control.initial_balance_usdt,
            trading.strategy.trailing_stop.clone(),
            active_symbols.clone(),
        );
        guard.attach_store(store.clone());

        let state_path = data_dir.join(format!("state_{file_tag}.json"));
        let state = DynamicRiskState::load(&state_path);
        if state.stop_loss > 0.0 || state.trailing_max_pnl > 0.0 {
            info!(
                symbol = %symbol,
                stop_loss = state.stop_loss,
                trailing_max = state.trailing_max_pnl,
                "dynamic risk state restored"
            );
        }

        let sim = if trading.test_mode {
            let quota = sym_cfg.allocation.quota_usdt(
                trading.risk_control.initial_balance_usdt.max(0.0),
                active_symbols.load(Ordering::Relaxed).max(1),
            );
            Some(Simulator::new(
                &symbol,
                sym_cfg.trade_mode,
                0.001,
                data_dir.join(format!("sim_state_{file_tag}.json")),
                quota,
            ))
        } else {
            None
        };

        Ok(Self {
            symbol,
            trade_mode: sym_cfg.trade_mode,
            margin_mode: sym_cfg.margin_mode().to_string(),
            test_mode: trading.test_mode,
            ai_interval: trading.strategy.ai_interval.max(trading.loop_interval) as i64,
            analyze_on_bar_close: trading.strategy.analyze_on_bar_close,
            gate: trading.strategy.signal_gate.clone(),
            max_profit_usdt: trading.risk_control.max_profit_usdt,
            max_loss_rate: trading.risk_control.max_loss_rate,
            exchange,
            advisor,
            notifier,
            pipeline,
            store,
            positions,
            guard,
            sim,
            state,
            state_path,
            default_amount: 0.0,
            active_symbols,
            last_analysis_at: 0,
            last_analyzed_bar_ts: None,
            consecutive_errors: 0,
            halted_until: 0,
        })
    }

    /// One-time setup: leverage, fee-rate calibration, data prewarm.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.trade_mode != TradeMode::Cash && !self.test_mode {
            if let Err(e) = self
                .exchange
                .set_leverage(&self.symbol, self.guard.leverage, &self.margin_mode)
                .await
            {
                warn!(symbol = %self.symbol, error = %e, "leverage setup failed");
            }
        }

        match self.exchange.fetch_trading_fee(&self.symbol).await {
            Ok(fees) if fees.taker > 0.0 => {
                debug!(symbol = %self.symbol, taker = fees.taker, "fee rate calibrated");
                self.guard.taker_fee_rate = fees.taker;
                if let Some(sim) = self.sim.as_mut() {
                    sim.set_fee_rate(fees.taker);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(symbol = %self.symbol, error = %e, "fee fetch failed, keeping default"),
        }
        Ok(())
    }

    /// Prewarm the pipeline so the first real tick has history.
    pub async fn prewarm(&self) {
        if let Err(e) = self.pipeline.fetch().await {
            warn!(symbol = %self.symbol, error = %e, "prewarm fetch failed");
        }
    }

    pub fn trade_mode(&self) -> TradeMode {
        self.trade_mode
    }

    /// Re-apply the hot-reloadable knobs (allocation, leverage).
    pub async fn apply_config_update(&mut self, sym_cfg: &SymbolConfig) {
        let leverage_changed = self.guard.leverage != sym_cfg.leverage;
        self.guard.allocation = sym_cfg.allocation;
        self.guard.amount_cap = sym_cfg.amount;
        self.guard.leverage = sym_cfg.leverage;
        if leverage_changed && self.trade_mode != TradeMode::Cash && !self.test_mode {
            if let Err(e) = self
                .exchange
                .set_leverage(&self.symbol, sym_cfg.leverage, &self.margin_mode)
                .await
            {
                warn!(symbol = %self.symbol, error = %e, "leverage re-apply failed");
            }
        }
        info!(symbol = %self.symbol, leverage = sym_cfg.leverage, "config hot-reloaded");
    }

    /// Current position; in test mode the simulator is the source of truth.
    pub async fn current_position(&mut self, price_hint: f64) -> Option<Position> {
        if self.test_mode {
            return self.sim.as_mut().and_then(|s| s.position(price_hint));
        }
        match self.positions.current_position().await {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "position fetch failed");
                None
            }
        }
    }

    /// Flatten the symbol (global risk liquidation path).
    pub async fn close_all(&mut self) -> Result<()> {
        let price = match self.exchange.fetch_ticker(&self.symbol).await {
            Ok(t) => t.last,
            Err(_) => 0.0,
        };
        if let Some(pos) = self.current_position(price).await {
            let (status, msg) = self
                .guard
                .close_position(&pos, price, "global liquidation", &mut self.state, self.sim.as_mut())
                .await;
            info!(symbol = %self.symbol, status = %status, msg, "global flatten");
            self.persist_state();
            anyhow::ensure!(status == ExecStatus::Executed, "flatten failed: {msg}");
        }
        Ok(())
    }

    fn persist_state(&self) {
        if let Err(e) = self.state.save(&self.state_path) {
            warn!(symbol = %self.symbol, error = %e, "state save failed");
        }
    }

    // -------------------------------------------------------------------------
    // The tick
    // -------------------------------------------------------------------------

    /// Run one scheduler tick. Never panics or propagates; failures feed the
    /// escalation ladder.
    pub async fn run_tick(&mut self, global_risk_factor: f64) -> TickResult {
        let now = now_secs();
        if self.halted_until > now {
            return TickResult::offline(
                &self.symbol,
                ExecStatus::Stopped,
                format!("halted for {}s after repeated errors", self.halted_until - now),
            );
        }

        match self.tick_inner(global_risk_factor).await {
            Ok(result) => {
                self.consecutive_errors = 0;
                result
            }
            Err(e) => {
                self.consecutive_errors += 1;
                error!(
                    symbol = %self.symbol,
                    errors = self.consecutive_errors,
                    error = %e,
                    "tick failed"
                );
                if self.consecutive_errors >= ERRORS_HALT {
                    self.halted_until = now_secs() + ERROR_HALT_SECS;
                    self.consecutive_errors = 0;
                    self.notifier
                        .send(
                            &format!("fuse {}", self.symbol),
                            &format!(
                                "{} halted for {ERROR_HALT_SECS}s after repeated tick failures: {e}",
                                self.symbol
                            ),
                        )
                        .await;
                } else if self.consecutive_errors >= ERRORS_ALERT {
                    self.notifier
                        .send(
                            &format!("unstable {}", self.symbol),
                            &format!("{} failed {} ticks in a row: {e}", self.symbol, self.consecutive_errors),
                        )
                        .await;
                } else if self.consecutive_errors >= ERRORS_WARN {
                    warn!(symbol = %self.symbol, "tick errors accumulating");
                }
                TickResult::offline(&self.symbol, ExecStatus::Failed, format!("{e}"))
            }
        }
    }

    async fn tick_inner(&mut self, global_risk_factor: f64) -> Result<TickResult> {
        let snapshot = self.pipeline.fetch().await?;
        let position = self.current_position(snapshot.price).await;

        // ── Monitor track: protective checks while holding ───────────────
        if let Some(pos) = position.clone() {
            if let Some(result) = self.monitor_protections(&snapshot, &pos).await? {
                self.persist_state();
                return Ok(result);
            }
        }

        // ── Pattern + surge override ─────────────────────────────────────
        let pattern = detect_three_line_strike(&snapshot.candles, Some(snapshot.indicators.adx))
            .map(|(kind, levels)| {
                // Pattern levels arm the dynamic stops ahead of any entry.
                self.state.stop_loss = levels.stop_loss;
                self.state.take_profit = levels.take_profit;
                self.state.sl_side = Some(match kind {
                    PatternKind::BullishStrike => Side::Long,
                    PatternKind::BearishStrike => Side::Short,
                });
                info!(
                    symbol = %self.symbol,
                    pattern = %kind,
                    sl = levels.stop_loss,
                    tp = levels.take_profit,
                    "three-line strike armed"
                );
                kind
            });
        if pattern.is_some() {
            self.persist_state();
        }
        let surge = detect_surge(&snapshot, pattern);

        // ── Analysis throttle ────────────────────────────────────────────
        let now = now_secs();
        if now - self.last_analysis_at < self.ai_interval - 2 {
            let wait = self.ai_interval - (now - self.last_analysis_at);
            let mut summary = format!("monitoring ({wait}s to next analysis)");
            if let Some(pos) = &position {
                summary = format!(
                    "holding {} | pnl {:+.2}% | {summary}",
                    pos.side,
                    pos.pnl_ratio(snapshot.price) * 100.0
                );
            }
            let mut res = TickResult::monitoring(&self.symbol, &snapshot, summary);
            res.pattern = pattern;
            return Ok(res);
        }

        // ── Soft gate (surge bypasses) ───────────────────────────────────
        if surge.is_none() {
            if let Some(reason) = gate_reason(&snapshot, &self.gate) {
                let mut res = TickResult::monitoring(&self.symbol, &snapshot, reason);
                res.status = ExecStatus::Hold;
                return Ok(res);
            }
        } else if let Some(reason) = &surge {
            info!(symbol = %self.symbol, reason, "surge override, bypassing soft gate");
        }

        // ── Bar-close option ─────────────────────────────────────────────
        if self.analyze_on_bar_close {
            if let Some(ts) = snapshot.candles.last().map(|c| c.timestamp_ms) {
                if self.last_analyzed_bar_ts == Some(ts) {
                    return Ok(TickResult::monitoring(
                        &self.symbol,
                        &snapshot,
                        "bar already analysed".into(),
                    ));
                }
                self.last_analyzed_bar_ts = Some(ts);
            }
        }
        self.last_analysis_at = now;

        // ── Account state ────────────────────────────────────────────────
        let (balance, equity) = self.balance_and_equity(snapshot.price).await;

        // Daily drawdown circuit: advisory stop for the symbol.
        self.state.reset_daily_if_stale();
        if equity > self.state.daily_high_equity {
            self.state.daily_high_equity = equity;
            self.persist_state();
        }
        if self.state.daily_high_equity > 0.0 {
            let drawdown = (equity - self.state.daily_high_equity) / self.state.daily_high_equity;
            if drawdown < DAILY_DRAWDOWN_LIMIT {
                self.notifier
                    .send(
                        &format!("drawdown {}", self.symbol),
                        &format!(
                            "{} intraday drawdown {:.2}% — openings stopped, close-only",
                            self.symbol,
                            drawdown * 100.0
                        ),
                    )
                    .await;
                let mut res = TickResult::monitoring(
                    &self.symbol,
                    &snapshot,
                    format!("daily drawdown {:.2}%", drawdown * 100.0),
                );
                res.status = ExecStatus::Stopped;
                return Ok(res);
            }
        }

        self.update_default_amount(&snapshot, balance);

        // ── Context extras ───────────────────────────────────────────────
        let funding_rate = if self.trade_mode != TradeMode::Cash {
            self.exchange
                .fetch_funding_rate(&self.symbol)
                .await
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let btc_change_24h = if self.symbol.contains("BTC") {
            Some(snapshot.price_change)
        } else {
            match self.exchange.fetch_ticker("BTC/USDT:USDT").await {
                Ok(t) => t.change_24h_pct,
                Err(_) => None,
            }
        };

        let account_pnl = if self.guard.initial_balance > 0.0 && equity > 0.0 {
            equity - self.guard.initial_balance
        } else {
            0.0
        };

        // ── Advisor ──────────────────────────────────────────────────────
        let ctx = AdvisorContext {
            snapshot: &snapshot,
            position: position.as_ref(),
            balance_usdt: balance,
            default_amount: self.default_amount,
            taker_fee_rate: self.guard.taker_fee_rate,
            leverage: self.guard.leverage,
            account_pnl,
            max_profit_usdt: self.max_profit_usdt,
            funding_rate,
            btc_change_24h,
            is_surge: surge.is_some(),
            pattern,
        };

        let mut decision = match self.advisor.analyze(&ctx).await {
            Ok(d) => d,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "advisor unavailable, monitor only");
                let mut res = TickResult::monitoring(
                    &self.symbol,
                    &snapshot,
                    "advisor unavailable this tick".into(),
                );
                res.status = ExecStatus::Hold;
                return Ok(res);
            }
        };

        // ── Technical soft filter ────────────────────────────────────────
        let verdict = check_technical_filters(decision.signal, &snapshot.indicators);
        if !verdict.allow {
            decision.signal = Signal::Hold;
            decision.reason = format!("{} [{}]", decision.reason, verdict.note_line());
        } else if verdict.downgrade && verdict.notes.len() >= 2 {
            // Several weak-tape notes together cap the tier at LOW.
            decision.confidence = Confidence::Low;
            decision.reason = format!("{} [{}]", decision.reason, verdict.note_line());
        } else if verdict.downgrade {
            decision.reason = format!("{} [{}]", decision.reason, verdict.note_line());
        }

        // ── Execution guard ──────────────────────────────────────────────
        let (status, status_msg) = self
            .guard
            .execute(
                &decision,
                &snapshot,
                position.as_ref(),
                balance,
                &mut self.state,
                self.sim.as_mut(),
                global_risk_factor,
            )
            .await;

        if let Err(e) = self
            .store
            .save_signal(&self.symbol, &decision, snapshot.price, &status.to_string())
            .await
        {
            warn!(symbol = %self.symbol, error = %e, "signal audit write failed");
        }
        self.persist_state();

        let summary = if decision.summary.is_empty() {
            status_msg.clone()
        } else {
            format!("{} | {}", decision.summary, status_msg)
        };

        Ok(TickResult {
            symbol: self.symbol.clone(),
            price: snapshot.price,
            change_pct: snapshot.price_change,
            signal: decision.signal.to_string(),
            confidence: decision.confidence.to_string(),
            status,
            summary,
            regime: snapshot.regime,
            pattern,
        })
    }

    // -------------------------------------------------------------------------
    // Monitor track
    // -------------------------------------------------------------------------

    /// Protective checks while holding. Returns a result when the tick is
    /// consumed by a protective action.
    async fn monitor_protections(
        &mut self,
        snapshot: &MarketSnapshot,
        pos: &Position,
    ) -> Result<Option<TickResult>> {
        let price = snapshot.price;

        // 1. Dynamic hard SL / TP (AI- or pattern-supplied levels).
        if self.state.sl_side == Some(pos.side) {
            let sl_hit = self.state.stop_loss > 0.0
                && match pos.side {
                    Side::Long => price <= self.state.stop_loss,
                    Side::Short => price >= self.state.stop_loss,
                };
            let tp_hit = self.state.take_profit > 0.0
                && match pos.side {
                    Side::Long => price >= self.state.take_profit,
                    Side::Short => price <= self.state.take_profit,
                };
            if sl_hit || tp_hit {
                let reason = if sl_hit { "dynamic stop-loss" } else { "dynamic take-profit" };
                let (status, msg) = self
                    .guard
                    .close_position(pos, price, reason, &mut self.state, self.sim.as_mut())
                    .await;
                if status == ExecStatus::Executed && sl_hit {
                    self.state.last_stop_loss_at = now_secs();
                }
                self.notifier
                    .send(
                        &format!("protective exit {}", self.symbol),
                        &format!("{} {reason} at {price:.4}: {msg}", self.symbol),
                    )
                    .await;
                let mut res =
                    TickResult::monitoring(&self.symbol, snapshot, format!("{reason}: {msg}"));
                res.status = status;
                return Ok(Some(res));
            }
        }

        // 2. Hard max-loss stop from risk control.
        if self.max_loss_rate > 0.0 {
            let pnl = pos.pnl_ratio(price);
            if pnl <= -self.max_loss_rate {
                let (status, msg) = self
                    .guard
                    .close_position(pos, price, "hard stop-loss", &mut self.state, self.sim.as_mut())
                    .await;
                if status == ExecStatus::Executed {
                    self.state.last_stop_loss_at = now_secs();
                }
                let mut res = TickResult::monitoring(
                    &self.symbol,
                    snapshot,
                    format!("hard stop at {:.2}%: {msg}", pnl * 100.0),
                );
                res.status = status;
                return Ok(Some(res));
            }
        }

        // 3. Trailing stop + partial take-profit staging.
        let pnl_ratio = pos.pnl_ratio(price);
        match evaluate_trailing(
            &mut self.state,
            pnl_ratio,
            snapshot.indicators.atr_ratio,
            &self.guard.trailing,
        ) {
            TrailingAction::PartialClose { fraction, stage } => {
                let (status, msg) = self
                    .guard
                    .reduce_position(pos, fraction, price, &mut self.state, self.sim.as_mut())
                    .await;
                info!(
                    symbol = %self.symbol,
                    stage = ?stage,
                    status = %status,
                    "partial take-profit"
                );
                let mut res = TickResult::monitoring(
                    &self.symbol,
                    snapshot,
                    format!("partial TP at {:+.2}%: {msg}", pnl_ratio * 100.0),
                );
                res.status = status;
                return Ok(Some(res));
            }
            TrailingAction::FullClose { peak, current, callback } => {
                let (status, msg) = self
                    .guard
                    .close_position(pos, price, "trailing stop", &mut self.state, self.sim.as_mut())
                    .await;
                self.notifier
                    .send(
                        &format!("trailing stop {}", self.symbol),
                        &format!(
                            "{} trailing stop: peak {:.2}% -> now {:.2}% (callback {:.2}%)",
                            self.symbol,
                            peak * 100.0,
                            current * 100.0,
                            callback * 100.0
                        ),
                    )
                    .await;
                let mut res = TickResult::monitoring(
                    &self.symbol,
                    snapshot,
                    format!("trailing stop ({:.2}% -> {:.2}%): {msg}", peak * 100.0, current * 100.0),
                );
                res.status = status;
                return Ok(Some(res));
            }
            TrailingAction::None => {}
        }

        // 4. Fast exit: 1-minute strike against the held side.
        match self.pipeline.fetch_1m(FAST_EXIT_1M_LIMIT).await {
            Ok(candles_1m) => {
                if let Some((kind, _)) = detect_three_line_strike(&candles_1m, None) {
                    let against = matches!(
                        (pos.side, kind),
                        (Side::Long, PatternKind::BearishStrike)
                            | (Side::Short, PatternKind::BullishStrike)
                    );
                    if against {
                        let (status, msg) = self
                            .guard
                            .close_position(
                                pos,
                                price,
                                "1m strike fast exit",
                                &mut self.state,
                                self.sim.as_mut(),
                            )
                            .await;
                        self.notifier
                            .send(
                                &format!("fast exit {}", self.symbol),
                                &format!("{} 1m {kind} against {} — fast exit: {msg}", self.symbol, pos.side),
                            )
                            .await;
                        let mut res = TickResult::monitoring(
                            &self.symbol,
                            snapshot,
                            format!("fast exit on 1m {kind}: {msg}"),
                        );
                        res.status = status;
                        res.pattern = Some(kind);
                        return Ok(Some(res));
                    }
                }
            }
            Err(e) => debug!(symbol = %self.symbol, error = %e, "1m scan unavailable"),
        }

        // 5. Breakeven promotion + candle-low hard-stop trailing.
        if update_protective_stop(
            &mut self.state,
            pos,
            price,
            &snapshot.candles,
            self.guard.trailing.activation_pnl,
        ) {
            self.persist_state();
        }

        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Account helpers
    // -------------------------------------------------------------------------

    async fn balance_and_equity(&mut self, price: f64) -> (f64, f64) {
        if self.test_mode {
            if let Some(sim) = self.sim.as_mut() {
                return (sim.state.balance, sim.equity(price));
            }
            return (0.0, 0.0);
        }
        match self.exchange.fetch_balance().await {
            Ok(bal) => (bal.avail_usdt, bal.total_equity),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "balance fetch failed");
                (0.0, 0.0)
            }
        }
    }

    /// Default advisor size hint: the quota converted to tokens, floored to
    /// the venue minimum.
    fn update_default_amount(&mut self, snapshot: &MarketSnapshot, balance: f64) {
        let base = if self.guard.initial_balance > 0.0 {
            self.guard.initial_balance
        } else {
            balance
        };
        let quota = self
            .guard
            .allocation
            .quota_usdt(base, self.active_symbols.load(Ordering::Relaxed).max(1))
            * 0.98;
        if snapshot.price <= 0.0 {
            return;
        }
        let mut amount = quota / snapshot.price;
        if amount < snapshot.min_amount {
            amount = snapshot.min_amount * 1.05;
        }
        self.default_amount = amount;
    }
}

impl std::fmt::Debug for SymbolTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTrader")
            .field("symbol", &self.symbol)
            .field("trade_mode", &self.trade_mode)
            .field("test_mode", &self.test_mode)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Shared handle used by the global risk manager (read-only view + flatten)
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct SharedTrader {
    symbol: String,
    trade_mode: TradeMode,
    pub inner: Arc<tokio::sync::Mutex<SymbolTrader>>,
}

impl SharedTrader {
    pub fn new(trader: SymbolTrader) -> Self {
        Self {
            symbol: trader.symbol.clone(),
            trade_mode: trader.trade_mode(),
            inner: Arc::new(tokio::sync::Mutex::new(trader)),
        }
    }
}

#[async_trait::async_trait]
impl crate::risk::TraderHandle for SharedTrader {
    fn symbol(&self) -> String {
        self.symbol.clone()
    }

    fn trade_mode(&self) -> TradeMode {
        self.trade_mode
    }

    async fn position(&self) -> Option<Position> {
        let mut t = self.inner.lock().await;
        t.current_position(0.0).await
    }

    async fn close_all(&self) -> Result<()> {
        let mut t = self.inner.lock().await;
        t.close_all().await
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::candles::Candle;
    use crate::market::indicators::IndicatorFrame;

    fn snapshot(regime: MarketRegime, rsi: f64, adx: f64, vol_ratio: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "ETH/USDT:USDT".into(),
            timeframe: "15m".into(),
            regime,
            price: 100.0,
            kline_close: 100.0,
            price_divergence: 0.0,
            price_change: 0.1,
            candles: vec![Candle {
                timestamp_ms: 0,
                open: 100.0,
                high: 100.5,
                low: 99.5,
                close: 100.2,
                volume: 10.0,
            }],
            indicators: IndicatorFrame {
                rsi,
                adx,
                vol_ratio,
                atr_ratio: 1.0,
                ..Default::default()
            },
            min_amount: 0.01,
            min_notional: 5.0,
        }
    }

    fn gate() -> SignalGateConfig {
        SignalGateConfig {
            rsi_min: 35.0,
            rsi_max: 65.0,
            adx_min: 25.0,
        }
    }

    #[test]
    fn gate_blocks_out_of_window_rsi() {
        let snap = snapshot(MarketRegime::Normal, 70.0, 30.0, 1.0);
        assert!(gate_reason(&snap, &gate()).unwrap().contains("RSI"));
        let snap = snapshot(MarketRegime::Normal, 50.0, 30.0, 1.0);
        assert!(gate_reason(&snap, &gate()).is_none());
    }

    #[test]
    fn gate_in_trend_regime_only_checks_adx() {
        // RSI way out of window, but trending: only ADX matters.
        let snap = snapshot(MarketRegime::HighTrend, 80.0, 35.0, 1.0);
        assert!(gate_reason(&snap, &gate()).is_none());
        let snap = snapshot(MarketRegime::HighTrend, 80.0, 20.0, 1.0);
        assert!(gate_reason(&snap, &gate()).unwrap().contains("trend too weak"));
    }

    #[test]
    fn gate_blocks_weak_adx_in_normal_regime() {
        let snap = snapshot(MarketRegime::Normal, 50.0, 10.0, 1.0);
        assert!(gate_reason(&snap, &gate()).unwrap().contains("ADX"));
    }

    #[test]
    fn surge_on_volume_burst() {
        let snap = snapshot(MarketRegime::Normal, 50.0, 30.0, 3.5);
        assert!(detect_surge(&snap, None).unwrap().contains("volume"));
    }

    #[test]
    fn surge_on_intrabar_move() {
        let mut snap = snapshot(MarketRegime::Normal, 50.0, 30.0, 1.0);
        snap.candles[0].open = 100.0;
        snap.candles[0].close = 100.8; // +0.8% intra-bar
        assert!(detect_surge(&snap, None).unwrap().contains("intra-bar"));
    }

    #[test]
    fn surge_on_pattern_wins() {
        let snap = snapshot(MarketRegime::Normal, 50.0, 30.0, 1.0);
        let reason = detect_surge(&snap, Some(PatternKind::BullishStrike)).unwrap();
        assert!(reason.contains("BULLISH_STRIKE"));
    }

    #[test]
    fn quiet_tape_is_not_a_surge() {
        let snap = snapshot(MarketRegime::Normal, 50.0, 30.0, 1.0);
        assert!(detect_surge(&snap, None).is_none());
    }
}
