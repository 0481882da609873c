// =============================================================================
// Execution guard — every order passes this gate sequence
// =============================================================================
//
// Sequence (each step may short-circuit with a tagged skip):
//   circuit breaker -> cooldowns -> confidence gate (with exemptions) ->
//   test-mode intercept -> slippage -> micro-profit -> sizing -> lot/notional
//   adaptation -> contract conversion -> flip protection -> pyramid
//   protection -> placement with reduced retry -> post-order state.
//
// The per-symbol circuit breaker arms after three consecutive order failures
// and halts ALL order attempts for its cooldown — protective closes
// included (the conservative reading; see DESIGN.md).
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{Allocation, AmountCap, TrailingStopConfig};
use crate::error::OracleError;
use crate::market::MarketSnapshot;
use crate::okx::{Exchange, MarketInfo, OrderRequest, OrderSide};
use crate::store::DataStore;
use crate::types::{
    AdvisorDecision, Confidence, ExecStatus, MarketRegime, Position, Side, Signal, TradeMode,
};

use super::position::DynamicRiskState;
use super::sim::Simulator;

/// Post-stop-loss opening cooldown.
const STOP_LOSS_COOLDOWN_SECS: i64 = 180;
/// Minimum interval between opening trades.
const MIN_TRADE_INTERVAL_SECS: i64 = 300;
/// Consecutive order failures arming the breaker.
const FAILURE_THRESHOLD: u32 = 3;
/// Breaker hold duration.
const BREAKER_COOLDOWN_SECS: i64 = 600;
/// Quota floor when the book can afford it.
const MIN_QUOTA_USDT: f64 = 11.0;
/// Margin head-room multiplier on normal sizing.
const SIZE_BUFFER: f64 = 0.98;
/// HIGH-confidence override ceiling as a fraction of available capital.
const HIGH_OVERRIDE_CAP: f64 = 0.90;
/// Books below this are run as all-in micro snipers.
const MICRO_SNIPER_THRESHOLD: f64 = 100.0;
/// Extra margin demanded over the slippage-free micro-profit floor.
const MICRO_PROFIT_SLIPPAGE: f64 = 0.0005;

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

// =============================================================================
// Intent classification
// =============================================================================

/// What the decision means relative to the held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Intent {
    pub is_opening: bool,
    pub is_closing: bool,
    pub is_flip: bool,
    pub is_pyramid: bool,
}

pub fn classify_intent(
    signal: Signal,
    position: Option<&Position>,
    wants_open: bool,
    trade_mode: TradeMode,
) -> Intent {
    let mut intent = Intent::default();
    match (signal, position) {
        (Signal::Hold, _) => {}
        (Signal::Buy, None) => intent.is_opening = true,
        (Signal::Buy, Some(p)) if p.side == Side::Long => {
            intent.is_opening = true;
            intent.is_pyramid = true;
        }
        (Signal::Buy, Some(_)) => {
            intent.is_closing = true;
            if wants_open {
                intent.is_flip = true;
                intent.is_opening = true;
            }
        }
        (Signal::Sell, Some(p)) if p.side == Side::Long => {
            intent.is_closing = true;
            if wants_open && trade_mode != TradeMode::Cash {
                intent.is_flip = true;
                intent.is_opening = true;
            }
        }
        (Signal::Sell, Some(_)) => {
            intent.is_opening = true;
            intent.is_pyramid = true;
        }
        (Signal::Sell, None) => {
            if trade_mode != TradeMode::Cash {
                intent.is_opening = true;
            } else {
                // Spot sell with nothing held liquidates dust at most.
                intent.is_closing = true;
            }
        }
    }
    intent
}

// =============================================================================
// Confidence resolution
// =============================================================================

/// Narrative keywords that mark a defensible low-confidence short/exit.
const DOWNTREND_KEYWORDS: &[&str] = &[
    "downtrend", "bearish", "breakdown", "flip", "reverse", "stop loss", "stop-loss",
];

/// Apply the confidence exemptions. Returns the effective tier; the original
/// tier still gates the opening leg of a flip.
pub fn resolve_confidence(
    decision: &AdvisorDecision,
    position: Option<&Position>,
    regime: MarketRegime,
) -> Confidence {
    let mut conf = decision.confidence;

    let promote = |c: Confidence| c.max(Confidence::Medium);

    match decision.signal {
        Signal::Sell => {
            if position.map(|p| p.side) == Some(Side::Long) {
                // Closing a long is always allowed at MEDIUM strength.
                conf = promote(conf);
            } else {
                let reason = decision.reason.to_lowercase();
                if DOWNTREND_KEYWORDS.iter().any(|k| reason.contains(k)) {
                    conf = promote(conf);
                }
            }
        }
        Signal::Buy => {
            if position.map(|p| p.side) == Some(Side::Short) {
                conf = promote(conf);
            } else if regime == MarketRegime::Low {
                // Grid absorption: low-volatility buys are structural.
                conf = promote(conf);
            }
        }
        Signal::Hold => {}
    }
    conf
}

// =============================================================================
// Sizing
// =============================================================================

#[derive(Debug, Clone)]
pub struct SizingInputs {
    /// Initial balance when configured, else the live balance.
    pub base_capital: f64,
    pub allocation: Allocation,
    pub active_symbols: usize,
    /// Available balance including margin a flip would release.
    pub available_balance: f64,
    pub price: f64,
    pub leverage: u32,
    pub confidence: Confidence,
    pub suggested_ratio: f64,
    pub ai_amount: f64,
    pub config_cap: AmountCap,
    /// Margin currently used by the held position (0 on a flip).
    pub used_margin: f64,
    pub position_in_loss: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SizingOutcome {
    /// Final size in base-currency units.
    pub tokens: f64,
    /// Tokens purchasable within the plain quota (for lot adaptation).
    pub quota_tokens: f64,
    pub high_override: bool,
}

/// Resolve the order size: quota, sizer ratio, confidence factor, and the
/// three-way min against the advisor suggestion and the config cap.
pub fn compute_sizing(inp: &SizingInputs) -> SizingOutcome {
    let micro_sniper = inp.base_capital < MICRO_SNIPER_THRESHOLD && inp.base_capital > 0.0;

    let mut quota = inp.allocation.quota_usdt(inp.base_capital, inp.active_symbols);
    if micro_sniper {
        // Tiny books go (nearly) all in; splitting them just buys dust.
        quota = inp.base_capital * 0.98;
    }
    if quota < MIN_QUOTA_USDT {
        quota = if inp.base_capital > MIN_QUOTA_USDT {
            MIN_QUOTA_USDT
        } else {
            inp.base_capital
        };
    }

    // Confidence factor multiplies the heuristic ratio; micro snipers skip
    // the discount entirely.
    let final_ratio = if micro_sniper {
        inp.suggested_ratio
    } else {
        let confidence_factor = match inp.confidence {
            Confidence::Low => 0.5,
            Confidence::Medium => 0.8,
            Confidence::High => 1.0,
        };
        inp.suggested_ratio * confidence_factor
    };

    let remaining_quota = (quota * final_ratio - inp.used_margin).max(0.0);
    let spendable = inp.available_balance.min(remaining_quota);
    let lev = f64::from(inp.leverage.max(1));
    let quota_tokens = (spendable * lev * SIZE_BUFFER) / inp.price;

    let mut cap_tokens = quota_tokens;
    let mut high_override = false;

    if inp.confidence == Confidence::High && !inp.position_in_loss {
        // Break the per-symbol quota, capped at 90% of available capital.
        // Adding while under water stays forbidden (no martingale).
        let physical = (inp.available_balance * HIGH_OVERRIDE_CAP * lev) / inp.price;
        if physical > cap_tokens {
            cap_tokens = physical;
            high_override = true;
        }
    }

    let tokens = inp.ai_amount.min(inp.config_cap.cap()).min(cap_tokens).max(0.0);

    SizingOutcome {
        tokens,
        quota_tokens,
        high_override,
    }
}

// =============================================================================
// Lot / notional adaptation
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum LotVerdict {
    Sized(f64),
    Skip(ExecStatus, String),
}

/// Bump an undersized order to the venue minimum when the quota allows, let
/// flips through anyway (the exchange arbitrates), and classify the rest.
pub fn adapt_lot(
    tokens: f64,
    price: f64,
    market: &MarketInfo,
    quota_tokens: f64,
    is_flip: bool,
    is_pyramid: bool,
) -> LotVerdict {
    let min_coins = market.min_amount_coins();
    let mut tokens = tokens;

    if min_coins > 0.0 && tokens < min_coins {
        if quota_tokens >= min_coins || is_flip {
            tokens = min_coins;
        } else if is_pyramid {
            return LotVerdict::Skip(
                ExecStatus::SkippedFull,
                "book is full, holding the position".into(),
            );
        } else {
            return LotVerdict::Skip(
                ExecStatus::SkippedMin,
                format!("below venue minimum {min_coins}"),
            );
        }
    }

    if market.min_cost > 0.0 && tokens * price < market.min_cost {
        let required = market.min_cost / price * 1.05;
        if quota_tokens >= required || is_flip {
            tokens = required;
        } else if is_pyramid {
            return LotVerdict::Skip(
                ExecStatus::SkippedFull,
                "book is full, holding the position".into(),
            );
        } else {
            return LotVerdict::Skip(
                ExecStatus::SkippedMin,
                format!("notional below {} USDT", market.min_cost),
            );
        }
    }

    LotVerdict::Sized(tokens)
}

/// Convert base-currency tokens to the venue's native order size.
/// Contracts floor to whole lots (epsilon guards float dust) but never to
/// zero while tokens remain.
pub fn to_order_size(tokens: f64, market: &MarketInfo) -> f64 {
    if !market.is_contract {
        return market.amount_to_precision(tokens);
    }
    let contracts = ((tokens / market.contract_size) + 1e-9).floor();
    if contracts < 1.0 && tokens > 0.0 {
        1.0
    } else {
        contracts
    }
}

// =============================================================================
// The guard
// =============================================================================

pub struct ExecutionGuard {
    exchange: Arc<dyn Exchange>,
    pub symbol: String,
    pub trade_mode: TradeMode,
    pub leverage: u32,
    pub allocation: Allocation,
    pub amount_cap: AmountCap,
    pub taker_fee_rate: f64,
    pub test_mode: bool,
    pub max_slippage_pct: f64,
    pub min_confidence: Confidence,
    pub initial_balance: f64,
    pub sentiment_score: f64,
    pub trailing: TrailingStopConfig,
    active_symbols: Arc<AtomicUsize>,
    /// Fill audit sink; live fills are recorded here when attached.
    store: Option<DataStore>,
}

impl ExecutionGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        symbol: String,
        trade_mode: TradeMode,
        leverage: u32,
        allocation: Allocation,
        amount_cap: AmountCap,
        test_mode: bool,
        max_slippage_pct: f64,
        min_confidence: Confidence,
        initial_balance: f64,
        trailing: TrailingStopConfig,
        active_symbols: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            exchange,
            symbol,
            trade_mode,
            leverage,
            allocation,
            amount_cap,
            taker_fee_rate: 0.001,
            test_mode,
            max_slippage_pct,
            min_confidence,
            initial_balance,
            sentiment_score: 50.0,
            trailing,
            active_symbols,
            store: None,
        }
    }

    /// Attach the per-symbol store so every live fill lands in the trades
    /// audit table.
    pub fn attach_store(&mut self, store: DataStore) {
        self.store = Some(store);
    }

    fn active_symbols(&self) -> usize {
        self.active_symbols.load(Ordering::Relaxed).max(1)
    }

    /// Run the full gate sequence for an advisor decision.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        decision: &AdvisorDecision,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        balance: f64,
        state: &mut DynamicRiskState,
        sim: Option<&mut Simulator>,
        global_risk_factor: f64,
    ) -> (ExecStatus, String) {
        let now = now_secs();
        let intent = classify_intent(
            decision.signal,
            position,
            decision.amount > 0.0,
            self.trade_mode,
        );

        // -- Circuit breaker gates every order attempt. ----------------------
        if state.breaker_active(now) {
            let remaining = state.circuit_breaker_until - now;
            return (
                ExecStatus::SkippedBreaker,
                format!("circuit breaker active ({remaining}s left)"),
            );
        }

        // -- Cooldown gates (opening only). ----------------------------------
        if intent.is_opening {
            let since_sl = now - state.last_stop_loss_at;
            if state.last_stop_loss_at > 0
                && since_sl < STOP_LOSS_COOLDOWN_SECS
                && decision.confidence < Confidence::High
            {
                return (
                    ExecStatus::SkippedCooldown,
                    format!(
                        "stop-loss cooldown ({}s left)",
                        STOP_LOSS_COOLDOWN_SECS - since_sl
                    ),
                );
            }
            let since_trade = now - state.last_trade_at;
            if state.last_trade_at > 0 && since_trade < MIN_TRADE_INTERVAL_SECS {
                return (
                    ExecStatus::SkippedFreq,
                    format!(
                        "trade frequency limit ({}s left)",
                        MIN_TRADE_INTERVAL_SECS - since_trade
                    ),
                );
            }
        }

        // -- Confidence gate with exemptions. --------------------------------
        let original_conf = decision.confidence;
        let effective_conf = resolve_confidence(decision, position, snapshot.regime);
        if decision.signal != Signal::Hold && effective_conf < self.min_confidence {
            return (
                ExecStatus::SkippedConf,
                format!("confidence {original_conf} below minimum"),
            );
        }

        // -- HOLD: refresh dynamic stops and stand down. ---------------------
        if decision.signal == Signal::Hold {
            if let Some(pos) = position {
                if decision.stop_loss > 0.0 {
                    state.stop_loss = decision.stop_loss;
                    state.sl_side = Some(pos.side);
                }
                if decision.take_profit > 0.0 {
                    state.take_profit = decision.take_profit;
                    state.sl_side = Some(pos.side);
                }
            }
            return (ExecStatus::Hold, "advisor holds".into());
        }

        // -- Test-mode intercept. --------------------------------------------
        if self.test_mode {
            if let Some(sim) = sim {
                let amount = if decision.is_close_only() {
                    position.map(|p| p.coin_size).unwrap_or(0.0)
                } else {
                    decision.amount
                };
                let (status, msg) = sim.execute(decision.signal, amount, snapshot.price);
                if status == ExecStatus::Executed {
                    if sim.state.position.is_none() {
                        state.clear_position_state();
                    }
                    self.commit_post_order(decision, intent, state, now);
                }
                return (status, msg);
            }
            return (ExecStatus::Failed, "test mode without simulator".into());
        }

        // -- Slippage guard against analysis-time price. ---------------------
        let live_price = match self.exchange.fetch_ticker(&self.symbol).await {
            Ok(t) if t.last > 0.0 => t.last,
            _ => snapshot.price,
        };
        if snapshot.price > 0.0 {
            let gap_pct = ((live_price - snapshot.price) / snapshot.price).abs() * 100.0;
            if gap_pct > self.max_slippage_pct {
                return (
                    ExecStatus::SkippedSlippage,
                    format!("price moved {gap_pct:.2}% since analysis"),
                );
            }
        }

        // -- Micro-profit guard: never scalp gains into fees. ----------------
        if intent.is_closing && original_conf < Confidence::High {
            if let Some(pos) = position {
                let pnl = pos.pnl_ratio(live_price);
                let floor = self.taker_fee_rate * 2.0 + MICRO_PROFIT_SLIPPAGE;
                if pnl >= 0.0 && pnl < floor {
                    return (
                        ExecStatus::SkippedProfit,
                        format!("gain {:.3}% below fee floor", pnl * 100.0),
                    );
                }
            }
        }

        // -- Sizing. ----------------------------------------------------------
        let market = match self.exchange.market(&self.symbol) {
            Some(m) => m,
            None if self.trade_mode != TradeMode::Cash => {
                return (ExecStatus::Failed, "market metadata unavailable".into());
            }
            None => MarketInfo {
                inst_id: self.symbol.clone(),
                is_contract: false,
                contract_size: 1.0,
                min_amount: 0.0,
                lot_size: 0.0,
                min_cost: 5.0,
            },
        };

        let base_capital = if self.initial_balance > 0.0 {
            self.initial_balance
        } else {
            balance
        };

        let used_margin = position
            .map(|p| p.coin_size * live_price / f64::from(self.leverage.max(1)))
            .unwrap_or(0.0);
        let (used_margin, released) = if intent.is_flip {
            // Closing the old side frees its margin (minus the closing fee).
            let fee = position
                .map(|p| p.coin_size * live_price * self.taker_fee_rate)
                .unwrap_or(0.0);
            (0.0, (used_margin - fee).max(0.0))
        } else {
            (used_margin, 0.0)
        };

        let suggested_ratio = super::position::recommend_position_ratio(
            snapshot.indicators.atr_ratio,
            snapshot.indicators.adx,
            decision.confidence,
            position.map(|p| p.pnl_ratio(live_price)).unwrap_or(0.0),
            self.sentiment_score,
            global_risk_factor,
        );

        let position_in_loss = position.map(|p| p.pnl_ratio(live_price) < 0.0).unwrap_or(false);

        let sizing = compute_sizing(&SizingInputs {
            base_capital,
            allocation: self.allocation,
            active_symbols: self.active_symbols(),
            available_balance: balance + released,
            price: live_price,
            leverage: self.leverage,
            confidence: decision.confidence,
            suggested_ratio,
            ai_amount: decision.amount,
            config_cap: self.amount_cap,
            used_margin,
            position_in_loss,
        });
        if sizing.high_override {
            debug!(symbol = %self.symbol, "HIGH-confidence quota override engaged");
        }

        let mut open_tokens = sizing.tokens;

        // Spot sells liquidate the whole holding.
        if decision.signal == Signal::Sell && self.trade_mode == TradeMode::Cash {
            open_tokens = match super::position::PositionManager::new(
                self.exchange.clone(),
                self.symbol.clone(),
                self.trade_mode,
            )
            .spot_balance()
            .await
            {
                Ok(b) => b,
                Err(e) => return (ExecStatus::Failed, format!("spot balance unavailable: {e}")),
            };
        }

        // -- Flip protection: the opening leg answers to the ORIGINAL tier. --
        let suppress_reverse = intent.is_flip
            && original_conf < self.min_confidence
            && snapshot.regime != MarketRegime::Low;

        // -- Pyramid protection: adds demand HIGH. ----------------------------
        if intent.is_pyramid && !intent.is_closing && original_conf < Confidence::High {
            return (ExecStatus::HoldDup, "already positioned, add needs HIGH".into());
        }

        // -- Close leg first (contracts only; a spot sell IS the close). ------
        let spot_sell = self.trade_mode == TradeMode::Cash && decision.signal == Signal::Sell;
        if intent.is_closing && !spot_sell {
            if let Some(pos) = position {
                let close_side = match pos.side {
                    Side::Long => OrderSide::Sell,
                    Side::Short => OrderSide::Buy,
                };
                if let Err(e) = self
                    .place_with_retry(close_side, pos.size, live_price, true, &market, state, now)
                    .await
                {
                    return (ExecStatus::Failed, format!("close failed: {e}"));
                }

                // Stamp the loss cooldown when this close locks a loss.
                if pos.pnl_ratio(live_price) < 0.0 || decision.reason.to_lowercase().contains("stop")
                {
                    state.last_stop_loss_at = now;
                }
                state.clear_position_state();

                if decision.is_close_only() {
                    return (
                        ExecStatus::Executed,
                        format!("closed {} (advisor close-only)", pos.side),
                    );
                }
                if suppress_reverse {
                    return (
                        ExecStatus::Executed,
                        format!("closed {} only (confidence below minimum for reversal)", pos.side),
                    );
                }
            }
        }

        // -- Spot sell: one order liquidates the holding. ---------------------
        if spot_sell {
            if open_tokens <= 0.0 {
                return (ExecStatus::SkippedZero, "nothing to sell".into());
            }
            let size = market.amount_to_precision(open_tokens);
            return match self
                .place_with_retry(OrderSide::Sell, size, live_price, false, &market, state, now)
                .await
            {
                Ok(_) => {
                    state.clear_position_state();
                    (ExecStatus::Executed, format!("sold {size} (spot)"))
                }
                Err(e) => (ExecStatus::Failed, format!("spot sell failed: {e}")),
            };
        }

        // -- Opening leg. ------------------------------------------------------
        if !intent.is_opening {
            if intent.is_closing {
                return (ExecStatus::Executed, "position closed".into());
            }
            return (ExecStatus::Hold, "nothing to execute".into());
        }

        if open_tokens <= 0.0 {
            return (ExecStatus::SkippedZero, "computed size is zero".into());
        }

        let open_tokens = match adapt_lot(
            open_tokens,
            live_price,
            &market,
            sizing.quota_tokens,
            intent.is_flip,
            intent.is_pyramid,
        ) {
            LotVerdict::Sized(t) => t,
            LotVerdict::Skip(status, msg) => return (status, msg),
        };

        let order_size = to_order_size(open_tokens, &market);
        if order_size <= 0.0 {
            return (ExecStatus::SkippedZero, "size rounds to zero".into());
        }

        let open_side = match decision.signal {
            Signal::Buy => OrderSide::Buy,
            _ => OrderSide::Sell,
        };

        match self
            .place_with_retry(open_side, order_size, live_price, false, &market, state, now)
            .await
        {
            Ok(_) => {
                self.commit_post_order(decision, intent, state, now);
                info!(
                    symbol = %self.symbol,
                    side = %open_side,
                    size = order_size,
                    price = live_price,
                    "order executed"
                );
                (
                    ExecStatus::Executed,
                    format!("{open_side} {order_size} @ {live_price:.4}"),
                )
            }
            Err(e) => (ExecStatus::Failed, format!("order failed: {e}")),
        }
    }

    /// Market-close the full position (trailing stop, hard SL/TP, fast exit,
    /// global flatten). Honours the circuit breaker.
    pub async fn close_position(
        &self,
        position: &Position,
        price: f64,
        reason: &str,
        state: &mut DynamicRiskState,
        sim: Option<&mut Simulator>,
    ) -> (ExecStatus, String) {
        let now = now_secs();
        if state.breaker_active(now) {
            return (
                ExecStatus::Failed,
                "circuit breaker active, close blocked".into(),
            );
        }

        if self.test_mode {
            if let Some(sim) = sim {
                let signal = match position.side {
                    Side::Long => Signal::Sell,
                    Side::Short => Signal::Buy,
                };
                let fill = if price > 0.0 { price } else { position.entry_price };
                let (status, msg) = sim.execute(signal, position.coin_size, fill);
                if status == ExecStatus::Executed {
                    state.clear_position_state();
                }
                return (status, msg);
            }
        }

        let market = match self.exchange.market(&self.symbol) {
            Some(m) => m,
            None => return (ExecStatus::Failed, "market metadata unavailable".into()),
        };

        let side = match position.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };
        let fill_price = if price > 0.0 { price } else { position.entry_price };

        match self
            .place_with_retry(side, position.size, fill_price, true, &market, state, now)
            .await
        {
            Ok(_) => {
                state.clear_position_state();
                info!(symbol = %self.symbol, reason, "position closed");
                (ExecStatus::Executed, format!("closed: {reason}"))
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "protective close failed");
                (ExecStatus::Failed, format!("close failed: {e}"))
            }
        }
    }

    /// Reduce the position by `fraction` (partial take-profit). Leaves the
    /// dynamic risk state intact apart from failure bookkeeping.
    pub async fn reduce_position(
        &self,
        position: &Position,
        fraction: f64,
        price: f64,
        state: &mut DynamicRiskState,
        sim: Option<&mut Simulator>,
    ) -> (ExecStatus, String) {
        let now = now_secs();
        if state.breaker_active(now) {
            return (
                ExecStatus::Failed,
                "circuit breaker active, reduce blocked".into(),
            );
        }

        let side = match position.side {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        };

        if self.test_mode {
            if let Some(sim) = sim {
                let signal = match side {
                    OrderSide::Sell => Signal::Sell,
                    OrderSide::Buy => Signal::Buy,
                };
                return sim.execute(signal, position.coin_size * fraction, price);
            }
        }

        let market = match self.exchange.market(&self.symbol) {
            Some(m) => m,
            None => return (ExecStatus::Failed, "market metadata unavailable".into()),
        };

        let raw = position.size * fraction;
        let size = if market.is_contract {
            raw.floor().max(1.0).min(position.size)
        } else {
            market.amount_to_precision(raw)
        };
        if size <= 0.0 {
            return (ExecStatus::SkippedZero, "reduce size rounds to zero".into());
        }

        match self
            .place_with_retry(side, size, price, true, &market, state, now)
            .await
        {
            Ok(_) => (
                ExecStatus::Executed,
                format!("reduced {} by {size}", position.side),
            ),
            Err(e) => (ExecStatus::Failed, format!("reduce failed: {e}")),
        }
    }

    /// Place a market order. Insufficient balance retries once at 95%; any
    /// failure feeds the consecutive-failure counter and, at the threshold,
    /// arms the circuit breaker. Successful fills land in the trades audit
    /// table off the hot path.
    async fn place_with_retry(
        &self,
        side: OrderSide,
        amount: f64,
        price: f64,
        reduce_only: bool,
        market: &MarketInfo,
        state: &mut DynamicRiskState,
        now: i64,
    ) -> anyhow::Result<()> {
        let mut req = OrderRequest::market(&self.symbol, side, amount, self.trade_mode.as_td_mode());
        if reduce_only && self.trade_mode != TradeMode::Cash {
            req = req.reduce_only();
        }
        if !market.is_contract && side == OrderSide::Buy {
            req.tgt_base_ccy = true;
        }

        match self.exchange.create_order(&req).await {
            Ok(_) => {
                state.consecutive_failures = 0;
                self.record_fill(side, price, amount, market);
                Ok(())
            }
            Err(e) => {
                let insufficient = e
                    .downcast_ref::<OracleError>()
                    .map(OracleError::is_insufficient_balance)
                    .unwrap_or(false);

                if insufficient {
                    let retry_amount = if market.is_contract {
                        (amount * 0.95).floor().max(0.0)
                    } else {
                        market.amount_to_precision(amount * 0.95)
                    };
                    if retry_amount > 0.0 {
                        warn!(
                            symbol = %self.symbol,
                            original = amount,
                            retry = retry_amount,
                            "insufficient balance, retrying reduced"
                        );
                        let mut retry_req = req.clone();
                        retry_req.amount = retry_amount;
                        if self.exchange.create_order(&retry_req).await.is_ok() {
                            state.consecutive_failures = 0;
                            self.record_fill(side, price, retry_amount, market);
                            return Ok(());
                        }
                    }
                }

                state.consecutive_failures += 1;
                if state.consecutive_failures >= FAILURE_THRESHOLD {
                    state.circuit_breaker_until = now + BREAKER_COOLDOWN_SECS;
                    warn!(
                        symbol = %self.symbol,
                        failures = state.consecutive_failures,
                        "circuit breaker armed for {BREAKER_COOLDOWN_SECS}s"
                    );
                }
                Err(e)
            }
        }
    }

    /// Append the fill to the trades audit table. `amount` is in the venue's
    /// native size unit; the taker fee is estimated from the notional.
    fn record_fill(&self, side: OrderSide, price: f64, amount: f64, market: &MarketInfo) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let symbol = self.symbol.clone();
        let side = side.to_string();
        let fee = amount * market.contract_size * price * self.taker_fee_rate;
        tokio::spawn(async move {
            if let Err(e) = store.save_trade(&symbol, &side, price, amount, fee).await {
                warn!(symbol = %symbol, error = %e, "trade audit write failed");
            }
        });
    }

    /// Post-order bookkeeping: the advisor's stop is adopted, the fixed take
    /// profit is cleared (the trailing layer owns profit-taking), and the
    /// trade clock stamps.
    fn commit_post_order(
        &self,
        decision: &AdvisorDecision,
        intent: Intent,
        state: &mut DynamicRiskState,
        now: i64,
    ) {
        if intent.is_opening {
            let new_side = match decision.signal {
                Signal::Buy => Side::Long,
                _ => Side::Short,
            };
            if !intent.is_pyramid {
                state.trailing_max_pnl = 0.0;
                state.stage_5_hit = false;
                state.stage_10_hit = false;
            }
            state.stop_loss = decision.stop_loss.max(0.0);
            state.take_profit = 0.0;
            state.sl_side = Some(new_side);
            state.last_trade_at = now;
        }
    }
}

impl std::fmt::Debug for ExecutionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGuard")
            .field("symbol", &self.symbol)
            .field("trade_mode", &self.trade_mode)
            .field("leverage", &self.leverage)
            .field("test_mode", &self.test_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long_pos() -> Position {
        Position {
            symbol: "ETH/USDT:USDT".into(),
            side: Side::Long,
            size: 10.0,
            coin_size: 1.0,
            entry_price: 100.0,
            unrealized_pnl: 0.0,
            leverage: 5.0,
            mode: None,
        }
    }

    fn decision(signal: Signal, conf: Confidence, amount: f64) -> AdvisorDecision {
        AdvisorDecision {
            signal,
            confidence: conf,
            amount,
            stop_loss: 0.0,
            take_profit: 0.0,
            reason: String::new(),
            summary: String::new(),
        }
    }

    // ---- intent ------------------------------------------------------------

    #[test]
    fn intent_open_flat() {
        let i = classify_intent(Signal::Buy, None, true, TradeMode::Cross);
        assert!(i.is_opening && !i.is_closing && !i.is_flip && !i.is_pyramid);
    }

    #[test]
    fn intent_flip_long_to_short() {
        let pos = long_pos();
        let i = classify_intent(Signal::Sell, Some(&pos), true, TradeMode::Cross);
        assert!(i.is_closing && i.is_flip && i.is_opening);
    }

    #[test]
    fn intent_close_only_long() {
        let pos = long_pos();
        let i = classify_intent(Signal::Sell, Some(&pos), false, TradeMode::Cross);
        assert!(i.is_closing && !i.is_flip && !i.is_opening);
    }

    #[test]
    fn intent_pyramid_same_direction() {
        let pos = long_pos();
        let i = classify_intent(Signal::Buy, Some(&pos), true, TradeMode::Cross);
        assert!(i.is_pyramid && i.is_opening && !i.is_closing);
    }

    #[test]
    fn intent_cash_sell_never_flips() {
        let pos = long_pos();
        let i = classify_intent(Signal::Sell, Some(&pos), true, TradeMode::Cash);
        assert!(i.is_closing && !i.is_flip);
    }

    // ---- confidence resolution ----------------------------------------------

    #[test]
    fn closing_long_on_sell_promotes_to_medium() {
        let pos = long_pos();
        let d = decision(Signal::Sell, Confidence::Low, 0.0);
        assert_eq!(
            resolve_confidence(&d, Some(&pos), MarketRegime::Normal),
            Confidence::Medium
        );
    }

    #[test]
    fn downtrend_narrative_promotes_short() {
        let mut d = decision(Signal::Sell, Confidence::Low, 1.0);
        d.reason = "Clear bearish breakdown below support".into();
        assert_eq!(
            resolve_confidence(&d, None, MarketRegime::Normal),
            Confidence::Medium
        );
        d.reason = "just feels heavy".into();
        assert_eq!(
            resolve_confidence(&d, None, MarketRegime::Normal),
            Confidence::Low
        );
    }

    #[test]
    fn grid_buy_promotes_in_low_regime() {
        let d = decision(Signal::Buy, Confidence::Low, 1.0);
        assert_eq!(resolve_confidence(&d, None, MarketRegime::Low), Confidence::Medium);
        assert_eq!(
            resolve_confidence(&d, None, MarketRegime::Normal),
            Confidence::Low
        );
    }

    #[test]
    fn high_confidence_never_demoted() {
        let d = decision(Signal::Buy, Confidence::High, 1.0);
        assert_eq!(
            resolve_confidence(&d, None, MarketRegime::Normal),
            Confidence::High
        );
    }

    // ---- sizing --------------------------------------------------------------

    fn sizing_base() -> SizingInputs {
        SizingInputs {
            base_capital: 1000.0,
            allocation: Allocation::Fraction(0.2),
            active_symbols: 1,
            available_balance: 1000.0,
            price: 100.0,
            leverage: 5,
            confidence: Confidence::High,
            suggested_ratio: 1.0,
            ai_amount: 100.0,
            config_cap: AmountCap::Auto,
            used_margin: 0.0,
            position_in_loss: false,
        }
    }

    #[test]
    fn sizing_respects_quota_times_leverage() {
        let mut inp = sizing_base();
        inp.confidence = Confidence::Medium;
        inp.ai_amount = 5.0;
        let out = compute_sizing(&inp);
        // quota 200 * 0.8 conf * 5x * 0.98 / 100 = 7.84 tokens; AI wants 5.
        assert!((out.tokens - 5.0).abs() < 1e-9);
        assert!(out.quota_tokens > 7.0 && out.quota_tokens < 8.0);
        assert!(!out.high_override);
    }

    #[test]
    fn sizing_high_override_caps_at_90pct_capital() {
        let inp = sizing_base();
        let out = compute_sizing(&inp);
        assert!(out.high_override);
        // 1000 * 0.9 * 5 / 100 = 45 token ceiling.
        assert!(out.tokens <= 45.0 + 1e-9);
        assert!(out.tokens > 9.8); // broke through the plain quota
    }

    #[test]
    fn sizing_no_martingale_when_under_water() {
        let mut inp = sizing_base();
        inp.position_in_loss = true;
        let out = compute_sizing(&inp);
        assert!(!out.high_override);
        // Stuck with the quota ceiling.
        assert!(out.tokens <= out.quota_tokens + 1e-9);
    }

    #[test]
    fn sizing_micro_sniper_skips_confidence_discount() {
        let mut inp = sizing_base();
        inp.base_capital = 50.0;
        inp.available_balance = 50.0;
        inp.confidence = Confidence::Low;
        inp.suggested_ratio = 0.5;
        inp.ai_amount = 1000.0;
        let micro = compute_sizing(&inp);
        // Ratio stays 0.5 (no LOW discount): ~49 * 0.5 * 5x * 0.98 / 100.
        assert!(micro.tokens > 1.0, "micro sniper should skip the discount, got {}", micro.tokens);

        // A normal-size book with the same inputs takes the 0.5 LOW factor.
        inp.base_capital = 500.0;
        inp.available_balance = 500.0;
        let normal = compute_sizing(&inp);
        // quota 100 * (0.5 * 0.5) * 5x * 0.98 / 100 ≈ 1.2 — proportionally half.
        assert!(normal.quota_tokens < micro.quota_tokens * 3.0);
    }

    #[test]
    fn sizing_deducts_used_margin() {
        let mut inp = sizing_base();
        inp.confidence = Confidence::Medium;
        inp.used_margin = 160.0; // full conf-scaled quota already committed
        let out = compute_sizing(&inp);
        assert!(out.quota_tokens < 1e-9);
    }

    #[test]
    fn sizing_quota_floor_is_11() {
        let mut inp = sizing_base();
        inp.allocation = Allocation::Fraction(0.001); // 1 USDT quota
        inp.confidence = Confidence::Medium;
        inp.ai_amount = 1000.0;
        let out = compute_sizing(&inp);
        // Quota floored to 11: 11 * 0.8 * 5 * 0.98 / 100 ≈ 0.43 tokens.
        assert!(out.quota_tokens > 0.4);
    }

    // ---- lot adaptation --------------------------------------------------------

    fn market() -> MarketInfo {
        MarketInfo {
            inst_id: "ETH-USDT-SWAP".into(),
            is_contract: true,
            contract_size: 0.1,
            min_amount: 1.0, // 1 contract = 0.1 coins
            lot_size: 1.0,
            min_cost: 5.0,
        }
    }

    #[test]
    fn lot_bumps_to_min_when_quota_allows() {
        match adapt_lot(0.05, 100.0, &market(), 1.0, false, false) {
            LotVerdict::Sized(t) => assert!((t - 0.1).abs() < 1e-12),
            other => panic!("expected bump, got {other:?}"),
        }
    }

    #[test]
    fn lot_rejects_when_quota_cannot_cover() {
        match adapt_lot(0.05, 100.0, &market(), 0.06, false, false) {
            LotVerdict::Skip(status, _) => assert_eq!(status, ExecStatus::SkippedMin),
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn lot_flip_forces_through() {
        match adapt_lot(0.05, 100.0, &market(), 0.06, true, false) {
            LotVerdict::Sized(t) => assert!((t - 0.1).abs() < 1e-12),
            other => panic!("expected forced bump, got {other:?}"),
        }
    }

    #[test]
    fn lot_pyramid_full_book_is_skipped_full() {
        match adapt_lot(0.05, 100.0, &market(), 0.06, false, true) {
            LotVerdict::Skip(status, _) => assert_eq!(status, ExecStatus::SkippedFull),
            other => panic!("expected SKIPPED_FULL, got {other:?}"),
        }
    }

    #[test]
    fn lot_min_notional_bump() {
        let m = MarketInfo {
            min_amount: 0.001,
            ..market()
        };
        // 0.02 coins * 100 = 2 USDT < 5 USDT min.
        match adapt_lot(0.02, 100.0, &m, 10.0, false, false) {
            LotVerdict::Sized(t) => assert!(t * 100.0 >= 5.0),
            other => panic!("expected notional bump, got {other:?}"),
        }
    }

    // ---- contract conversion ----------------------------------------------------

    #[test]
    fn order_size_floors_contracts_with_epsilon() {
        let m = market();
        // 0.3 coins / 0.1 = 3 contracts, with float dust.
        assert_eq!(to_order_size(0.30000000000000004, &m), 3.0);
        assert_eq!(to_order_size(0.25, &m), 2.0);
        // Positive tokens never round to zero contracts.
        assert_eq!(to_order_size(0.05, &m), 1.0);
        assert_eq!(to_order_size(0.0, &m), 0.0);
    }

    #[test]
    fn order_size_spot_uses_lot_precision() {
        let m = MarketInfo {
            inst_id: "ETH-USDT".into(),
            is_contract: false,
            contract_size: 1.0,
            min_amount: 0.001,
            lot_size: 0.001,
            min_cost: 5.0,
        };
        assert!((to_order_size(0.12345, &m) - 0.123).abs() < 1e-12);
    }

    // ---- end-to-end gate sequence against a scripted venue ------------------

    use crate::market::candles::Candle;
    use crate::market::indicators::IndicatorFrame;
    use crate::okx::{
        AccountBalance, Exchange, FeeRates, Fill, LedgerEntry, OrderAck, PositionInfo, Ticker,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    struct ScriptedVenue {
        orders: PlMutex<Vec<OrderRequest>>,
        ticker_last: f64,
        fail_orders: bool,
    }

    impl ScriptedVenue {
        fn new(ticker_last: f64, fail_orders: bool) -> Self {
            Self {
                orders: PlMutex::new(Vec::new()),
                ticker_last,
                fail_orders,
            }
        }
    }

    #[async_trait]
    impl Exchange for ScriptedVenue {
        async fn load_markets(&self, _s: &[String]) -> anyhow::Result<()> {
            Ok(())
        }
        fn market(&self, _s: &str) -> Option<MarketInfo> {
            Some(MarketInfo {
                inst_id: "ETH-USDT-SWAP".into(),
                is_contract: true,
                contract_size: 0.1,
                min_amount: 1.0,
                lot_size: 1.0,
                min_cost: 5.0,
            })
        }
        async fn fetch_ticker(&self, _s: &str) -> anyhow::Result<Ticker> {
            Ok(Ticker {
                last: self.ticker_last,
                bid: self.ticker_last,
                ask: self.ticker_last,
                change_24h_pct: None,
            })
        }
        async fn fetch_ohlcv(&self, _s: &str, _t: &str, _l: u32) -> anyhow::Result<Vec<Candle>> {
            Ok(Vec::new())
        }
        async fn fetch_balance(&self) -> anyhow::Result<AccountBalance> {
            Ok(AccountBalance::default())
        }
        async fn fetch_positions(&self, _s: &str) -> anyhow::Result<Vec<PositionInfo>> {
            Ok(Vec::new())
        }
        async fn fetch_my_trades(&self, _s: &str, _l: u32) -> anyhow::Result<Vec<Fill>> {
            Ok(Vec::new())
        }
        async fn fetch_trading_fee(&self, _s: &str) -> anyhow::Result<FeeRates> {
            Ok(FeeRates {
                taker: 0.0005,
                maker: 0.0002,
            })
        }
        async fn fetch_funding_rate(&self, _s: &str) -> anyhow::Result<f64> {
            Ok(0.0)
        }
        async fn fetch_ledger(&self, _c: &str, _l: u32) -> anyhow::Result<Vec<LedgerEntry>> {
            Ok(Vec::new())
        }
        async fn create_order(&self, req: &OrderRequest) -> anyhow::Result<OrderAck> {
            if self.fail_orders {
                return Err(OracleError::ApiResponse {
                    code: "50013".into(),
                    message: "system busy".into(),
                }
                .into());
            }
            self.orders.lock().push(req.clone());
            Ok(OrderAck::default())
        }
        async fn set_leverage(&self, _s: &str, _l: u32, _m: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn snapshot(price: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "ETH/USDT:USDT".into(),
            timeframe: "15m".into(),
            regime: MarketRegime::Normal,
            price,
            kline_close: price,
            price_divergence: 0.0,
            price_change: 0.0,
            candles: Vec::new(),
            indicators: IndicatorFrame {
                rsi: 50.0,
                adx: 30.0,
                atr_ratio: 1.0,
                vol_ratio: 1.2,
                ..Default::default()
            },
            min_amount: 0.1,
            min_notional: 5.0,
        }
    }

    fn guard_on(venue: Arc<ScriptedVenue>) -> ExecutionGuard {
        ExecutionGuard::new(
            venue,
            "ETH/USDT:USDT".into(),
            TradeMode::Cross,
            5,
            Allocation::Fraction(0.5),
            AmountCap::Auto,
            false,
            1.0,
            Confidence::Medium,
            1000.0,
            TrailingStopConfig::default(),
            Arc::new(AtomicUsize::new(1)),
        )
    }

    /// Flip veto: a low-confidence SELL against a long closes the
    /// position but never opens the short leg.
    #[tokio::test]
    async fn flip_veto_closes_without_reversal() {
        let venue = Arc::new(ScriptedVenue::new(100.0, false));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState::default();

        let mut pos = long_pos();
        pos.entry_price = 110.0; // under water, so the micro-profit guard stays out
        let d = decision(Signal::Sell, Confidence::Low, 10.0);

        let (status, msg) = guard
            .execute(&d, &snapshot(100.0), Some(&pos), 1000.0, &mut state, None, 1.0)
            .await;

        assert_eq!(status, ExecStatus::Executed);
        assert!(msg.contains("only"), "expected reversal suppression, got: {msg}");

        let orders = venue.orders.lock();
        assert_eq!(orders.len(), 1, "only the close leg may reach the venue");
        assert!(orders[0].reduce_only);
        assert_eq!(orders[0].side, OrderSide::Sell);
        // Closing a loss stamps the stop-loss cooldown clock.
        assert!(state.last_stop_loss_at > 0);
        assert_eq!(state.stop_loss, 0.0);
    }

    /// Three consecutive order failures arm
    /// the breaker; later attempts are refused without touching the venue.
    #[tokio::test]
    async fn breaker_arms_after_three_failures() {
        let venue = Arc::new(ScriptedVenue::new(100.0, true));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState::default();
        let pos = long_pos();

        for i in 1..=3 {
            let (status, _) = guard
                .close_position(&pos, 100.0, "test", &mut state, None)
                .await;
            assert_eq!(status, ExecStatus::Failed);
            assert_eq!(state.consecutive_failures, i);
        }
        assert!(state.circuit_breaker_until > 0, "breaker should be armed");

        // Further order attempts are gated, protective closes included.
        let d = decision(Signal::Buy, Confidence::High, 1.0);
        let (status, msg) = guard
            .execute(&d, &snapshot(100.0), None, 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::SkippedBreaker);
        assert!(msg.contains("breaker"));

        let (status, _) = guard
            .close_position(&pos, 100.0, "test", &mut state, None)
            .await;
        assert_eq!(status, ExecStatus::Failed);
    }

    #[tokio::test]
    async fn cooldown_rejects_fresh_opening() {
        let venue = Arc::new(ScriptedVenue::new(100.0, false));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState {
            last_stop_loss_at: now_secs() - 10,
            ..Default::default()
        };

        let d = decision(Signal::Buy, Confidence::Medium, 1.0);
        let (status, _) = guard
            .execute(&d, &snapshot(100.0), None, 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::SkippedCooldown);
        assert!(venue.orders.lock().is_empty());

        // HIGH confidence is exempt from the stop-loss cooldown (but still
        // subject to the frequency limit, unset here).
        let d = decision(Signal::Buy, Confidence::High, 1.0);
        let (status, _) = guard
            .execute(&d, &snapshot(100.0), None, 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::Executed);
    }

    #[tokio::test]
    async fn micro_profit_close_is_refused() {
        let venue = Arc::new(ScriptedVenue::new(100.05, false));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState::default();

        let mut pos = long_pos();
        pos.entry_price = 100.0; // +0.05% gain, below 2*fee + 5bps
        let d = decision(Signal::Sell, Confidence::Medium, 0.0);

        let (status, _) = guard
            .execute(&d, &snapshot(100.05), Some(&pos), 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::SkippedProfit);
        assert!(venue.orders.lock().is_empty());
    }

    #[tokio::test]
    async fn pyramid_without_high_is_held() {
        let venue = Arc::new(ScriptedVenue::new(100.0, false));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState::default();

        let mut pos = long_pos();
        pos.entry_price = 90.0; // comfortably in profit
        let d = decision(Signal::Buy, Confidence::Medium, 1.0);

        let (status, _) = guard
            .execute(&d, &snapshot(100.0), Some(&pos), 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::HoldDup);
        assert!(venue.orders.lock().is_empty());
    }

    #[tokio::test]
    async fn slippage_gap_rejects_order() {
        // Analysis price 100, live ticker 103: 3% > 1% limit.
        let venue = Arc::new(ScriptedVenue::new(103.0, false));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState::default();

        let d = decision(Signal::Buy, Confidence::High, 1.0);
        let (status, _) = guard
            .execute(&d, &snapshot(100.0), None, 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::SkippedSlippage);
        assert!(venue.orders.lock().is_empty());
    }

    #[tokio::test]
    async fn successful_open_adopts_stop_and_clears_tp() {
        let venue = Arc::new(ScriptedVenue::new(100.0, false));
        let guard = guard_on(venue.clone());
        let mut state = DynamicRiskState::default();

        let mut d = decision(Signal::Buy, Confidence::High, 1.0);
        d.stop_loss = 95.0;
        d.take_profit = 140.0;

        let (status, _) = guard
            .execute(&d, &snapshot(100.0), None, 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::Executed);
        assert_eq!(state.stop_loss, 95.0);
        // Fixed targets are disabled; the trailing layer owns profit-taking.
        assert_eq!(state.take_profit, 0.0);
        assert_eq!(state.sl_side, Some(Side::Long));
        assert!(state.last_trade_at > 0);

        let orders = venue.orders.lock();
        assert_eq!(orders.len(), 1);
        // 1 coin => 10 contracts of 0.1.
        assert_eq!(orders[0].amount, 10.0);
    }

    #[tokio::test]
    async fn live_fill_lands_in_trades_audit() {
        let venue = Arc::new(ScriptedVenue::new(100.0, false));
        let mut guard = guard_on(venue.clone());
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::open(dir.path().join("guard.db")).await.unwrap();
        guard.attach_store(store.clone());
        let mut state = DynamicRiskState::default();

        let d = decision(Signal::Buy, Confidence::High, 1.0);
        let (status, _) = guard
            .execute(&d, &snapshot(100.0), None, 1000.0, &mut state, None, 1.0)
            .await;
        assert_eq!(status, ExecStatus::Executed);

        // The audit write runs on a spawned task; give it a beat to land.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(store.trade_count("ETH/USDT:USDT").await.unwrap(), 1);
    }
}
