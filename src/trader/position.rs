// =============================================================================
// Position layer — dynamic risk state, trailing stop + partial TP, sizing
// =============================================================================
//
// The trailing stop runs on every monitor tick while a position exists.
// Ordering inside a tick: partial take-profit stages fire before the
// full-exit check, and the whole layer runs before any advisor consultation.
//
// The dynamic risk state is the per-symbol memory that survives restarts:
// stops, cooldown clocks, the circuit breaker and the daily high-water mark.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TrailingStopConfig;
use crate::market::candles::Candle;
use crate::okx::Exchange;
use crate::types::{Confidence, Position, Side, TradeMode};

/// Fraction of the position closed at each partial take-profit stage.
const PARTIAL_TP_FRACTION: f64 = 0.3;
/// Unrealized pnl ratio arming the first stage.
const STAGE_5_TRIGGER: f64 = 0.05;
/// Unrealized pnl ratio arming the second stage.
const STAGE_10_TRIGGER: f64 = 0.10;
/// After a stage fires the peak re-tracks from `pnl * PEAK_RESET_FACTOR`.
const PEAK_RESET_FACTOR: f64 = 0.7;
/// Breakeven stop is set this far past entry to cover round-trip fees.
const BREAKEVEN_OFFSET: f64 = 0.001;

// =============================================================================
// Dynamic risk state (persisted per symbol)
// =============================================================================

fn today_tag() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicRiskState {
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    #[serde(default)]
    pub sl_side: Option<Side>,
    #[serde(default)]
    pub trailing_max_pnl: f64,
    #[serde(default)]
    pub stage_5_hit: bool,
    #[serde(default)]
    pub stage_10_hit: bool,
    /// Epoch seconds of the last loss-classified close.
    #[serde(default)]
    pub last_stop_loss_at: i64,
    /// Epoch seconds of the last opening trade.
    #[serde(default)]
    pub last_trade_at: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Epoch seconds until which the per-symbol circuit breaker holds.
    #[serde(default)]
    pub circuit_breaker_until: i64,
    #[serde(default)]
    pub daily_high_equity: f64,
    #[serde(default)]
    pub high_water_day: String,
}

impl DynamicRiskState {
    pub fn load(path: &PathBuf) -> Self {
        let mut state = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        };
        state.reset_daily_if_stale();
        state
    }

    /// Daily-scoped fields reset when the stored day differs from today.
    pub fn reset_daily_if_stale(&mut self) {
        let today = today_tag();
        if self.high_water_day != today {
            self.daily_high_equity = 0.0;
            self.high_water_day = today;
        }
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("failed to create data dir")?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .context("failed to write state tmp")?;
        std::fs::rename(&tmp, path).context("failed to rename state file")?;
        Ok(())
    }

    pub fn breaker_active(&self, now_secs: i64) -> bool {
        self.circuit_breaker_until > now_secs
    }

    /// Wipe position-scoped fields after a full close.
    pub fn clear_position_state(&mut self) {
        self.stop_loss = 0.0;
        self.take_profit = 0.0;
        self.sl_side = None;
        self.trailing_max_pnl = 0.0;
        self.stage_5_hit = false;
        self.stage_10_hit = false;
    }
}

// =============================================================================
// Trailing stop + partial take-profit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpStage {
    Stage5,
    Stage10,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrailingAction {
    /// Market-close `fraction` of the position; single shot per stage.
    PartialClose { fraction: f64, stage: TpStage },
    /// Peak drawdown exceeded the dynamic callback: close everything.
    FullClose { peak: f64, current: f64, callback: f64 },
    None,
}

/// Allowed drawdown from the peak before the trailing stop fires.
///
/// The base callback is first re-based by volatility (wild tape gets more
/// room, dead tape almost none) and then compressed as profit grows so that
/// large winners are guarded tightly. Compression keys off the PEAK ratio.
pub fn dynamic_callback(base_callback: f64, atr_ratio: f64, peak_pnl: f64) -> f64 {
    let atr_base = if atr_ratio > 2.0 {
        0.025
    } else if atr_ratio > 1.5 {
        0.015
    } else if atr_ratio < 0.8 {
        0.003
    } else {
        base_callback
    };

    let compression = if peak_pnl >= 1.0 {
        0.05
    } else if peak_pnl >= 0.5 {
        0.1
    } else if peak_pnl >= 0.2 {
        0.2
    } else if peak_pnl >= 0.1 {
        0.4
    } else if peak_pnl >= 0.05 {
        0.6
    } else if peak_pnl >= 0.02 {
        0.8
    } else {
        1.0
    };

    atr_base * compression
}

/// One monitor-tick evaluation of the trailing layer. Mutates the peak and
/// stage flags in `state`; the caller executes whatever action comes back
/// (partial TP always precedes the full-exit check).
pub fn evaluate_trailing(
    state: &mut DynamicRiskState,
    pnl_ratio: f64,
    atr_ratio: f64,
    config: &TrailingStopConfig,
) -> TrailingAction {
    if !config.enabled {
        return TrailingAction::None;
    }

    if pnl_ratio > state.trailing_max_pnl {
        state.trailing_max_pnl = pnl_ratio;
    }

    // Partial stages: single shot each, stage 10 only after stage 5.
    if !state.stage_5_hit && pnl_ratio >= STAGE_5_TRIGGER {
        state.stage_5_hit = true;
        state.trailing_max_pnl = pnl_ratio * PEAK_RESET_FACTOR;
        return TrailingAction::PartialClose {
            fraction: PARTIAL_TP_FRACTION,
            stage: TpStage::Stage5,
        };
    }
    if state.stage_5_hit && !state.stage_10_hit && pnl_ratio >= STAGE_10_TRIGGER {
        state.stage_10_hit = true;
        state.trailing_max_pnl = pnl_ratio * PEAK_RESET_FACTOR;
        return TrailingAction::PartialClose {
            fraction: PARTIAL_TP_FRACTION,
            stage: TpStage::Stage10,
        };
    }

    // Full exit once the drawdown from peak exceeds the compressed callback.
    if state.trailing_max_pnl >= config.activation_pnl {
        let callback = dynamic_callback(config.callback_rate, atr_ratio, state.trailing_max_pnl);
        let drawdown = state.trailing_max_pnl - pnl_ratio;
        if drawdown >= callback {
            return TrailingAction::FullClose {
                peak: state.trailing_max_pnl,
                current: pnl_ratio,
                callback,
            };
        }
    }

    TrailingAction::None
}

// =============================================================================
// Breakeven promotion + candle-low trailing hard stop
// =============================================================================

/// Raise the internal hard stop while a position is in profit:
///   1. past the activation pnl the stop is promoted to fee-covered breakeven;
///   2. for longs the stop follows the lowest low of the last three candles,
///      for shorts the highest high — monotonic in the profitable direction.
///
/// Returns true when the stop moved.
pub fn update_protective_stop(
    state: &mut DynamicRiskState,
    position: &Position,
    current_price: f64,
    recent: &[Candle],
    activation_pnl: f64,
) -> bool {
    if position.entry_price <= 0.0 {
        return false;
    }
    let pnl_ratio = position.pnl_ratio(current_price);
    let mut moved = false;

    // 1. Breakeven promotion.
    if pnl_ratio > activation_pnl {
        let breakeven = match position.side {
            Side::Long => position.entry_price * (1.0 + BREAKEVEN_OFFSET),
            Side::Short => position.entry_price * (1.0 - BREAKEVEN_OFFSET),
        };
        let should_promote = match position.side {
            Side::Long => state.stop_loss <= 0.0 || breakeven > state.stop_loss,
            Side::Short => state.stop_loss <= 0.0 || breakeven < state.stop_loss,
        };
        if should_promote {
            debug!(
                pnl = format!("{:.2}%", pnl_ratio * 100.0),
                stop = breakeven,
                "breakeven stop promoted"
            );
            state.stop_loss = breakeven;
            state.sl_side = Some(position.side);
            moved = true;
        }
    }

    // 2. Candle trailing only tightens an existing stop.
    if state.stop_loss > 0.0 && recent.len() >= 3 {
        let last3 = &recent[recent.len() - 3..];
        match position.side {
            Side::Long if current_price > position.entry_price => {
                let lowest = last3.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
                if lowest > state.stop_loss && lowest < current_price {
                    state.stop_loss = lowest;
                    state.sl_side = Some(Side::Long);
                    moved = true;
                }
            }
            Side::Short if current_price < position.entry_price => {
                let highest = last3.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
                if highest < state.stop_loss && highest > current_price {
                    state.stop_loss = highest;
                    state.sl_side = Some(Side::Short);
                    moved = true;
                }
            }
            _ => {}
        }
    }

    moved
}

// =============================================================================
// Smart position sizer (heuristic)
// =============================================================================

/// Pure sizing heuristic producing a ratio of the allowed quota.
///
/// Clamped to [0.1, 1.0] before the global risk factor (0.5 after the daily
/// profit lock) scales it down.
pub fn recommend_position_ratio(
    atr_ratio: f64,
    adx: f64,
    confidence: Confidence,
    _pnl_ratio: f64,
    sentiment: f64,
    global_risk_factor: f64,
) -> f64 {
    let mut ratio: f64 = 1.0;

    // Volatility adjustment.
    if atr_ratio > 2.0 {
        ratio *= 0.5;
    } else if atr_ratio < 0.8 {
        ratio *= 0.8;
    }

    // Trend strength.
    if adx > 50.0 {
        ratio *= 1.2;
    } else if adx < 20.0 {
        ratio *= 0.6;
    }

    // Sentiment: greed trims, fear cuts hard and caps the ceiling.
    let mut cap: f64 = 1.0;
    if sentiment > 80.0 {
        ratio *= 0.6;
    } else if sentiment < 20.0 {
        ratio *= 0.3;
        cap = 0.5;
    }

    match confidence {
        Confidence::High => ratio *= 1.2,
        Confidence::Low => ratio *= 0.5,
        Confidence::Medium => {}
    }

    ratio.min(cap).clamp(0.1, 1.0) * global_risk_factor
}

// =============================================================================
// Live position lookup
// =============================================================================

pub struct PositionManager {
    exchange: Arc<dyn Exchange>,
    symbol: String,
    trade_mode: TradeMode,
}

impl PositionManager {
    pub fn new(exchange: Arc<dyn Exchange>, symbol: String, trade_mode: TradeMode) -> Self {
        Self {
            exchange,
            symbol,
            trade_mode,
        }
    }

    /// Current position normalized across swap and spot markets; `None` when
    /// flat (or the spot holding is below min notional).
    pub async fn current_position(&self) -> Result<Option<Position>> {
        let market = self.exchange.market(&self.symbol);
        let is_contract = market.as_ref().map(|m| m.is_contract).unwrap_or(false);
        let contract_size = market.as_ref().map(|m| m.contract_size).unwrap_or(1.0);

        if is_contract {
            let positions = self.exchange.fetch_positions(&self.symbol).await?;
            for p in positions {
                if p.contracts > 0.0 {
                    let side = if p.side == "short" { Side::Short } else { Side::Long };
                    return Ok(Some(Position {
                        symbol: self.symbol.clone(),
                        side,
                        size: p.contracts,
                        coin_size: p.contracts * contract_size,
                        entry_price: p.entry_price,
                        unrealized_pnl: p.unrealized_pnl,
                        leverage: p.leverage,
                        mode: Some(self.trade_mode),
                    }));
                }
            }
            return Ok(None);
        }

        // Spot: the base-currency balance IS the position.
        let base = self.symbol.split('/').next().unwrap_or("");
        let balance = self.exchange.fetch_balance().await?;
        let holding = balance.asset_total(base);
        if holding <= 0.0 {
            return Ok(None);
        }

        let ticker = self.exchange.fetch_ticker(&self.symbol).await?;
        let min_cost = market.map(|m| m.min_cost).unwrap_or(5.0);
        if holding * ticker.last < min_cost {
            return Ok(None); // dust, not a position
        }

        let entry = self.avg_entry_price().await.unwrap_or(ticker.last);
        Ok(Some(Position {
            symbol: self.symbol.clone(),
            side: Side::Long,
            size: holding,
            coin_size: holding,
            entry_price: entry,
            unrealized_pnl: (ticker.last - entry) * holding,
            leverage: 1.0,
            mode: Some(TradeMode::Cash),
        }))
    }

    /// Base-currency balance available to sell (spot mode).
    pub async fn spot_balance(&self) -> Result<f64> {
        let base = self.symbol.split('/').next().unwrap_or("");
        let balance = self.exchange.fetch_balance().await?;
        Ok(balance.asset_avail(base))
    }

    /// Approximate the spot entry from the most recent buy fill.
    async fn avg_entry_price(&self) -> Option<f64> {
        match self.exchange.fetch_my_trades(&self.symbol, 100).await {
            Ok(fills) => fills
                .iter()
                .rev()
                .find(|f| f.side == "buy")
                .map(|f| f.price),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "fill history unavailable");
                None
            }
        }
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("symbol", &self.symbol)
            .field("trade_mode", &self.trade_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trailing_config() -> TrailingStopConfig {
        TrailingStopConfig {
            enabled: true,
            activation_pnl: 0.02,
            callback_rate: 0.005,
        }
    }

    // ---- dynamic callback --------------------------------------------------

    #[test]
    fn callback_volatility_rebase() {
        // Small profit, no compression band engaged below 2%.
        assert!((dynamic_callback(0.005, 2.5, 0.01) - 0.025).abs() < 1e-12);
        assert!((dynamic_callback(0.005, 1.7, 0.01) - 0.015).abs() < 1e-12);
        assert!((dynamic_callback(0.005, 0.5, 0.01) - 0.003).abs() < 1e-12);
        assert!((dynamic_callback(0.005, 1.0, 0.01) - 0.005).abs() < 1e-12);
    }

    #[test]
    fn callback_profit_compression_bands() {
        let base = 0.005;
        assert!((dynamic_callback(base, 1.0, 1.2) - base * 0.05).abs() < 1e-12);
        assert!((dynamic_callback(base, 1.0, 0.6) - base * 0.1).abs() < 1e-12);
        assert!((dynamic_callback(base, 1.0, 0.25) - base * 0.2).abs() < 1e-12);
        assert!((dynamic_callback(base, 1.0, 0.11) - base * 0.4).abs() < 1e-12);
        assert!((dynamic_callback(base, 1.0, 0.06) - base * 0.6).abs() < 1e-12);
        assert!((dynamic_callback(base, 1.0, 0.03) - base * 0.8).abs() < 1e-12);
        assert!((dynamic_callback(base, 1.0, 0.01) - base).abs() < 1e-12);
    }

    // ---- partial TP + trailing (staged walkthrough) -----------------------

    #[test]
    fn partial_tp_staging_walkthrough() {
        // Long from 100; prices 101, 103, 105, 110, 111, 108.
        let cfg = trailing_config();
        let mut state = DynamicRiskState::default();

        assert_eq!(evaluate_trailing(&mut state, 0.01, 1.0, &cfg), TrailingAction::None);
        assert_eq!(evaluate_trailing(&mut state, 0.03, 1.0, &cfg), TrailingAction::None);

        // +5%: stage 5 fires, peak re-tracks to 3.5%.
        match evaluate_trailing(&mut state, 0.05, 1.0, &cfg) {
            TrailingAction::PartialClose { fraction, stage } => {
                assert!((fraction - 0.3).abs() < 1e-12);
                assert_eq!(stage, TpStage::Stage5);
            }
            other => panic!("expected stage 5, got {other:?}"),
        }
        assert!((state.trailing_max_pnl - 0.035).abs() < 1e-12);

        // +10%: stage 10 fires, peak re-tracks to 7%.
        match evaluate_trailing(&mut state, 0.10, 1.0, &cfg) {
            TrailingAction::PartialClose { stage, .. } => assert_eq!(stage, TpStage::Stage10),
            other => panic!("expected stage 10, got {other:?}"),
        }
        assert!((state.trailing_max_pnl - 0.07).abs() < 1e-12);

        // +11%: peak advances, nothing fires.
        assert_eq!(evaluate_trailing(&mut state, 0.11, 1.0, &cfg), TrailingAction::None);
        assert!((state.trailing_max_pnl - 0.11).abs() < 1e-12);

        // +8%: drawdown 3pp >= compressed callback (0.5% * 0.4 = 0.2%).
        match evaluate_trailing(&mut state, 0.08, 1.0, &cfg) {
            TrailingAction::FullClose { peak, callback, .. } => {
                assert!((peak - 0.11).abs() < 1e-12);
                assert!((callback - 0.002).abs() < 1e-12);
            }
            other => panic!("expected full close, got {other:?}"),
        }
    }

    #[test]
    fn stages_fire_once_per_position() {
        let cfg = trailing_config();
        let mut state = DynamicRiskState::default();
        evaluate_trailing(&mut state, 0.05, 1.0, &cfg);
        // Dropping and re-reaching +5% does not re-fire stage 5.
        assert!(!matches!(
            evaluate_trailing(&mut state, 0.052, 1.0, &cfg),
            TrailingAction::PartialClose { .. }
        ));
    }

    #[test]
    fn stage10_requires_stage5_first() {
        let cfg = trailing_config();
        let mut state = DynamicRiskState::default();
        // A gap straight to +12% fires stage 5 on this tick...
        match evaluate_trailing(&mut state, 0.12, 1.0, &cfg) {
            TrailingAction::PartialClose { stage, .. } => assert_eq!(stage, TpStage::Stage5),
            other => panic!("expected stage 5 first, got {other:?}"),
        }
        // ...and stage 10 on the next.
        match evaluate_trailing(&mut state, 0.12, 1.0, &cfg) {
            TrailingAction::PartialClose { stage, .. } => assert_eq!(stage, TpStage::Stage10),
            other => panic!("expected stage 10 second, got {other:?}"),
        }
    }

    #[test]
    fn disabled_layer_is_inert() {
        let mut cfg = trailing_config();
        cfg.enabled = false;
        let mut state = DynamicRiskState::default();
        assert_eq!(evaluate_trailing(&mut state, 0.5, 1.0, &cfg), TrailingAction::None);
        assert_eq!(state.trailing_max_pnl, 0.0);
    }

    #[test]
    fn below_activation_never_full_closes() {
        let cfg = trailing_config();
        let mut state = DynamicRiskState::default();
        evaluate_trailing(&mut state, 0.015, 1.0, &cfg);
        // Big relative drawdown but peak never reached activation.
        assert_eq!(evaluate_trailing(&mut state, 0.001, 1.0, &cfg), TrailingAction::None);
    }

    // ---- protective stop ---------------------------------------------------

    fn long_position(entry: f64) -> Position {
        Position {
            symbol: "ETH/USDT:USDT".into(),
            side: Side::Long,
            size: 1.0,
            coin_size: 1.0,
            entry_price: entry,
            unrealized_pnl: 0.0,
            leverage: 5.0,
            mode: None,
        }
    }

    fn candle(high: f64, low: f64) -> Candle {
        Candle {
            timestamp_ms: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
        }
    }

    #[test]
    fn breakeven_promotion_on_activation() {
        let mut state = DynamicRiskState::default();
        let pos = long_position(100.0);
        let moved = update_protective_stop(&mut state, &pos, 103.0, &[], 0.02);
        assert!(moved);
        assert!((state.stop_loss - 100.1).abs() < 1e-9);
        assert_eq!(state.sl_side, Some(Side::Long));
    }

    #[test]
    fn candle_trailing_is_monotonic_up_for_longs() {
        let mut state = DynamicRiskState {
            stop_loss: 100.1,
            sl_side: Some(Side::Long),
            ..Default::default()
        };
        let pos = long_position(100.0);
        let candles = vec![candle(106.0, 102.0), candle(107.0, 103.0), candle(108.0, 104.0)];
        assert!(update_protective_stop(&mut state, &pos, 107.0, &candles, 0.02));
        assert!((state.stop_loss - 102.0).abs() < 1e-9);

        // A lower 3-candle low must never widen the stop back down.
        let worse = vec![candle(106.0, 99.0), candle(107.0, 99.5), candle(108.0, 99.8)];
        update_protective_stop(&mut state, &pos, 107.0, &worse, 0.02);
        assert!(state.stop_loss >= 102.0);
    }

    #[test]
    fn short_breakeven_and_trailing_move_down() {
        let mut state = DynamicRiskState::default();
        let mut pos = long_position(100.0);
        pos.side = Side::Short;

        update_protective_stop(&mut state, &pos, 97.0, &[], 0.02);
        assert!((state.stop_loss - 99.9).abs() < 1e-9);

        let candles = vec![candle(98.5, 96.0), candle(98.0, 95.5), candle(97.5, 95.0)];
        update_protective_stop(&mut state, &pos, 96.0, &candles, 0.02);
        assert!((state.stop_loss - 98.5).abs() < 1e-9);
    }

    #[test]
    fn no_stop_means_no_candle_trailing() {
        let mut state = DynamicRiskState::default();
        let pos = long_position(100.0);
        let candles = vec![candle(106.0, 102.0), candle(107.0, 103.0), candle(108.0, 104.0)];
        // Below activation and no existing stop: nothing to trail from.
        assert!(!update_protective_stop(&mut state, &pos, 101.0, &candles, 0.02));
        assert_eq!(state.stop_loss, 0.0);
    }

    // ---- sizer -------------------------------------------------------------

    #[test]
    fn sizer_neutral_inputs_full_size() {
        let r = recommend_position_ratio(1.0, 30.0, Confidence::Medium, 0.0, 50.0, 1.0);
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sizer_penalises_wild_and_dead_tape() {
        let wild = recommend_position_ratio(2.5, 30.0, Confidence::Medium, 0.0, 50.0, 1.0);
        assert!((wild - 0.5).abs() < 1e-12);
        let dead = recommend_position_ratio(0.5, 30.0, Confidence::Medium, 0.0, 50.0, 1.0);
        assert!((dead - 0.8).abs() < 1e-12);
    }

    #[test]
    fn sizer_fear_caps_at_half() {
        let r = recommend_position_ratio(1.0, 60.0, Confidence::High, 0.0, 10.0, 1.0);
        assert!(r <= 0.5);
        // Even maximum bullishness cannot break the fear cap.
        assert!(r >= 0.1);
    }

    #[test]
    fn sizer_confidence_scaling_and_floor() {
        let low = recommend_position_ratio(1.0, 30.0, Confidence::Low, 0.0, 50.0, 1.0);
        assert!((low - 0.5).abs() < 1e-12);
        // Stacked penalties still respect the 0.1 floor.
        let floor = recommend_position_ratio(2.5, 10.0, Confidence::Low, 0.0, 85.0, 1.0);
        assert!((floor - 0.1).abs() < 1e-12);
    }

    #[test]
    fn sizer_global_risk_factor_applies_after_clamp() {
        let r = recommend_position_ratio(1.0, 30.0, Confidence::Medium, 0.0, 50.0, 0.5);
        assert!((r - 0.5).abs() < 1e-12);
    }

    // ---- state persistence -------------------------------------------------

    #[test]
    fn state_roundtrip_and_daily_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = DynamicRiskState {
            stop_loss: 99.5,
            sl_side: Some(Side::Long),
            trailing_max_pnl: 0.07,
            stage_5_hit: true,
            daily_high_equity: 1234.0,
            high_water_day: today_tag(),
            ..Default::default()
        };
        state.save(&path).unwrap();

        let loaded = DynamicRiskState::load(&path);
        assert!((loaded.stop_loss - 99.5).abs() < 1e-12);
        assert!((loaded.trailing_max_pnl - 0.07).abs() < 1e-12);
        assert!(loaded.stage_5_hit);
        // Same day: high water preserved.
        assert!((loaded.daily_high_equity - 1234.0).abs() < 1e-12);

        // Stale day: daily fields reset on load.
        state.high_water_day = "19990101".into();
        state.save(&path).unwrap();
        let loaded = DynamicRiskState::load(&path);
        assert_eq!(loaded.daily_high_equity, 0.0);
        assert_eq!(loaded.high_water_day, today_tag());
        // Non-daily fields survive the reset.
        assert!(loaded.stage_5_hit);
    }

    #[test]
    fn clear_position_state_zeroes_position_fields_only() {
        let mut state = DynamicRiskState {
            stop_loss: 95.0,
            take_profit: 120.0,
            sl_side: Some(Side::Long),
            trailing_max_pnl: 0.08,
            stage_5_hit: true,
            stage_10_hit: true,
            last_trade_at: 42,
            consecutive_failures: 2,
            ..Default::default()
        };
        state.clear_position_state();
        assert_eq!(state.stop_loss, 0.0);
        assert_eq!(state.sl_side, None);
        assert_eq!(state.trailing_max_pnl, 0.0);
        assert!(!state.stage_5_hit && !state.stage_10_hit);
        // Cooldown clocks and failure counters are not position-scoped.
        assert_eq!(state.last_trade_at, 42);
        assert_eq!(state.consecutive_failures, 2);
    }

    #[test]
    fn breaker_window() {
        let state = DynamicRiskState {
            circuit_breaker_until: 1000,
            ..Default::default()
        };
        assert!(state.breaker_active(999));
        assert!(!state.breaker_active(1000));
    }
}
