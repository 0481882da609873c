// =============================================================================
// Test-mode simulator — mirrors the live executor's return protocol
// =============================================================================
//
// Tracks its own balance, position, realized pnl and a bounded trade ring.
// State lives in `data/sim_state_<sym>.json` so switching between test and
// live mode preserves the simulated tally. Fills are priced at the supplied
// tick with taker fees deducted; no slippage model.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{ExecStatus, Position, Side, Signal, TradeMode};

/// Trades kept in the ring buffer.
const MAX_SIM_TRADES: usize = 200;
/// Close requests within 1% of the full size collapse to a full close.
const FULL_CLOSE_TOLERANCE: f64 = 0.99;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimTrade {
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub pnl: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimState {
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub trades: Vec<SimTrade>,
}

pub struct Simulator {
    symbol: String,
    trade_mode: TradeMode,
    taker_fee_rate: f64,
    state_path: PathBuf,
    pub state: SimState,
}

impl Simulator {
    pub fn new(
        symbol: &str,
        trade_mode: TradeMode,
        taker_fee_rate: f64,
        state_path: PathBuf,
        initial_balance: f64,
    ) -> Self {
        let mut sim = Self {
            symbol: symbol.to_string(),
            trade_mode,
            taker_fee_rate,
            state_path,
            state: SimState::default(),
        };
        sim.load();
        if sim.state.balance <= 0.0 {
            sim.state.balance = if initial_balance > 0.0 {
                initial_balance
            } else {
                10_000.0
            };
            info!(symbol = %sim.symbol, balance = sim.state.balance, "sim balance initialised");
        }
        sim
    }

    pub fn set_fee_rate(&mut self, taker: f64) {
        self.taker_fee_rate = taker;
    }

    fn load(&mut self) {
        match std::fs::read_to_string(&self.state_path) {
            Ok(raw) => match serde_json::from_str::<SimState>(&raw) {
                Ok(state) => {
                    debug!(symbol = %self.symbol, balance = state.balance, "sim state restored");
                    self.state = state;
                }
                Err(e) => warn!(symbol = %self.symbol, error = %e, "sim state unreadable"),
            },
            Err(_) => {} // first run
        }
    }

    /// Persist with the tmp + rename pattern.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("failed to create data dir")?;
            }
        }
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.state)?)
            .context("failed to write sim state tmp")?;
        std::fs::rename(&tmp, &self.state_path).context("failed to rename sim state")?;
        Ok(())
    }

    /// Mark-to-market the held position and return a copy.
    pub fn position(&mut self, current_price: f64) -> Option<Position> {
        if let Some(pos) = self.state.position.as_mut() {
            if current_price > 0.0 {
                pos.unrealized_pnl = match pos.side {
                    Side::Long => (current_price - pos.entry_price) * pos.coin_size,
                    Side::Short => (pos.entry_price - current_price) * pos.coin_size,
                };
            }
        }
        self.state.position.clone()
    }

    /// Equity = cash balance plus market value / pnl of the held position.
    pub fn equity(&mut self, current_price: f64) -> f64 {
        let balance = self.state.balance;
        match self.position(current_price) {
            Some(pos) if self.trade_mode == TradeMode::Cash => {
                balance + pos.coin_size * current_price
            }
            Some(pos) => balance + pos.unrealized_pnl,
            None => balance,
        }
    }

    /// Execute a fill at `price`. `amount` is in base-currency units.
    pub fn execute(
        &mut self,
        signal: Signal,
        amount: f64,
        price: f64,
    ) -> (ExecStatus, String) {
        if price <= 0.0 {
            return (ExecStatus::Failed, "no price for simulated fill".into());
        }
        let result = match signal {
            Signal::Buy => self.execute_buy(amount, price),
            Signal::Sell => self.execute_sell(amount, price),
            Signal::Hold => (ExecStatus::Hold, "advisor holds".into()),
        };
        if let Err(e) = self.save() {
            warn!(symbol = %self.symbol, error = %e, "sim state save failed");
        }
        result
    }

    fn fee_for(&self, amount: f64, price: f64) -> f64 {
        amount * price * self.taker_fee_rate
    }

    fn execute_buy(&mut self, amount: f64, price: f64) -> (ExecStatus, String) {
        match self.state.position.clone() {
            Some(pos) if pos.side == Side::Short => self.close_into(pos, amount, price, "buy"),
            Some(pos) => {
                // Pyramiding: average the entry.
                if amount <= 0.0 {
                    return (ExecStatus::SkippedZero, "computed size is zero".into());
                }
                let fee = self.fee_for(amount, price);
                let new_size = pos.coin_size + amount;
                let avg = (pos.coin_size * pos.entry_price + amount * price) / new_size;
                let mut pos = pos;
                pos.size = new_size;
                pos.coin_size = new_size;
                pos.entry_price = avg;
                self.state.position = Some(pos);
                self.state.balance -= fee;
                if self.trade_mode == TradeMode::Cash {
                    self.state.balance -= amount * price;
                }
                self.record("buy", price, amount, fee, 0.0);
                (ExecStatus::Executed, format!("sim add long {amount:.6} @ {price:.4}"))
            }
            None => {
                if amount <= 0.0 {
                    return (ExecStatus::SkippedZero, "computed size is zero".into());
                }
                let fee = self.fee_for(amount, price);
                self.state.position = Some(Position {
                    symbol: self.symbol.clone(),
                    side: Side::Long,
                    size: amount,
                    coin_size: amount,
                    entry_price: price,
                    unrealized_pnl: 0.0,
                    leverage: 1.0,
                    mode: Some(self.trade_mode),
                });
                self.state.balance -= fee;
                if self.trade_mode == TradeMode::Cash {
                    self.state.balance -= amount * price;
                }
                self.record("buy", price, amount, fee, 0.0);
                (ExecStatus::Executed, format!("sim open long {amount:.6} @ {price:.4}"))
            }
        }
    }

    fn execute_sell(&mut self, amount: f64, price: f64) -> (ExecStatus, String) {
        match self.state.position.clone() {
            Some(pos) if pos.side == Side::Long => self.close_into(pos, amount, price, "sell"),
            Some(pos) => {
                if amount <= 0.0 {
                    return (ExecStatus::SkippedZero, "computed size is zero".into());
                }
                let fee = self.fee_for(amount, price);
                let new_size = pos.coin_size + amount;
                let avg = (pos.coin_size * pos.entry_price + amount * price) / new_size;
                let mut pos = pos;
                pos.size = new_size;
                pos.coin_size = new_size;
                pos.entry_price = avg;
                self.state.position = Some(pos);
                self.state.balance -= fee;
                self.record("sell", price, amount, fee, 0.0);
                (ExecStatus::Executed, format!("sim add short {amount:.6} @ {price:.4}"))
            }
            None => {
                if self.trade_mode == TradeMode::Cash {
                    return (ExecStatus::Failed, "spot mode cannot short".into());
                }
                if amount <= 0.0 {
                    return (ExecStatus::SkippedZero, "computed size is zero".into());
                }
                let fee = self.fee_for(amount, price);
                self.state.position = Some(Position {
                    symbol: self.symbol.clone(),
                    side: Side::Short,
                    size: amount,
                    coin_size: amount,
                    entry_price: price,
                    unrealized_pnl: 0.0,
                    leverage: 1.0,
                    mode: Some(self.trade_mode),
                });
                self.state.balance -= fee;
                self.record("sell", price, amount, fee, 0.0);
                (ExecStatus::Executed, format!("sim open short {amount:.6} @ {price:.4}"))
            }
        }
    }

    /// Close some or all of `pos` at `price`. Requests at or above 99% of the
    /// held size become a full close.
    fn close_into(
        &mut self,
        pos: Position,
        amount: f64,
        price: f64,
        trade_side: &str,
    ) -> (ExecStatus, String) {
        let close_amount = if amount <= 0.0 || amount >= pos.coin_size * FULL_CLOSE_TOLERANCE {
            pos.coin_size
        } else {
            amount
        };
        let fee = self.fee_for(close_amount, price);

        let pnl = match pos.side {
            Side::Long => (price - pos.entry_price) * close_amount,
            Side::Short => (pos.entry_price - price) * close_amount,
        } - fee;

        self.state.realized_pnl += pnl;
        self.state.balance += pnl;
        if self.trade_mode == TradeMode::Cash && pos.side == Side::Long {
            // Selling spot returns the cost basis as well.
            self.state.balance += close_amount * pos.entry_price;
        }

        let full_close = (close_amount - pos.coin_size).abs() < f64::EPSILON;
        if full_close {
            self.state.position = None;
        } else {
            let mut rest = pos.clone();
            rest.size -= close_amount;
            rest.coin_size -= close_amount;
            self.state.position = Some(rest);
        }

        self.record(trade_side, price, close_amount, fee, pnl);
        let kind = if full_close { "close" } else { "reduce" };
        (
            ExecStatus::Executed,
            format!("sim {kind} {} {close_amount:.6} @ {price:.4} pnl {pnl:+.2}", pos.side),
        )
    }

    fn record(&mut self, side: &str, price: f64, amount: f64, fee: f64, pnl: f64) {
        self.state.trades.push(SimTrade {
            side: side.to_string(),
            price,
            amount,
            fee,
            pnl,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
        while self.state.trades.len() > MAX_SIM_TRADES {
            self.state.trades.remove(0);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sim(mode: TradeMode) -> (tempfile::TempDir, Simulator) {
        let dir = tempfile::tempdir().unwrap();
        let s = Simulator::new(
            "ETH/USDT:USDT",
            mode,
            0.001,
            dir.path().join("sim.json"),
            1000.0,
        );
        (dir, s)
    }

    #[test]
    fn open_close_long_realizes_pnl() {
        let (_d, mut s) = sim(TradeMode::Cross);
        let (status, _) = s.execute(Signal::Buy, 1.0, 100.0);
        assert_eq!(status, ExecStatus::Executed);
        assert!(s.state.position.is_some());

        let (status, msg) = s.execute(Signal::Sell, 1.0, 110.0);
        assert_eq!(status, ExecStatus::Executed);
        assert!(msg.contains("close"));
        assert!(s.state.position.is_none());
        // +10 gross, minus fees at both legs.
        assert!(s.state.realized_pnl > 9.0 && s.state.realized_pnl < 10.0);
    }

    #[test]
    fn partial_close_keeps_remainder() {
        let (_d, mut s) = sim(TradeMode::Cross);
        s.execute(Signal::Buy, 1.0, 100.0);
        let (status, msg) = s.execute(Signal::Sell, 0.3, 105.0);
        assert_eq!(status, ExecStatus::Executed);
        assert!(msg.contains("reduce"));
        let pos = s.state.position.clone().unwrap();
        assert!((pos.coin_size - 0.7).abs() < 1e-9);
        assert!((pos.entry_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn near_full_close_collapses_to_full() {
        let (_d, mut s) = sim(TradeMode::Cross);
        s.execute(Signal::Buy, 1.0, 100.0);
        s.execute(Signal::Sell, 0.995, 105.0);
        assert!(s.state.position.is_none());
    }

    #[test]
    fn short_side_pnl() {
        let (_d, mut s) = sim(TradeMode::Cross);
        s.execute(Signal::Sell, 2.0, 100.0);
        let pos = s.position(95.0).unwrap();
        assert_eq!(pos.side, Side::Short);
        assert!((pos.unrealized_pnl - 10.0).abs() < 1e-9);

        s.execute(Signal::Buy, 2.0, 95.0);
        assert!(s.state.position.is_none());
        assert!(s.state.realized_pnl > 9.0);
    }

    #[test]
    fn pyramiding_averages_entry() {
        let (_d, mut s) = sim(TradeMode::Cross);
        s.execute(Signal::Buy, 1.0, 100.0);
        s.execute(Signal::Buy, 1.0, 110.0);
        let pos = s.state.position.clone().unwrap();
        assert!((pos.coin_size - 2.0).abs() < 1e-9);
        assert!((pos.entry_price - 105.0).abs() < 1e-9);
    }

    #[test]
    fn cash_mode_rejects_shorts_and_books_cost_basis() {
        let (_d, mut s) = sim(TradeMode::Cash);
        let (status, _) = s.execute(Signal::Sell, 1.0, 100.0);
        assert_eq!(status, ExecStatus::Failed);

        s.execute(Signal::Buy, 2.0, 100.0);
        // Spot buy locks up cost basis.
        assert!(s.state.balance < 801.0);
        s.execute(Signal::Sell, 2.0, 110.0);
        // Cost basis returned + pnl.
        assert!(s.state.balance > 1015.0);
        assert!(s.state.position.is_none());
    }

    #[test]
    fn equity_marks_open_position() {
        let (_d, mut s) = sim(TradeMode::Cross);
        s.execute(Signal::Buy, 1.0, 100.0);
        let eq = s.equity(120.0);
        assert!(eq > 1015.0, "equity should include unrealized gain, got {eq}");
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        {
            let mut s = Simulator::new("ETH/USDT:USDT", TradeMode::Cross, 0.001, path.clone(), 500.0);
            s.execute(Signal::Buy, 1.0, 100.0);
        }
        let s2 = Simulator::new("ETH/USDT:USDT", TradeMode::Cross, 0.001, path, 500.0);
        assert!(s2.state.position.is_some());
        assert_eq!(s2.state.trades.len(), 1);
    }

    #[test]
    fn trade_ring_is_bounded() {
        let (_d, mut s) = sim(TradeMode::Cross);
        for i in 0..(MAX_SIM_TRADES + 50) {
            let price = 100.0 + (i % 10) as f64;
            s.execute(Signal::Buy, 0.01, price);
            s.execute(Signal::Sell, 0.01, price + 1.0);
        }
        assert!(s.state.trades.len() <= MAX_SIM_TRADES);
    }
}
