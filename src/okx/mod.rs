// =============================================================================
// Exchange abstraction — typed client interface consumed by the engine
// =============================================================================
//
// The trading core never talks HTTP directly; it goes through this trait so
// the simulator and tests can stand in for the live venue. `OkxClient` is the
// production implementation.
// =============================================================================

pub mod client;
pub mod rate_limit;

pub use client::OkxClient;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market::candles::Candle;
pub use crate::types::OrderSide;

/// Last-trade snapshot.
#[derive(Debug, Clone, Default)]
pub struct Ticker {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    /// 24 h change in percent, when the venue reports it.
    pub change_24h_pct: Option<f64>,
}

/// Per-asset balance line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub ccy: String,
    pub avail: f64,
    pub total: f64,
}

/// Account snapshot. `total_equity` prefers the unified-account figure when
/// the venue provides one; otherwise callers value spot holdings themselves.
#[derive(Debug, Clone, Default)]
pub struct AccountBalance {
    pub total_equity: f64,
    pub avail_usdt: f64,
    pub details: Vec<AssetBalance>,
    /// True when `total_equity` came from the unified-account field and
    /// already includes all holdings.
    pub unified_equity: bool,
}

impl AccountBalance {
    pub fn asset_total(&self, ccy: &str) -> f64 {
        self.details
            .iter()
            .find(|a| a.ccy == ccy)
            .map(|a| a.total)
            .unwrap_or(0.0)
    }

    pub fn asset_avail(&self, ccy: &str) -> f64 {
        self.details
            .iter()
            .find(|a| a.ccy == ccy)
            .map(|a| a.avail)
            .unwrap_or(0.0)
    }
}

/// Raw position line as the venue reports it.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: String,
    pub contracts: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
}

/// One fill from trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub side: String,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
    pub fee: f64,
    /// Realized pnl attached to closing fills (contracts only).
    pub pnl: f64,
    pub timestamp_ms: i64,
}

/// Ledger entry classification used by deposit/withdrawal detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKind {
    Deposit,
    Withdrawal,
    Transfer,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub kind: LedgerKind,
    /// Signed balance change in the entry's currency.
    pub amount: f64,
    pub currency: String,
    pub timestamp_ms: i64,
}

impl LedgerEntry {
    /// Whether this entry moves external funds and must be folded into the
    /// deposit offset.
    pub fn is_funding_flow(&self) -> bool {
        matches!(
            self.kind,
            LedgerKind::Deposit | LedgerKind::Withdrawal | LedgerKind::Transfer
        )
    }
}

/// Taker/maker fee rates as fractions (0.0005 = 5 bps).
#[derive(Debug, Clone, Copy)]
pub struct FeeRates {
    pub taker: f64,
    pub maker: f64,
}

/// Static instrument metadata cached from `load_markets`.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub inst_id: String,
    pub is_contract: bool,
    /// Base-currency value of one contract; 1.0 for spot.
    pub contract_size: f64,
    /// Minimum order size in the venue's native unit (contracts or base ccy).
    pub min_amount: f64,
    /// Order size step in the native unit.
    pub lot_size: f64,
    /// Minimum order notional in quote currency.
    pub min_cost: f64,
}

impl MarketInfo {
    /// Minimum size expressed in base-currency units.
    pub fn min_amount_coins(&self) -> f64 {
        if self.is_contract {
            self.min_amount * self.contract_size
        } else {
            self.min_amount
        }
    }

    /// Round a native-unit size down to the lot grid.
    pub fn amount_to_precision(&self, amount: f64) -> f64 {
        if self.lot_size <= 0.0 {
            return amount;
        }
        (amount / self.lot_size + 1e-9).floor() * self.lot_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

/// Order submission request. `amount` is in the venue's native size unit
/// (contracts for swaps, base currency for spot).
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
    pub td_mode: String,
    pub reduce_only: bool,
    /// Spot buys interpret `sz` as base-currency units when set.
    pub tgt_base_ccy: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, amount: f64, td_mode: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            amount,
            price: None,
            td_mode: td_mode.to_string(),
            reduce_only: false,
            tgt_base_ccy: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderAck {
    pub order_id: String,
}

/// Typed exchange client interface. The engine is written against this; the
/// live OKX REST client and any test double implement it.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Populate the instrument cache for the given symbols.
    async fn load_markets(&self, symbols: &[String]) -> Result<()>;

    /// Cached instrument metadata; `None` until `load_markets` has run.
    fn market(&self, symbol: &str) -> Option<MarketInfo>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// Candles in ascending timestamp order.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>>;

    async fn fetch_balance(&self) -> Result<AccountBalance>;

    async fn fetch_positions(&self, symbol: &str) -> Result<Vec<PositionInfo>>;

    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> Result<Vec<Fill>>;

    async fn fetch_trading_fee(&self, symbol: &str) -> Result<FeeRates>;

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<f64>;

    async fn fetch_ledger(&self, currency: &str, limit: u32) -> Result<Vec<LedgerEntry>>;

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderAck>;

    async fn set_leverage(&self, symbol: &str, leverage: u32, mgn_mode: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swap_market() -> MarketInfo {
        MarketInfo {
            inst_id: "ETH-USDT-SWAP".into(),
            is_contract: true,
            contract_size: 0.1,
            min_amount: 1.0,
            lot_size: 1.0,
            min_cost: 5.0,
        }
    }

    #[test]
    fn min_amount_in_coins_scales_by_contract_size() {
        let m = swap_market();
        assert!((m.min_amount_coins() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn amount_precision_floors_to_lot_grid() {
        let m = MarketInfo {
            inst_id: "BTC-USDT".into(),
            is_contract: false,
            contract_size: 1.0,
            min_amount: 0.0001,
            lot_size: 0.0001,
            min_cost: 5.0,
        };
        assert!((m.amount_to_precision(0.12345) - 0.1234).abs() < 1e-9);
        // Epsilon keeps exact multiples from rounding down a step.
        assert!((m.amount_to_precision(0.1234) - 0.1234).abs() < 1e-9);
    }

    #[test]
    fn ledger_funding_flow_classification() {
        let mut e = LedgerEntry {
            id: "1".into(),
            kind: LedgerKind::Deposit,
            amount: 50.0,
            currency: "USDT".into(),
            timestamp_ms: 0,
        };
        assert!(e.is_funding_flow());
        e.kind = LedgerKind::Other;
        assert!(!e.is_funding_flow());
    }

    #[test]
    fn balance_asset_lookup() {
        let bal = AccountBalance {
            total_equity: 100.0,
            avail_usdt: 80.0,
            details: vec![AssetBalance {
                ccy: "ETH".into(),
                avail: 1.5,
                total: 2.0,
            }],
            unified_equity: false,
        };
        assert!((bal.asset_total("ETH") - 2.0).abs() < 1e-12);
        assert_eq!(bal.asset_total("BTC"), 0.0);
        assert!((bal.asset_avail("ETH") - 1.5).abs() < 1e-12);
    }
}
