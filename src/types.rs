// =============================================================================
// Shared types used across the Oracle trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite direction (used by flip handling).
    pub fn flipped(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Order side on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Margin/settlement mode for a symbol. `Cash` means plain spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Cash,
    Cross,
    Isolated,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::Cross
    }
}

impl TradeMode {
    pub fn as_td_mode(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Cross => "cross",
            Self::Isolated => "isolated",
        }
    }
}

/// Advisor verdict. `amount == 0` on a Buy/Sell against an open position
/// means "close only, do not flip" — see `AdvisorDecision::is_close_only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Advisor confidence tier; ranked LOW < MEDIUM < HIGH for gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM", alias = "MED")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
}

impl Confidence {
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "HIGH" => Self::High,
            "MEDIUM" | "MED" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Volatility/trend classification of the market, used to pick the advisor
/// persona and to shape execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketRegime {
    #[serde(rename = "HIGH_TREND")]
    HighTrend,
    #[serde(rename = "HIGH_CHOPPY")]
    HighChoppy,
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "NORMAL")]
    Normal,
}

impl Default for MarketRegime {
    fn default() -> Self {
        Self::Normal
    }
}

impl MarketRegime {
    /// Display name of the persona bound to this regime.
    pub fn persona(&self) -> &'static str {
        match self {
            Self::HighTrend => "Trend Hunter",
            Self::HighChoppy => "Risk Guardian",
            Self::Low => "Grid Trader",
            Self::Normal => "Day Trader",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighTrend => write!(f, "HIGH_TREND"),
            Self::HighChoppy => write!(f, "HIGH_CHOPPY"),
            Self::Low => write!(f, "LOW"),
            Self::Normal => write!(f, "NORMAL"),
        }
    }
}

/// Outcome of one pass through the execution guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecStatus {
    Executed,
    Hold,
    HoldDup,
    SkippedConf,
    SkippedCooldown,
    SkippedFreq,
    SkippedSlippage,
    SkippedProfit,
    SkippedMin,
    SkippedFull,
    SkippedZero,
    SkippedBreaker,
    Stopped,
    Failed,
    Monitoring,
}

impl ExecStatus {
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::SkippedConf
                | Self::SkippedCooldown
                | Self::SkippedFreq
                | Self::SkippedSlippage
                | Self::SkippedProfit
                | Self::SkippedMin
                | Self::SkippedFull
                | Self::SkippedZero
                | Self::SkippedBreaker
        )
    }

    /// Icon + short label for the dashboard column.
    pub fn display_cell(&self) -> String {
        match self {
            Self::Executed => "\u{2705} DONE".to_string(),
            Self::Hold | Self::HoldDup => "\u{23f8}\u{fe0f} HOLD".to_string(),
            Self::SkippedFull => "\u{1f512} FULL".to_string(),
            Self::SkippedCooldown | Self::SkippedFreq => "\u{1f9ca} COOLDOWN".to_string(),
            Self::Failed => "\u{274c} FAILED".to_string(),
            Self::Stopped => "\u{1f6d1} STOPPED".to_string(),
            Self::Monitoring => "\u{1f440} SCAN".to_string(),
            s if s.is_skip() => "\u{1f6ab} SKIPPED".to_string(),
            _ => "\u{23f3} WAIT".to_string(),
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Executed => "EXECUTED",
            Self::Hold => "HOLD",
            Self::HoldDup => "HOLD_DUP",
            Self::SkippedConf => "SKIPPED_CONF",
            Self::SkippedCooldown => "SKIPPED_COOLDOWN",
            Self::SkippedFreq => "SKIPPED_FREQ",
            Self::SkippedSlippage => "SKIPPED_SLIPPAGE",
            Self::SkippedProfit => "SKIPPED_PROFIT",
            Self::SkippedMin => "SKIPPED_MIN",
            Self::SkippedFull => "SKIPPED_FULL",
            Self::SkippedZero => "SKIPPED_ZERO",
            Self::SkippedBreaker => "SKIPPED_BREAKER",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Monitoring => "MONITORING",
        };
        write!(f, "{s}")
    }
}

/// Structured decision returned by the advisor, typed past the parse
/// boundary (no stringly signals downstream).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorDecision {
    pub signal: Signal,
    pub confidence: Confidence,
    /// Suggested size in base-currency units. Zero on a close signal means
    /// "close only, do not open the opposite side".
    pub amount: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reason: String,
    pub summary: String,
}

impl AdvisorDecision {
    pub fn is_close_only(&self) -> bool {
        self.amount <= 0.0 && self.signal != Signal::Hold
    }
}

/// Live position snapshot normalized across swap and spot markets.
///
/// For contracts `size` is in contracts and `coin_size = size * contract_size`;
/// for spot both carry the base-currency balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub coin_size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    #[serde(default)]
    pub mode: Option<TradeMode>,
}

impl Position {
    /// Price-move pnl ratio relative to entry (not ROE).
    pub fn pnl_ratio(&self, current_price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            Side::Long => (current_price - self.entry_price) / self.entry_price,
            Side::Short => (self.entry_price - current_price) / self.entry_price,
        }
    }
}
