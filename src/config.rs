// =============================================================================
// Configuration — JSON file + environment secret overrides
// =============================================================================
//
// Loaded once at startup from `config.json` and re-read by the scheduler when
// the file's mtime changes (hot reload of the symbol set, allocation and
// leverage). Every field carries `#[serde(default)]` so adding new fields
// never breaks loading an older config file.
//
// Secrets are never trusted from the file: `OKX_API_KEY`, `OKX_SECRET`,
// `OKX_PASSWORD`, `DEEPSEEK_API_KEY` and `NOTIFICATION_WEBHOOK` env vars
// override whatever the JSON carries.
// =============================================================================

use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Confidence;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_timeframe() -> String {
    "15m".to_string()
}

fn default_loop_interval() -> u64 {
    60
}

fn default_max_slippage_percent() -> f64 {
    1.0
}

fn default_min_confidence() -> Confidence {
    Confidence::Medium
}

fn default_max_concurrent_traders() -> usize {
    5
}

fn default_ai_interval() -> u64 {
    60
}

fn default_activation_pnl() -> f64 {
    0.02
}

fn default_callback_rate() -> f64 {
    0.005
}

fn default_rsi_min() -> f64 {
    35.0
}

fn default_rsi_max() -> f64 {
    65.0
}

fn default_adx_min() -> f64 {
    25.0
}

fn default_leverage() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_deepseek_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_deepseek_model() -> String {
    "deepseek-chat".to_string()
}

// =============================================================================
// Allocation / amount — "auto", fraction (<= 1.0) or fixed quote amount
// =============================================================================

/// Capital allocation for a symbol. A number `<= 1.0` is a fraction of the
/// base capital, `> 1.0` a fixed USDT amount, and the string `"auto"` splits
/// capital evenly across active symbols.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Allocation {
    Auto,
    Fraction(f64),
    FixedUsdt(f64),
}

impl Default for Allocation {
    fn default() -> Self {
        Self::Auto
    }
}

impl Allocation {
    /// Resolve to a USDT quota given the base capital and the number of
    /// active symbols (for `auto`).
    pub fn quota_usdt(&self, base_capital: f64, active_symbols: usize) -> f64 {
        match self {
            Self::Auto => base_capital / active_symbols.max(1) as f64,
            Self::Fraction(f) => base_capital * f,
            Self::FixedUsdt(u) => *u,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AllocRaw {
    Num(f64),
    Str(String),
}

impl<'de> Deserialize<'de> for Allocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match AllocRaw::deserialize(deserializer)? {
            AllocRaw::Num(v) if v <= 1.0 => Ok(Self::Fraction(v.max(0.0))),
            AllocRaw::Num(v) => Ok(Self::FixedUsdt(v)),
            AllocRaw::Str(s) => {
                if s.eq_ignore_ascii_case("auto") {
                    Ok(Self::Auto)
                } else if let Ok(v) = s.trim().parse::<f64>() {
                    if v <= 1.0 {
                        Ok(Self::Fraction(v.max(0.0)))
                    } else {
                        Ok(Self::FixedUsdt(v))
                    }
                } else {
                    // Unparseable strings fall back to full allocation.
                    Ok(Self::Fraction(1.0))
                }
            }
        }
    }
}

impl Serialize for Allocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fraction(v) | Self::FixedUsdt(v) => serializer.serialize_f64(*v),
        }
    }
}

/// Hard cap on order size in base units: `"auto"` (no cap beyond quota) or a
/// fixed token amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountCap {
    Auto,
    Fixed(f64),
}

impl Default for AmountCap {
    fn default() -> Self {
        Self::Auto
    }
}

impl AmountCap {
    pub fn cap(&self) -> f64 {
        match self {
            Self::Auto => f64::INFINITY,
            Self::Fixed(v) => *v,
        }
    }
}

impl<'de> Deserialize<'de> for AmountCap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match AllocRaw::deserialize(deserializer)? {
            AllocRaw::Num(v) if v > 0.0 => Ok(Self::Fixed(v)),
            _ => Ok(Self::Auto),
        }
    }
}

impl Serialize for AmountCap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fixed(v) => serializer.serialize_f64(*v),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OkxCredentials {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangesConfig {
    #[serde(default)]
    pub okx: OkxCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepSeekConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_deepseek_base_url")]
    pub base_url: String,
    #[serde(default = "default_deepseek_model")]
    pub model: String,
}

impl Default for DeepSeekConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_deepseek_base_url(),
            model: default_deepseek_model(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub deepseek: DeepSeekConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
}

/// Trailing-stop layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Unrealized pnl ratio at which the trailing layer activates.
    #[serde(default = "default_activation_pnl")]
    pub activation_pnl: f64,
    /// Base callback (peak drawdown) rate before ATR/profit compression.
    #[serde(default = "default_callback_rate")]
    pub callback_rate: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_pnl: default_activation_pnl(),
            callback_rate: default_callback_rate(),
        }
    }
}

/// Soft-gate thresholds for the monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalGateConfig {
    #[serde(default = "default_rsi_min")]
    pub rsi_min: f64,
    #[serde(default = "default_rsi_max")]
    pub rsi_max: f64,
    #[serde(default = "default_adx_min")]
    pub adx_min: f64,
}

impl Default for SignalGateConfig {
    fn default() -> Self {
        Self {
            rsi_min: default_rsi_min(),
            rsi_max: default_rsi_max(),
            adx_min: default_adx_min(),
        }
    }
}

/// Market-sentiment input for the position sizer (0..100, 50 = neutral).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentFilterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sentiment_neutral")]
    pub score: f64,
}

fn default_sentiment_neutral() -> f64 {
    50.0
}

impl Default for SentimentFilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            score: default_sentiment_neutral(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Minimum seconds between advisor consultations per symbol.
    #[serde(default = "default_ai_interval")]
    pub ai_interval: u64,
    #[serde(default)]
    pub trailing_stop: TrailingStopConfig,
    #[serde(default)]
    pub signal_gate: SignalGateConfig,
    #[serde(default)]
    pub sentiment_filter: SentimentFilterConfig,
    /// When set, the advisor only runs once per closed bar.
    #[serde(default)]
    pub analyze_on_bar_close: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ai_interval: default_ai_interval(),
            trailing_stop: TrailingStopConfig::default(),
            signal_gate: SignalGateConfig::default(),
            sentiment_filter: SentimentFilterConfig::default(),
            analyze_on_bar_close: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskControlConfig {
    /// Managed principal. Zero means "use live balance".
    #[serde(default)]
    pub initial_balance_usdt: f64,
    #[serde(default)]
    pub max_profit_usdt: f64,
    #[serde(default)]
    pub max_loss_usdt: f64,
    #[serde(default)]
    pub max_profit_rate: f64,
    #[serde(default)]
    pub max_loss_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_loop_interval")]
    pub loop_interval: u64,
    #[serde(default = "default_true")]
    pub test_mode: bool,
    #[serde(default = "default_max_slippage_percent")]
    pub max_slippage_percent: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Confidence,
    #[serde(default = "default_max_concurrent_traders")]
    pub max_concurrent_traders: usize,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk_control: RiskControlConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            timeframe: default_timeframe(),
            loop_interval: default_loop_interval(),
            test_mode: true,
            max_slippage_percent: default_max_slippage_percent(),
            min_confidence: default_min_confidence(),
            max_concurrent_traders: default_max_concurrent_traders(),
            strategy: StrategyConfig::default(),
            risk_control: RiskControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub trade_mode: crate::types::TradeMode,
    #[serde(default)]
    pub margin_mode: Option<String>,
    #[serde(default)]
    pub allocation: Allocation,
    #[serde(default)]
    pub amount: AmountCap,
}

impl SymbolConfig {
    /// Margin mode string sent with `set_leverage`; defaults to the trade
    /// mode when not set explicitly.
    pub fn margin_mode(&self) -> &str {
        self.margin_mode
            .as_deref()
            .unwrap_or_else(|| self.trade_mode.as_td_mode())
    }
}

// =============================================================================
// Top-level config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchanges: ExchangesConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
}

impl Config {
    /// Load configuration from a JSON file and apply env-var overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            symbols = config.symbols.len(),
            timeframe = %config.trading.timeframe,
            test_mode = config.trading.test_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Secrets always come from the environment when present.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OKX_API_KEY") {
            if !v.is_empty() {
                self.exchanges.okx.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("OKX_SECRET") {
            if !v.is_empty() {
                self.exchanges.okx.secret = v;
            }
        }
        if let Ok(v) = std::env::var("OKX_PASSWORD") {
            if !v.is_empty() {
                self.exchanges.okx.password = v;
            }
        }
        if let Ok(v) = std::env::var("DEEPSEEK_API_KEY") {
            if !v.is_empty() {
                self.models.deepseek.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("NOTIFICATION_WEBHOOK") {
            if !v.is_empty() {
                self.notification.webhook_url = v;
                self.notification.enabled = true;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            anyhow::bail!("config contains no symbols");
        }
        for sym in &self.symbols {
            if sym.symbol.is_empty() {
                anyhow::bail!("symbol entry missing its identifier");
            }
            if sym.leverage == 0 {
                anyhow::bail!("symbol {} has leverage 0", sym.symbol);
            }
        }
        if self.exchanges.okx.api_key.is_empty() {
            warn!("OKX API key not configured — only test mode will work");
        }
        if self.models.deepseek.api_key.is_empty() {
            warn!("DeepSeek API key not configured — advisor calls will fail");
        }
        Ok(())
    }

    /// File mtime used by the scheduler's hot-reload poll.
    pub fn mtime(path: impl AsRef<Path>) -> Option<SystemTime> {
        std::fs::metadata(path.as_ref())
            .and_then(|m| m.modified())
            .ok()
    }
}
