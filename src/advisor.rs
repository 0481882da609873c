// =============================================================================
// Advisor client — persona prompt + chat-completion + strict JSON decision
// =============================================================================
//
// The prompt has three layers: a static persona keyed by market regime (cache
// friendly), the dynamic market/account facts, and the output schema. The
// model must answer with a single JSON object; the parser extracts the first
// `{...}` block, uppercases the signal and coerces numerics that may arrive
// as strings. A failed call or unparseable answer yields an error — the
// caller skips this tick's analysis and keeps monitoring.
// =============================================================================

use anyhow::{Context, Result};
use serde_json::json;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::{debug, warn};

use crate::config::DeepSeekConfig;
use crate::market::MarketSnapshot;
use crate::signal::PatternKind;
use crate::types::{AdvisorDecision, Confidence, Position, Signal};

/// Hard deadline on one completion request.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Additional attempts after the first failure.
const RETRIES: usize = 2;
/// Detailed candles shown in the prompt; older bars are summarized away.
const DETAILED_KLINES: usize = 15;

/// Everything the prompt needs beyond the market snapshot.
pub struct AdvisorContext<'a> {
    pub snapshot: &'a MarketSnapshot,
    pub position: Option<&'a Position>,
    pub balance_usdt: f64,
    pub default_amount: f64,
    pub taker_fee_rate: f64,
    pub leverage: u32,
    pub account_pnl: f64,
    pub max_profit_usdt: f64,
    pub funding_rate: f64,
    pub btc_change_24h: Option<f64>,
    pub is_surge: bool,
    pub pattern: Option<PatternKind>,
}

pub struct AdvisorClient {
    client: reqwest::Client,
    config: DeepSeekConfig,
}

impl AdvisorClient {
    pub fn new(config: DeepSeekConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self { client, config }
    }

    /// Cheap connectivity probe used by the startup system check.
    pub async fn ping(&self) -> Result<()> {
        let payload = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 5,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .context("advisor ping failed")?;
        anyhow::ensure!(resp.status().is_success(), "advisor ping HTTP {}", resp.status());
        Ok(())
    }

    /// Request one decision. Retries transport failures twice.
    pub async fn analyze(&self, ctx: &AdvisorContext<'_>) -> Result<AdvisorDecision> {
        let system = persona_prompt(ctx.snapshot);
        let user = build_user_prompt(ctx);

        let strategy = FixedInterval::from_millis(500).take(RETRIES);
        let content = Retry::spawn(strategy, || self.complete(&system, &user)).await?;

        let decision = parse_decision(&content, ctx.default_amount)?;
        debug!(
            symbol = %ctx.snapshot.symbol,
            signal = %decision.signal,
            confidence = %decision.confidence,
            amount = decision.amount,
            "advisor decision parsed"
        );
        Ok(decision)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let payload = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "max_tokens": 300,
            "response_format": {"type": "json_object"},
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .context("advisor request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse advisor response body")?;

        if !status.is_success() {
            warn!(status = %status, "advisor returned non-success");
            anyhow::bail!("advisor HTTP {status}: {body}");
        }

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("advisor response missing message content")
    }
}

// -----------------------------------------------------------------------------
// Prompt assembly
// -----------------------------------------------------------------------------

/// Static persona text keyed by the market regime.
fn persona_prompt(snapshot: &MarketSnapshot) -> String {
    let mut p = String::from(
        "Identity: institutional-grade crypto sniper managing a high-risk book.\n\
         Core mandate: win rate above 60%. Missing a move is acceptable; losing is not.\n",
    );

    p.push_str(match snapshot.regime {
        crate::types::MarketRegime::HighTrend => {
            "[Mode: Trend Hunter] The market is in a strong directional move (ADX high). \
             Ride the trend decisively; do not call tops or bottoms.\n"
        }
        crate::types::MarketRegime::HighChoppy => {
            "[Mode: Risk Guardian] The market is violently choppy. Switch to mean-reversion \
             thinking; never chase. Only act at Bollinger extremes or deep overbought/oversold.\n"
        }
        crate::types::MarketRegime::Low => {
            "[Mode: Grid Trader] The market is flat. Buy the low edge of the range, sell the \
             high edge, and harvest small oscillations. Never chase momentum here.\n"
        }
        crate::types::MarketRegime::Normal => {
            "[Mode: Day Trader] Normal volatility, no confirmed trend. Balance risk and reward; \
             focus on candle structure and key levels, and refuse to chase.\n"
        }
    });

    p.push_str(
        "\nConfidence tiers:\n\
         - HIGH: perfect structure + key-level break/retest + volume confirmation.\n\
         - MEDIUM: trend aligned, indicators agree.\n\
         - LOW: unclear or choppy; only usable for closing positions.\n\
         \nRespond with exactly one JSON object, no markdown and no commentary:\n\
         {\n\
           \"signal\": \"BUY\" | \"SELL\" | \"HOLD\",\n\
           \"reason\": \"core logic, under 100 words\",\n\
           \"summary\": \"dashboard caption, under 15 words\",\n\
           \"stop_loss\": number (0 = unset),\n\
           \"take_profit\": number (0 = unset),\n\
           \"confidence\": \"HIGH\" | \"MEDIUM\" | \"LOW\",\n\
           \"amount\": number (base-currency size; to close WITHOUT flipping, set 0)\n\
         }\n",
    );
    p
}

fn build_user_prompt(ctx: &AdvisorContext<'_>) -> String {
    let snap = ctx.snapshot;
    let ind = &snap.indicators;

    let position_text = match ctx.position {
        Some(pos) => format!(
            "{} position, size {:.6}, unrealized pnl {:.2} USDT",
            pos.side, pos.coin_size, pos.unrealized_pnl
        ),
        None => "flat (no position)".to_string(),
    };

    // Signal meaning depends on the held side; spell it out.
    let signal_semantics = match ctx.position.map(|p| p.side) {
        Some(crate::types::Side::Long) => {
            "Held side is LONG: SELL = close long (amount=0) or flip short (amount>0); \
             BUY = pyramid the long.\n"
        }
        Some(crate::types::Side::Short) => {
            "Held side is SHORT: BUY = close short (amount=0) or flip long (amount>0); \
             SELL = pyramid the short.\n"
        }
        None => "",
    };

    let mut kline_text = format!(
        "Recent {} {} candles (newest first):\n",
        snap.candles.len(),
        snap.timeframe
    );
    for (i, k) in snap.candles.iter().rev().take(DETAILED_KLINES).enumerate() {
        let change = if k.open > 0.0 {
            (k.close - k.open) / k.open * 100.0
        } else {
            0.0
        };
        kline_text.push_str(&format!(
            "T-{i}: O:{:.4} H:{:.4} L:{:.4} C:{:.4} ({change:+.2}%) Vol:{:.0}\n",
            k.open, k.high, k.low, k.close, k.volume
        ));
    }
    if snap.candles.len() > DETAILED_KLINES {
        kline_text.push_str(&format!(
            "...({} older bars omitted; analyse the overall structure)...\n",
            snap.candles.len() - DETAILED_KLINES
        ));
    }

    let funding_note = if ctx.funding_rate.abs() > 0.0005 {
        if ctx.funding_rate > 0.0 {
            "Funding overheated (positive): avoid new longs, favour short setups.\n"
        } else {
            "Funding deeply negative: avoid new shorts, favour long setups.\n"
        }
    } else {
        ""
    };

    let btc_note = match ctx.btc_change_24h {
        Some(chg) if chg < -3.0 => format!(
            "BTC context: {chg:+.2}% in 24h — market-wide dump risk, do not catch knives.\n"
        ),
        Some(chg) if chg > 3.0 => {
            format!("BTC context: {chg:+.2}% in 24h — broad risk-on, favour longs.\n")
        }
        Some(chg) => format!("BTC context: {chg:+.2}% in 24h.\n"),
        None => String::new(),
    };

    let surge_note = if ctx.is_surge {
        "ALERT: surge conditions detected (volume/price spike or pattern) — this scan was \
         triggered outside the normal gate.\n"
    } else {
        ""
    };

    let pattern_note = match ctx.pattern {
        Some(p) => format!("Pattern recognizer fired: {p}.\n"),
        None => String::new(),
    };

    let target_note = if ctx.max_profit_usdt > 0.0 && ctx.account_pnl != 0.0 {
        let progress = ctx.account_pnl / ctx.max_profit_usdt;
        if progress >= 1.0 {
            "PRIORITY: session profit target reached — only SELL (close) or HOLD, no new risk.\n"
                .to_string()
        } else if progress > 0.7 {
            "Profit protection: >70% of the session target is in hand; prefer locking gains \
             over stretching for the tail.\n"
                .to_string()
        } else {
            format!(
                "Session pnl {:.2} USDT of {:.2} target.\n",
                ctx.account_pnl, ctx.max_profit_usdt
            )
        }
    } else {
        String::new()
    };

    let fee_pct = ctx.taker_fee_rate * 100.0;
    format!(
        "# Market\n\
         Symbol: {sym}\n\
         Timeframe: {tf}\n\
         Price: {price:.4} (kline close {close:.4}, divergence {div:+.3}%)\n\
         Bar change: {chg:+.2}%\n\
         \n# Account\n\
         Position: {position_text}\n\
         {signal_semantics}\
         Available balance: {bal:.2} USDT\n\
         Leverage: {lev}x\n\
         Round-trip cost: {fee:.3}% per side\n\
         {target_note}\
         Suggested default size: {amt:.6} (adjust to the tape)\n\
         Venue minimums: size > {min_amt} and notional > {min_cost} USDT (mandatory)\n\
         \n# Indicators\n\
         RSI(14): {rsi:.2}\n\
         MACD: {macd:.4} / signal {sig:.4}\n\
         Bollinger: {bu:.2} / {bm:.2} / {bl:.2}\n\
         ADX(14): {adx:.2} | ATR(14): {atr:.4} | ATR ratio: {atr_r:.2}\n\
         Volume ratio: {vr:.2} | OBV: {obv:.0} | buy-volume share: {bp:.0}%\n\
         \n{kline_text}\
         \n# Context\n\
         {funding_note}{btc_note}{surge_note}{pattern_note}",
        sym = snap.symbol,
        tf = snap.timeframe,
        price = snap.price,
        close = snap.kline_close,
        div = snap.price_divergence,
        chg = snap.price_change,
        bal = ctx.balance_usdt,
        lev = ctx.leverage,
        fee = fee_pct,
        amt = ctx.default_amount,
        min_amt = snap.min_amount,
        min_cost = snap.min_notional,
        rsi = ind.rsi,
        macd = ind.macd,
        sig = ind.macd_signal,
        bu = ind.bb_upper,
        bm = ind.bb_middle,
        bl = ind.bb_lower,
        adx = ind.adx,
        atr = ind.atr,
        atr_r = ind.atr_ratio,
        vr = ind.vol_ratio,
        obv = ind.obv,
        bp = ind.buy_prop * 100.0,
    )
}

// -----------------------------------------------------------------------------
// Decision parsing
// -----------------------------------------------------------------------------

/// Numeric fields may arrive as numbers, numeric strings, or null.
fn coerce_f64(val: &serde_json::Value) -> Option<f64> {
    if let Some(n) = val.as_f64() {
        return Some(n);
    }
    val.as_str().and_then(|s| s.trim().parse().ok())
}

/// Extract the first `{...}` block and map it onto a typed decision.
pub fn parse_decision(content: &str, default_amount: f64) -> Result<AdvisorDecision> {
    let start = content.find('{').context("no JSON object in advisor reply")?;
    let end = content.rfind('}').context("unterminated JSON in advisor reply")?;
    anyhow::ensure!(end > start, "malformed JSON block in advisor reply");

    let value: serde_json::Value = serde_json::from_str(&content[start..=end])
        .context("advisor reply is not valid JSON")?;

    let signal = match value["signal"].as_str().map(str::to_uppercase).as_deref() {
        Some("BUY") => Signal::Buy,
        Some("SELL") => Signal::Sell,
        Some("HOLD") => Signal::Hold,
        other => anyhow::bail!("unknown signal {:?}", other),
    };

    let confidence = value["confidence"]
        .as_str()
        .map(Confidence::from_str_loose)
        .unwrap_or(Confidence::Low);

    // An explicit zero means close-only; only a MISSING amount falls back to
    // the default.
    let amount = coerce_f64(&value["amount"]).unwrap_or(default_amount).max(0.0);

    Ok(AdvisorDecision {
        signal,
        confidence,
        amount,
        stop_loss: coerce_f64(&value["stop_loss"]).unwrap_or(0.0).max(0.0),
        take_profit: coerce_f64(&value["take_profit"]).unwrap_or(0.0).max(0.0),
        reason: value["reason"].as_str().unwrap_or("").to_string(),
        summary: value["summary"].as_str().unwrap_or("").to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::indicators::IndicatorFrame;
    use crate::types::{MarketRegime, Side};

    #[test]
    fn parses_clean_json() {
        let raw = r#"{"signal":"BUY","reason":"breakout","summary":"up",
                      "stop_loss":95.5,"take_profit":0,"confidence":"HIGH","amount":0.25}"#;
        let d = parse_decision(raw, 1.0).unwrap();
        assert_eq!(d.signal, Signal::Buy);
        assert_eq!(d.confidence, Confidence::High);
        assert!((d.amount - 0.25).abs() < 1e-12);
        assert!((d.stop_loss - 95.5).abs() < 1e-12);
    }

    #[test]
    fn extracts_json_from_noise() {
        let raw = "Sure, here is my answer:\n```json\n{\"signal\":\"sell\",\"confidence\":\"LOW\",\"amount\":\"0\"}\n```";
        let d = parse_decision(raw, 1.0).unwrap();
        assert_eq!(d.signal, Signal::Sell);
        // Explicit zero stays zero: close-only, no default fallback.
        assert_eq!(d.amount, 0.0);
        assert!(d.is_close_only());
    }

    #[test]
    fn missing_amount_falls_back_to_default() {
        let raw = r#"{"signal":"BUY","confidence":"MEDIUM"}"#;
        let d = parse_decision(raw, 0.7).unwrap();
        assert!((d.amount - 0.7).abs() < 1e-12);
    }

    #[test]
    fn string_numerics_are_coerced() {
        let raw = r#"{"signal":"SELL","confidence":"MED","amount":"1.5","stop_loss":"101.25"}"#;
        let d = parse_decision(raw, 0.0).unwrap();
        assert!((d.amount - 1.5).abs() < 1e-12);
        assert!((d.stop_loss - 101.25).abs() < 1e-12);
        assert_eq!(d.confidence, Confidence::Medium);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_decision("no json here", 1.0).is_err());
        assert!(parse_decision("{not json}", 1.0).is_err());
        assert!(parse_decision(r#"{"signal":"YOLO"}"#, 1.0).is_err());
    }

    fn snapshot(regime: MarketRegime) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "ETH/USDT:USDT".into(),
            timeframe: "15m".into(),
            regime,
            price: 2000.0,
            kline_close: 1998.0,
            price_divergence: 0.1,
            price_change: 0.5,
            candles: vec![],
            indicators: IndicatorFrame::default(),
            min_amount: 0.01,
            min_notional: 5.0,
        }
    }

    #[test]
    fn persona_tracks_regime() {
        assert!(persona_prompt(&snapshot(MarketRegime::HighTrend)).contains("Trend Hunter"));
        assert!(persona_prompt(&snapshot(MarketRegime::Low)).contains("Grid Trader"));
        assert!(persona_prompt(&snapshot(MarketRegime::HighChoppy)).contains("Risk Guardian"));
    }

    #[test]
    fn user_prompt_spells_out_held_side_semantics() {
        let snap = snapshot(MarketRegime::Normal);
        let pos = Position {
            symbol: snap.symbol.clone(),
            side: Side::Long,
            size: 1.0,
            coin_size: 1.0,
            entry_price: 1900.0,
            unrealized_pnl: 100.0,
            leverage: 5.0,
            mode: None,
        };
        let ctx = AdvisorContext {
            snapshot: &snap,
            position: Some(&pos),
            balance_usdt: 500.0,
            default_amount: 0.5,
            taker_fee_rate: 0.0005,
            leverage: 5,
            account_pnl: 0.0,
            max_profit_usdt: 0.0,
            funding_rate: 0.0,
            btc_change_24h: Some(-4.0),
            is_surge: true,
            pattern: Some(PatternKind::BullishStrike),
        };
        let prompt = build_user_prompt(&ctx);
        assert!(prompt.contains("Held side is LONG"));
        assert!(prompt.contains("surge conditions detected"));
        assert!(prompt.contains("BULLISH_STRIKE"));
        assert!(prompt.contains("do not catch knives"));
    }
}
