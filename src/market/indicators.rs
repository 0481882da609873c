// =============================================================================
// Indicator computation — Wilder smoothing throughout
// =============================================================================
//
// RSI and ADX/ATR use Wilder's exponential smoothing (alpha = 1/period,
// adjust=false semantics: y[0] = x[0], y[i] = a*x[i] + (1-a)*y[i-1]).
// MACD uses standard span EMAs (12/26/9). Bollinger is SMA20 +/- 2 sample
// standard deviations. Every division guards a zero denominator with NaN and
// the frame fills domain neutrals at the end (RSI -> 50, buy proportion ->
// 0.5).
// =============================================================================

use serde::{Deserialize, Serialize};

use super::candles::Candle;
use crate::types::MarketRegime;

const RSI_PERIOD: usize = 14;
const ADX_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;
const VOL_SMA_PERIOD: usize = 20;
const ATR_SMA_PERIOD: usize = 50;
const BUY_PROP_WINDOW: usize = 5;

/// Minimum history needed before a frame is produced.
pub const MIN_CANDLES: usize = 30;

/// Snapshot of the latest indicator values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorFrame {
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub adx: f64,
    pub atr: f64,
    /// ATR / SMA50(ATR); 1.0 when history is too short.
    pub atr_ratio: f64,
    /// Volume / SMA20(volume); 0.0 when undefined.
    pub vol_ratio: f64,
    pub obv: f64,
    /// 5-bar up-volume proportion in [0, 1]; 0.5 when volume is absent.
    pub buy_prop: f64,
}

// -----------------------------------------------------------------------------
// Smoothing primitives
// -----------------------------------------------------------------------------

/// Exponential moving average with `alpha`, adjust=false.
fn ewm(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev = f64::NAN;
    for &v in values {
        prev = if prev.is_nan() {
            v
        } else {
            alpha * v + (1.0 - alpha) * prev
        };
        out.push(prev);
    }
    out
}

fn ema(values: &[f64], span: f64) -> Vec<f64> {
    ewm(values, 2.0 / (span + 1.0))
}

fn wilder(values: &[f64], period: usize) -> Vec<f64> {
    ewm(values, 1.0 / period as f64)
}

/// Simple moving average; NaN until the window is full.
fn sma(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }
    let mut sum: f64 = values[..window].iter().sum();
    out[window - 1] = sum / window as f64;
    for i in window..values.len() {
        sum += values[i] - values[i - window];
        out[i] = sum / window as f64;
    }
    out
}

/// Rolling sample standard deviation (ddof = 1); NaN until the window fills.
fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window < 2 || values.len() < window {
        return out;
    }
    for i in (window - 1)..values.len() {
        let slice = &values[i + 1 - window..=i];
        let mean = slice.iter().sum::<f64>() / window as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (window - 1) as f64;
        out[i] = var.sqrt();
    }
    out
}

// -----------------------------------------------------------------------------
// Indicator series
// -----------------------------------------------------------------------------

/// Wilder RSI series. NaN where undefined (zero losses and gains handled by
/// the caller's neutral fill).
pub fn rsi_series(closes: &[f64]) -> Vec<f64> {
    if closes.len() < 2 {
        return vec![f64::NAN; closes.len()];
    }

    let mut gains = vec![0.0; closes.len()];
    let mut losses = vec![0.0; closes.len()];
    for i in 1..closes.len() {
        let d = closes[i] - closes[i - 1];
        if d > 0.0 {
            gains[i] = d;
        } else {
            losses[i] = -d;
        }
    }

    let avg_gain = wilder(&gains, RSI_PERIOD);
    let avg_loss = wilder(&losses, RSI_PERIOD);

    avg_gain
        .iter()
        .zip(avg_loss.iter())
        .map(|(&g, &l)| {
            if l <= 0.0 {
                f64::NAN // all-gain (or flat) — caller fills
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect()
}

/// MACD(12, 26, 9): returns (macd, signal, histogram) series.
pub fn macd_series(closes: &[f64]) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast = ema(closes, 12.0);
    let slow = ema(closes, 26.0);
    let macd: Vec<f64> = fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect();
    let signal = ema(&macd, 9.0);
    let hist: Vec<f64> = macd.iter().zip(signal.iter()).map(|(m, s)| m - s).collect();
    (macd, signal, hist)
}

/// ADX and ATR series (both Wilder-smoothed over 14).
pub fn adx_atr_series(candles: &[Candle]) -> (Vec<f64>, Vec<f64>) {
    let n = candles.len();
    if n == 0 {
        return (Vec::new(), Vec::new());
    }

    let mut tr = vec![0.0; n];
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];

    tr[0] = candles[0].high - candles[0].low;
    for i in 1..n {
        let c = &candles[i];
        let prev = &candles[i - 1];
        tr[i] = (c.high - c.low)
            .max((c.high - prev.close).abs())
            .max((c.low - prev.close).abs());

        let up_move = c.high - prev.high;
        let down_move = prev.low - c.low;
        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let atr = wilder(&tr, ADX_PERIOD);
    let plus_sm = wilder(&plus_dm, ADX_PERIOD);
    let minus_sm = wilder(&minus_dm, ADX_PERIOD);

    let mut dx = vec![0.0; n];
    for i in 0..n {
        if atr[i] <= 0.0 {
            dx[i] = 0.0;
            continue;
        }
        let plus_di = 100.0 * plus_sm[i] / atr[i];
        let minus_di = 100.0 * minus_sm[i] / atr[i];
        let sum = plus_di + minus_di;
        dx[i] = if sum > 0.0 {
            100.0 * (plus_di - minus_di).abs() / sum
        } else {
            0.0
        };
    }
    let adx = wilder(&dx, ADX_PERIOD);

    (adx, atr)
}

/// On-balance volume: cumulative signed volume.
pub fn obv_series(candles: &[Candle]) -> Vec<f64> {
    let mut out = Vec::with_capacity(candles.len());
    let mut acc = 0.0;
    for i in 0..candles.len() {
        if i > 0 {
            if candles[i].close > candles[i - 1].close {
                acc += candles[i].volume;
            } else if candles[i].close < candles[i - 1].close {
                acc -= candles[i].volume;
            }
        }
        out.push(acc);
    }
    out
}

// -----------------------------------------------------------------------------
// Frame assembly + regime
// -----------------------------------------------------------------------------

/// Compute the latest indicator frame. Returns `None` below [`MIN_CANDLES`].
pub fn compute_frame(candles: &[Candle]) -> Option<IndicatorFrame> {
    if candles.len() < MIN_CANDLES {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let last = candles.len() - 1;

    let rsi = rsi_series(&closes);
    let (macd, signal, hist) = macd_series(&closes);
    let bb_mid = sma(&closes, BB_PERIOD);
    let bb_std = rolling_std(&closes, BB_PERIOD);
    let (adx, atr) = adx_atr_series(candles);
    let atr_ma = sma(&atr, ATR_SMA_PERIOD);
    let vol_ma = sma(&volumes, VOL_SMA_PERIOD);
    let obv = obv_series(candles);

    // 5-bar up-volume proportion.
    let buy_prop = {
        let start = candles.len().saturating_sub(BUY_PROP_WINDOW);
        let window = &candles[start..];
        let total: f64 = window.iter().map(|c| c.volume).sum();
        if total > 0.0 {
            window
                .iter()
                .filter(|c| c.close >= c.open)
                .map(|c| c.volume)
                .sum::<f64>()
                / total
        } else {
            0.5
        }
    };

    let nan_to = |v: f64, neutral: f64| if v.is_finite() { v } else { neutral };

    let atr_ratio = {
        let ma = atr_ma[last];
        if ma.is_finite() && ma > 0.0 {
            atr[last] / ma
        } else {
            1.0
        }
    };

    let vol_ratio = {
        let ma = vol_ma[last];
        if ma.is_finite() && ma > 0.0 {
            volumes[last] / ma
        } else {
            0.0
        }
    };

    Some(IndicatorFrame {
        rsi: nan_to(rsi[last], if closes[last] > closes[0] { 100.0 } else { 50.0 }),
        macd: nan_to(macd[last], 0.0),
        macd_signal: nan_to(signal[last], 0.0),
        macd_hist: nan_to(hist[last], 0.0),
        bb_upper: nan_to(bb_mid[last] + 2.0 * bb_std[last], closes[last]),
        bb_middle: nan_to(bb_mid[last], closes[last]),
        bb_lower: nan_to(bb_mid[last] - 2.0 * bb_std[last], closes[last]),
        adx: nan_to(adx[last], 0.0),
        atr: nan_to(atr[last], 0.0),
        atr_ratio,
        vol_ratio,
        obv: nan_to(obv[last], 0.0),
        buy_prop,
    })
}

/// Regime thresholds: dead-quiet markets first, then strong trend, then
/// violent chop.
pub fn classify_regime(frame: &IndicatorFrame) -> MarketRegime {
    if frame.atr_ratio < 0.6 {
        MarketRegime::Low
    } else if frame.adx > 30.0 {
        MarketRegime::HighTrend
    } else if frame.atr_ratio > 1.5 {
        MarketRegime::HighChoppy
    } else {
        MarketRegime::Normal
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn mk(close: f64, volume: f64) -> Candle {
        Candle {
            timestamp_ms: 0,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume,
        }
    }

    fn trending_up(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let ts = i as i64 * 60_000;
                let base = 100.0 + i as f64;
                Candle {
                    timestamp_ms: ts,
                    open: base - 0.5,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base,
                    volume: 10.0,
                }
            })
            .collect()
    }

    // ---- RSI --------------------------------------------------------------

    #[test]
    fn rsi_all_gains_is_nan_then_filled_to_100() {
        let closes: Vec<f64> = (1..=40).map(|x| x as f64).collect();
        let series = rsi_series(&closes);
        // Pure gains => zero losses => NaN sentinel in the raw series.
        assert!(series.last().unwrap().is_nan());

        let candles = trending_up(40);
        let frame = compute_frame(&candles).unwrap();
        assert!((frame.rsi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_mixed_series_in_range() {
        let closes: Vec<f64> = (0..60)
            .map(|i| 100.0 + ((i * 7) % 13) as f64 - 6.0)
            .collect();
        for v in rsi_series(&closes).iter().filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(v), "RSI {v} out of range");
        }
    }

    #[test]
    fn rsi_falling_series_is_low() {
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        let series = rsi_series(&closes);
        let last = series.last().unwrap();
        assert!(last.is_finite());
        assert!(*last < 5.0, "pure downtrend RSI should be ~0, got {last}");
    }

    // ---- MACD -------------------------------------------------------------

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let (macd, signal, hist) = macd_series(&closes);
        assert!(*macd.last().unwrap() > 0.0);
        assert!(*signal.last().unwrap() > 0.0);
        assert_eq!(macd.len(), hist.len());
    }

    // ---- Bollinger via frame ---------------------------------------------

    #[test]
    fn bollinger_bands_bracket_the_mid() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| mk(100.0 + ((i % 5) as f64), 10.0))
            .collect();
        let frame = compute_frame(&candles).unwrap();
        assert!(frame.bb_upper > frame.bb_middle);
        assert!(frame.bb_lower < frame.bb_middle);
    }

    // ---- ADX / ATR --------------------------------------------------------

    #[test]
    fn adx_high_in_clean_trend() {
        let candles = trending_up(80);
        let (adx, atr) = adx_atr_series(&candles);
        assert!(*adx.last().unwrap() > 25.0, "steady trend should have ADX > 25");
        assert!(*atr.last().unwrap() > 0.0);
    }

    #[test]
    fn adx_low_in_flat_market() {
        let candles: Vec<Candle> = (0..80).map(|_| mk(100.0, 10.0)).collect();
        let (adx, _) = adx_atr_series(&candles);
        assert!(*adx.last().unwrap() < 5.0);
    }

    // ---- OBV --------------------------------------------------------------

    #[test]
    fn obv_accumulates_signed_volume() {
        let candles = vec![mk(100.0, 10.0), mk(101.0, 5.0), mk(100.5, 3.0), mk(100.5, 7.0)];
        let obv = obv_series(&candles);
        assert_eq!(obv, vec![0.0, 5.0, 2.0, 2.0]);
    }

    // ---- frame + regime ---------------------------------------------------

    #[test]
    fn frame_requires_minimum_history() {
        let candles = trending_up(MIN_CANDLES - 1);
        assert!(compute_frame(&candles).is_none());
        let candles = trending_up(MIN_CANDLES);
        assert!(compute_frame(&candles).is_some());
    }

    #[test]
    fn frame_neutral_fills_on_flat_volume() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let mut c = mk(100.0, 0.0);
                c.timestamp_ms = i * 60_000;
                c
            })
            .collect();
        let frame = compute_frame(&candles).unwrap();
        assert!((frame.buy_prop - 0.5).abs() < 1e-12);
        assert_eq!(frame.vol_ratio, 0.0);
        assert!((frame.rsi - 50.0).abs() < 1e-9);
    }

    #[test]
    fn regime_thresholds() {
        let mut f = IndicatorFrame {
            adx: 35.0,
            atr_ratio: 1.0,
            ..Default::default()
        };
        assert_eq!(classify_regime(&f), MarketRegime::HighTrend);

        f.adx = 20.0;
        f.atr_ratio = 1.6;
        assert_eq!(classify_regime(&f), MarketRegime::HighChoppy);

        f.atr_ratio = 0.5;
        assert_eq!(classify_regime(&f), MarketRegime::Low);

        // Dead market wins even with a trending ADX reading.
        f.adx = 40.0;
        assert_eq!(classify_regime(&f), MarketRegime::Low);

        f.adx = 25.0;
        f.atr_ratio = 1.0;
        assert_eq!(classify_regime(&f), MarketRegime::Normal);
    }

    #[test]
    fn sma_and_std_window_behaviour() {
        let vals = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let m = sma(&vals, 3);
        assert!(m[0].is_nan() && m[1].is_nan());
        assert!((m[2] - 2.0).abs() < 1e-12);
        assert!((m[4] - 4.0).abs() < 1e-12);

        let s = rolling_std(&vals, 3);
        assert!(s[1].is_nan());
        assert!((s[2] - 1.0).abs() < 1e-12); // sample std of 1,2,3
    }
}
