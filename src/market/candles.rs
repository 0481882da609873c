// =============================================================================
// Candle store operations — merge, time alignment, outlier cleaning
// =============================================================================
//
// The pipeline combines locally persisted candles with a fresh API fetch.
// Merge rules:
//   - Deduplicate by timestamp, API rows win (the stored tail may be a
//     snapshot of an unfinished candle).
//   - Timestamps are floored to 1-second granularity first so sub-second
//     duplicates collapse.
//   - The series is then resampled onto the timeframe grid; inserted gap rows
//     forward-fill the close and become zero-volume dojis.
// Cleaning replaces closes more than 3 rolling standard deviations from the
// 20-bar rolling mean, clamping high/low to still contain the new close.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Rolling window used for the outlier z-score.
const CLEAN_WINDOW: usize = 20;
/// Z-score beyond which a close is treated as a bad print.
const CLEAN_Z_THRESHOLD: f64 = 3.0;

/// One OHLCV bar. Timestamps are UTC epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bull(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bear(&self) -> bool {
        self.close < self.open
    }
}

/// Parse a timeframe string (`1m`, `5m`, `1h`, `4h`, `1d`) into seconds.
/// Unknown suffixes fall back to 60 s.
pub fn timeframe_secs(timeframe: &str) -> i64 {
    let tf = timeframe.trim();
    let (num, unit) = tf.split_at(tf.len().saturating_sub(1));
    let n: i64 = num.parse().unwrap_or(1);
    match unit {
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        "w" => n * 604_800,
        _ => 60,
    }
}

/// Number of recent candles fed to the advisor for a given timeframe.
pub fn feed_limit(timeframe: &str) -> usize {
    let limit = match timeframe {
        "1m" => 60,
        "3m" => 40,
        "5m" => 36,
        "15m" => 32,
        "30m" => 24,
        "1h" => 24,
        "4h" => 24,
        "1d" => 14,
        _ => 24,
    };
    limit.max(10)
}

/// Merge stored and freshly fetched candles. Later slices win on timestamp
/// collision, so pass the API batch last. Result is ascending and
/// deduplicated; replaying the same inputs yields identical output.
pub fn merge(stored: &[Candle], fresh: &[Candle]) -> Vec<Candle> {
    let mut combined: Vec<Candle> = Vec::with_capacity(stored.len() + fresh.len());
    combined.extend_from_slice(stored);
    combined.extend_from_slice(fresh);

    // Floor to 1 s so millisecond jitter collapses to one row.
    for c in &mut combined {
        c.timestamp_ms -= c.timestamp_ms.rem_euclid(1000);
    }

    // Stable sort keeps insertion order among equal keys; walking backwards
    // then keeps the freshest record per timestamp.
    combined.sort_by_key(|c| c.timestamp_ms);

    let mut out: Vec<Candle> = Vec::with_capacity(combined.len());
    for c in combined {
        match out.last_mut() {
            Some(last) if last.timestamp_ms == c.timestamp_ms => *last = c,
            _ => out.push(c),
        }
    }
    out
}

/// Resample onto the timeframe grid. Rows collapse onto their grid slot
/// (keep-last) and missing slots become forward-filled dojis with zero
/// volume.
pub fn normalize(candles: &[Candle], timeframe: &str) -> Vec<Candle> {
    let step_ms = timeframe_secs(timeframe) * 1000;
    if candles.is_empty() || step_ms <= 0 {
        return candles.to_vec();
    }

    let mut gridded: Vec<Candle> = Vec::with_capacity(candles.len());
    for c in candles {
        let mut c = *c;
        c.timestamp_ms -= c.timestamp_ms.rem_euclid(step_ms);
        match gridded.last_mut() {
            Some(last) if last.timestamp_ms == c.timestamp_ms => *last = c,
            Some(last) if last.timestamp_ms > c.timestamp_ms => {} // out-of-order stray
            _ => gridded.push(c),
        }
    }

    let mut out: Vec<Candle> = Vec::with_capacity(gridded.len());
    for c in gridded {
        if let Some(prev) = out.last().copied() {
            let mut ts = prev.timestamp_ms + step_ms;
            while ts < c.timestamp_ms {
                // Gap row: carry the close forward as a flat doji.
                out.push(Candle {
                    timestamp_ms: ts,
                    open: prev.close,
                    high: prev.close,
                    low: prev.close,
                    close: prev.close,
                    volume: 0.0,
                });
                ts += step_ms;
            }
        }
        out.push(c);
    }
    out
}

/// Replace z-score outlier closes with the rolling mean and clamp the bar's
/// high/low so they still contain the corrected close.
pub fn clean(candles: &mut [Candle]) -> usize {
    if candles.len() < CLEAN_WINDOW {
        return 0;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mut replaced = 0;

    for i in (CLEAN_WINDOW - 1)..candles.len() {
        let window = &closes[i + 1 - CLEAN_WINDOW..=i];
        let mean = window.iter().sum::<f64>() / CLEAN_WINDOW as f64;
        // Sample variance (ddof = 1), matching the Bollinger rolling std.
        let var =
            window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (CLEAN_WINDOW - 1) as f64;
        let std = var.sqrt();
        if std <= f64::EPSILON {
            continue;
        }

        let z = (closes[i] - mean).abs() / std;
        if z > CLEAN_Z_THRESHOLD {
            let c = &mut candles[i];
            c.close = mean;
            c.high = c.high.max(c.close);
            c.low = c.low.min(c.close);
            replaced += 1;
        }
    }
    replaced
}
