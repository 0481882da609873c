// =============================================================================
// Three-line strike recognizer
// =============================================================================
//
// Four-bar reversal: three staircase candles one way, then a fourth that
// engulfs all of them on higher volume than any of the three. The volume
// condition is strict (greater than the MAX of the prior three) — that is
// what separates a genuine sweep from a weak bounce.
//
// The 5x reward target is intentionally generous; the trailing-stop layer is
// expected to realize profit long before price reaches it.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market::candles::Candle;

/// ADX below which the pattern is not evaluated at all (no trend, no strike).
const MIN_ADX: f64 = 20.0;
/// Reward multiple applied to the stop distance for the hard target.
const REWARD_MULTIPLE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternKind {
    BullishStrike,
    BearishStrike,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BullishStrike => write!(f, "BULLISH_STRIKE"),
            Self::BearishStrike => write!(f, "BEARISH_STRIKE"),
        }
    }
}

/// Hard stop and dream target derived from the pattern geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Scan the last four candles for a three-line strike. `adx` gates the scan;
/// pass `None` to skip the gate (the 1-minute fast-exit scan does).
pub fn detect_three_line_strike(
    candles: &[Candle],
    adx: Option<f64>,
) -> Option<(PatternKind, PatternLevels)> {
    if let Some(adx) = adx {
        if adx < MIN_ADX {
            return None;
        }
    }
    if candles.len() < 4 {
        return None;
    }

    let [k1, k2, k3, k4] = <[Candle; 4]>::try_from(&candles[candles.len() - 4..]).ok()?;

    let max_vol3 = k1.volume.max(k2.volume).max(k3.volume);

    // Bullish: three bears stepping down, then a bull engulfing all three.
    if k1.is_bear() && k2.is_bear() && k3.is_bear() && k4.is_bull() {
        let stepping_down = k2.low < k1.low && k3.low < k2.low;
        let engulfs = k4.close > k1.open;
        if stepping_down && engulfs && k4.volume > max_vol3 {
            let stop_loss = k1.low.min(k2.low).min(k3.low).min(k4.low);
            let entry = k4.close;
            return Some((
                PatternKind::BullishStrike,
                PatternLevels {
                    stop_loss,
                    take_profit: entry + (entry - stop_loss) * REWARD_MULTIPLE,
                },
            ));
        }
    }

    // Bearish: mirror image on the top side.
    if k1.is_bull() && k2.is_bull() && k3.is_bull() && k4.is_bear() {
        let stepping_up = k2.high > k1.high && k3.high > k2.high;
        let engulfs = k4.close < k1.open;
        if stepping_up && engulfs && k4.volume > max_vol3 {
            let stop_loss = k1.high.max(k2.high).max(k3.high).max(k4.high);
            let entry = k4.close;
            return Some((
                PatternKind::BearishStrike,
                PatternLevels {
                    stop_loss,
                    take_profit: entry - (stop_loss - entry) * REWARD_MULTIPLE,
                },
            ));
        }
    }

    None
}
