// =============================================================================
// Technical soft filter — deny extremes, downgrade weak tape
// =============================================================================
//
// The filter never vetoes on weakness alone: a thin tape only appends a
// downgrade note that caps the decision's effective confidence at LOW.
// The one hard rule is never chasing an RSI extreme in its own direction.
// =============================================================================

use crate::market::indicators::IndicatorFrame;
use crate::types::Signal;

/// RSI above which a BUY is chasing.
const RSI_OVERBOUGHT: f64 = 75.0;
/// RSI below which a SELL is chasing.
const RSI_OVERSOLD: f64 = 25.0;
/// ATR ratio under which volatility is too thin to trust the signal.
const LOW_VOLATILITY_ATR_RATIO: f64 = 1.0;
/// Volume ratio under which the move is unsupported.
const LOW_VOLUME_RATIO: f64 = 0.8;
/// ADX under which there is no trend to follow.
const WEAK_TREND_ADX: f64 = 20.0;

/// Outcome of the soft filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterVerdict {
    /// False only for the hard RSI-extreme rule.
    pub allow: bool,
    /// True when any downgrade note fired; caller caps confidence at LOW.
    pub downgrade: bool,
    /// Human-readable notes appended to the decision reason.
    pub notes: Vec<String>,
}

impl FilterVerdict {
    pub fn note_line(&self) -> String {
        self.notes.join(" | ")
    }
}

/// Evaluate a proposed direction against the current indicator frame.
pub fn check_technical_filters(signal: Signal, frame: &IndicatorFrame) -> FilterVerdict {
    let mut verdict = FilterVerdict {
        allow: true,
        downgrade: false,
        notes: Vec::new(),
    };

    // Hard rule: never chase an extreme.
    if signal == Signal::Buy && frame.rsi > RSI_OVERBOUGHT {
        verdict.allow = false;
        verdict
            .notes
            .push(format!("RSI overbought ({:.0}), refusing to chase longs", frame.rsi));
    } else if signal == Signal::Sell && frame.rsi < RSI_OVERSOLD {
        verdict.allow = false;
        verdict
            .notes
            .push(format!("RSI oversold ({:.0}), refusing to chase shorts", frame.rsi));
    }

    // Soft rules: downgrade, never deny.
    if frame.atr_ratio < LOW_VOLATILITY_ATR_RATIO {
        verdict.downgrade = true;
        verdict.notes.push(format!(
            "low volatility (ATR ratio {:.1}) -> confidence downgraded",
            frame.atr_ratio
        ));
    }
    if frame.vol_ratio < LOW_VOLUME_RATIO {
        verdict.downgrade = true;
        verdict.notes.push(format!(
            "thin volume (ratio {:.1}) -> confidence downgraded",
            frame.vol_ratio
        ));
    }
    if frame.adx < WEAK_TREND_ADX {
        verdict.downgrade = true;
        verdict.notes.push(format!(
            "weak trend (ADX {:.0}) -> confidence downgraded",
            frame.adx
        ));
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strong_frame() -> IndicatorFrame {
        IndicatorFrame {
            rsi: 55.0,
            adx: 28.0,
            atr_ratio: 1.2,
            vol_ratio: 1.5,
            ..Default::default()
        }
    }

    #[test]
    fn clean_frame_passes_untouched() {
        let v = check_technical_filters(Signal::Buy, &strong_frame());
        assert!(v.allow);
        assert!(!v.downgrade);
        assert!(v.notes.is_empty());
    }

    #[test]
    fn overbought_buy_denied() {
        let mut f = strong_frame();
        f.rsi = 80.0;
        let v = check_technical_filters(Signal::Buy, &f);
        assert!(!v.allow);
        // Selling into the same extreme is fine.
        let v = check_technical_filters(Signal::Sell, &f);
        assert!(v.allow);
    }

    #[test]
    fn oversold_sell_denied() {
        let mut f = strong_frame();
        f.rsi = 20.0;
        let v = check_technical_filters(Signal::Sell, &f);
        assert!(!v.allow);
        let v = check_technical_filters(Signal::Buy, &f);
        assert!(v.allow);
    }

    #[test]
    fn weak_tape_downgrades_but_allows() {
        let f = IndicatorFrame {
            rsi: 50.0,
            adx: 15.0,
            atr_ratio: 0.7,
            vol_ratio: 0.5,
            ..Default::default()
        };
        let v = check_technical_filters(Signal::Buy, &f);
        assert!(v.allow);
        assert!(v.downgrade);
        assert_eq!(v.notes.len(), 3);
        assert!(v.note_line().contains("ADX"));
    }
}
