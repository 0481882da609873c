// =============================================================================
// Error taxonomy shared across the Oracle trading engine
// =============================================================================

use thiserror::Error;

/// Classified failure modes. Most call sites bubble `anyhow::Error` with
/// context attached; this taxonomy is used where the handling policy differs
/// by class (retry vs. skip vs. halt).
#[derive(Debug, Error)]
pub enum OracleError {
    /// Transport-level failure talking to the exchange (timeouts, DNS, TLS).
    #[error("exchange connection error: {0}")]
    ApiConnection(String),

    /// Exchange answered but with a non-success payload.
    #[error("exchange response error (code {code}): {message}")]
    ApiResponse { code: String, message: String },

    /// Order-side business failure (rejected order, bad size, mode mismatch).
    #[error("trading error: {0}")]
    Trading(String),

    /// Global or per-symbol risk machinery failed.
    #[error("risk management error: {0}")]
    RiskManagement(String),

    /// Candle/indicator pipeline produced unusable data.
    #[error("data processing error: {0}")]
    DataProcessing(String),

    /// Advisor call failed or returned an unparseable decision.
    #[error("advisor error: {0}")]
    Ai(String),

    /// Configuration missing or invalid.
    #[error("config error: {0}")]
    Config(String),
}

impl OracleError {
    /// OKX rejects orders with code 51008 when margin/balance is short.
    /// That class gets the reduce-and-retry-once treatment instead of the
    /// normal exponential backoff.
    pub fn is_insufficient_balance(&self) -> bool {
        match self {
            Self::ApiResponse { code, message } => {
                code == "51008" || message.contains("Insufficient")
            }
            Self::Trading(msg) => msg.contains("51008") || msg.contains("Insufficient"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_detected_by_code() {
        let e = OracleError::ApiResponse {
            code: "51008".into(),
            message: "Order failed".into(),
        };
        assert!(e.is_insufficient_balance());
    }

    #[test]
    fn insufficient_balance_detected_by_message() {
        let e = OracleError::Trading("Insufficient margin for order".into());
        assert!(e.is_insufficient_balance());
    }

    #[test]
    fn other_errors_are_not_insufficient_balance() {
        let e = OracleError::Ai("timeout".into());
        assert!(!e.is_insufficient_balance());
        let e = OracleError::ApiResponse {
            code: "50011".into(),
            message: "rate limited".into(),
        };
        assert!(!e.is_insufficient_balance());
    }
}
