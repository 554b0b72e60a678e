use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by the selection engine and the risk monitor.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Price data missing or unusable for a symbol; the affected pair is skipped.
    #[error("price data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },
    /// Rolling windows cannot be satisfied; the pair is not evaluable.
    #[error("insufficient history: need {required} valid rows, have {available}")]
    InsufficientHistory { required: usize, available: usize },
    /// No candidate pair passed the stationarity screen.
    #[error("no suitable pairs found among {evaluated} evaluated candidates")]
    NoSuitablePairs { evaluated: usize },
    /// Invalid thresholds, windows or symbol lists.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Brokerage gateway call failed.
    #[error("gateway error: {0}")]
    Gateway(String),
}

impl EngineError {
    pub fn data_unavailable(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Errors that only disqualify a single pair rather than the whole run.
    pub fn is_pair_local(&self) -> bool {
        matches!(
            self,
            EngineError::DataUnavailable { .. } | EngineError::InsufficientHistory { .. }
        )
    }
}
