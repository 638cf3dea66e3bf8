use thiserror::Error;

/// Engine error taxonomy.
///
/// Local validation failures reject the operation with no side effect;
/// transient exchange conditions are not errors here - they are re-derived
/// by reconciliation (see the fill pipeline).
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or missing argument (empty market, bad side, bad prices).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A price or size literal carried more decimals than the amount type
    /// retains. Treated as a reject so the caller notices the loss.
    #[error("precision loss in {field}: {value:?} does not survive normalization")]
    PrecisionLoss { field: &'static str, value: String },

    /// Taker order priced more than 10% away from the public spread.
    #[error("taker {side} at {price} is more than 10% off the spread, add '-override' if intentional")]
    SpreadViolation { side: &'static str, price: String },

    /// Price falls outside the exchange-enforced price window.
    #[error("{market} price {price} outside exchange limit window")]
    ExchangeLimit { market: String, price: String },

    /// Snapshot file could not be written.
    #[error("snapshot write failed: {0}")]
    Snapshot(#[from] std::io::Error),
}

impl EngineError {
    /// Create an `InvalidInput` error from any message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}
