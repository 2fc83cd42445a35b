//! Error taxonomy for the CLMSR engine

use thiserror::Error;

use crate::market::MarketId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClmsrError {
    #[error("invalid tick range [{lower}, {upper}): {reason}")]
    InvalidRange {
        lower: i64,
        upper: i64,
        reason: &'static str,
    },
    #[error("bin range [{lo}, {hi}] outside [0, {bins})")]
    IndexOutOfBounds { lo: usize, hi: usize, bins: usize },
    #[error("quantity must be positive")]
    InvalidQuantity,
    #[error("alpha {alpha} outside valid range [{min}, {max}]")]
    InvalidLiquidity { alpha: u128, min: u128, max: u128 },
    #[error("invalid bin count {bins} (max {max})")]
    InvalidBinCount { bins: usize, max: usize },
    #[error("bin {index} has zero weight")]
    InvalidWeight { index: usize },
    #[error("factor {factor} outside valid range [{min}, {max}]")]
    InvalidFactor { factor: u128, min: u128, max: u128 },
    #[error("trade needs {required} chunks, limit is {limit}")]
    ChunkLimitExceeded { required: u128, limit: u32 },
    #[error("fixed-point overflow")]
    MathOverflow,
    #[error("fixed-point underflow")]
    MathUnderflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("cost {cost} exceeds maximum {max}")]
    CostExceedsMaximum { cost: u128, max: u128 },
    #[error("proceeds {proceeds} below minimum {min}")]
    ProceedsBelowMinimum { proceeds: u128, min: u128 },
    #[error("market {0} not found")]
    MarketNotFound(MarketId),
    #[error("market {0} is not active")]
    MarketNotActive(MarketId),
    #[error("market {0} has not started")]
    MarketNotStarted(MarketId),
    #[error("market {0} has expired")]
    MarketExpired(MarketId),
    #[error("market {0} has not ended")]
    MarketNotEnded(MarketId),
    #[error("market {0} is already settled")]
    MarketAlreadySettled(MarketId),
    #[error("market {0} is not settled")]
    MarketNotSettled(MarketId),
    #[error("settlement tick {tick} outside [{min_tick}, {max_tick})")]
    InvalidSettlementTick {
        tick: i64,
        min_tick: i64,
        max_tick: i64,
    },
    #[error("market start must precede end")]
    InvalidTimeWindow,
    #[error("invalid tick geometry: {0}")]
    InvalidGeometry(&'static str),
    #[error("batch has {ranges} ranges but {factors} factors")]
    BatchLengthMismatch { ranges: usize, factors: usize },
    #[error("batch is empty")]
    EmptyBatch,
    #[error("integrity tag mismatch: expected {expected}, got {provided}")]
    IntegrityTagMismatch { expected: String, provided: String },
    #[error("payment failed: {0}")]
    PaymentFailed(String),
}

pub type Result<T, E = ClmsrError> = std::result::Result<T, E>;
