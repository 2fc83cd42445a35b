//! CLMSR Pricing Engine Library
//!
//! Continuous LMSR market maker over contiguous price ranges: a lazy
//! multiplicative range tree holds the bin weights and the pricing engine
//! turns range trades into cost, proceeds and tree updates.

pub mod config;
pub mod error;
pub mod external;
pub mod fixed_point;
pub mod market;
pub mod pricing;
pub mod range_tree;
pub mod stress;

pub use config::Config;
pub use error::{ClmsrError, Result};
pub use market::{MarketId, MarketRegistry, MarketStatus, TradeSide};
pub use pricing::{PricingEngine, TradeIntent, TradeReceipt};
