//! Configuration management for the CLMSR engine
//! Supports environment variables and default values for market and pricing parameters.
//! WAD-valued settings are written as decimals (e.g. `CLMSR_MIN_ALPHA=0.001`).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

use crate::fixed_point::{wad_from_decimal, wad_to_decimal, WAD};
use crate::range_tree::{DEFAULT_REBUILD_THRESHOLD, MAX_TREE_BINS};

/// Configuration for the pricing engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub market: MarketConfig,
    pub pricing: PricingConfig,
}

/// Bounds applied when markets are created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Smallest liquidity parameter accepted (WAD, default 0.001)
    pub min_alpha: u128,

    /// Largest liquidity parameter accepted (WAD, default 1,000,000)
    pub max_alpha: u128,

    /// Maximum bins per market (default 1,000,000)
    pub max_bins: usize,

    /// Committed tree updates between full rebuilds (default 1000)
    pub rebuild_threshold: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            min_alpha: WAD / 1_000,
            max_alpha: 1_000_000 * WAD,
            max_bins: 1_000_000,
            rebuild_threshold: DEFAULT_REBUILD_THRESHOLD,
        }
    }
}

/// Trade splitting and seeding limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Maximum chunks a single trade may be split into (default 1000)
    pub max_chunks_per_trade: u32,

    /// Largest per-chunk `quantity / alpha` (WAD, default 1.0)
    pub max_chunk_exponent: u128,

    /// Seeding factor bounds (WAD, defaults 0.01 and 100)
    pub min_seed_factor: u128,
    pub max_seed_factor: u128,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_trade: 1_000,
            max_chunk_exponent: WAD,
            min_seed_factor: WAD / 100,
            max_seed_factor: 100 * WAD,
        }
    }
}

/// Chunk exponents above this would push single factors past e^10.
const MAX_CHUNK_EXPONENT_CAP: u128 = 10 * WAD;

fn env_wad(name: &str) -> Option<u128> {
    let raw = env::var(name).ok()?;
    match Decimal::from_str(raw.trim()).ok().and_then(|d| wad_from_decimal(d).ok()) {
        Some(value) => Some(value),
        None => {
            warn!(variable = name, value = %raw, "unparseable decimal, keeping default");
            None
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        warn!(variable = name, value = %raw, "unparseable value, keeping default");
    }
    parsed
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(value) = env_wad("CLMSR_MIN_ALPHA") {
            config.market.min_alpha = value;
        }
        if let Some(value) = env_wad("CLMSR_MAX_ALPHA") {
            config.market.max_alpha = value;
        }
        if let Some(value) = env_parse("CLMSR_MAX_BINS") {
            config.market.max_bins = value;
        }
        if let Some(value) = env_parse("CLMSR_REBUILD_THRESHOLD") {
            config.market.rebuild_threshold = value;
        }

        if let Some(value) = env_parse("CLMSR_MAX_CHUNKS_PER_TRADE") {
            config.pricing.max_chunks_per_trade = value;
        }
        if let Some(value) = env_wad("CLMSR_MAX_CHUNK_EXPONENT") {
            config.pricing.max_chunk_exponent = value;
        }
        if let Some(value) = env_wad("CLMSR_MIN_SEED_FACTOR") {
            config.pricing.min_seed_factor = value;
        }
        if let Some(value) = env_wad("CLMSR_MAX_SEED_FACTOR") {
            config.pricing.max_seed_factor = value;
        }

        config.validate();
        config
    }

    /// Replace out-of-range values with defaults
    pub fn validate(&mut self) {
        let market = MarketConfig::default();
        let pricing = PricingConfig::default();

        if self.market.min_alpha == 0 || self.market.min_alpha > self.market.max_alpha {
            warn!(
                min_alpha = %wad_to_decimal(self.market.min_alpha),
                max_alpha = %wad_to_decimal(self.market.max_alpha),
                "invalid alpha bounds, using defaults"
            );
            self.market.min_alpha = market.min_alpha;
            self.market.max_alpha = market.max_alpha;
        }

        if self.market.max_bins == 0 || self.market.max_bins > MAX_TREE_BINS {
            warn!(max_bins = self.market.max_bins, "invalid max_bins, using default");
            self.market.max_bins = market.max_bins;
        }

        if self.market.rebuild_threshold == 0 {
            warn!("rebuild_threshold must be positive, using default");
            self.market.rebuild_threshold = market.rebuild_threshold;
        }

        if self.pricing.max_chunks_per_trade == 0 {
            warn!("max_chunks_per_trade must be positive, using default");
            self.pricing.max_chunks_per_trade = pricing.max_chunks_per_trade;
        }

        if self.pricing.max_chunk_exponent == 0 || self.pricing.max_chunk_exponent > MAX_CHUNK_EXPONENT_CAP {
            warn!(
                max_chunk_exponent = %wad_to_decimal(self.pricing.max_chunk_exponent),
                "invalid max_chunk_exponent, using default"
            );
            self.pricing.max_chunk_exponent = pricing.max_chunk_exponent;
        }

        if self.pricing.min_seed_factor == 0 || self.pricing.min_seed_factor > self.pricing.max_seed_factor {
            warn!(
                min_seed_factor = %wad_to_decimal(self.pricing.min_seed_factor),
                max_seed_factor = %wad_to_decimal(self.pricing.max_seed_factor),
                "invalid seed factor bounds, using defaults"
            );
            self.pricing.min_seed_factor = pricing.min_seed_factor;
            self.pricing.max_seed_factor = pricing.max_seed_factor;
        }
    }

    /// Log the active configuration
    pub fn print_config(&self) {
        info!("CLMSR engine configuration:");
        info!("   Alpha bounds: [{}, {}]", wad_to_decimal(self.market.min_alpha), wad_to_decimal(self.market.max_alpha));
        info!("   Max bins: {}", self.market.max_bins);
        info!("   Rebuild threshold: {} updates", self.market.rebuild_threshold);
        info!("   Max chunks per trade: {}", self.pricing.max_chunks_per_trade);
        info!("   Max chunk exponent: {}", wad_to_decimal(self.pricing.max_chunk_exponent));
        info!(
            "   Seed factor bounds: [{}, {}]",
            wad_to_decimal(self.pricing.min_seed_factor),
            wad_to_decimal(self.pricing.max_seed_factor)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        let before = serde_json::to_string(&config).unwrap();
        config.validate();
        assert_eq!(serde_json::to_string(&config).unwrap(), before);
        assert_eq!(config.pricing.max_chunks_per_trade, 1_000);
        assert_eq!(config.pricing.max_chunk_exponent, WAD);
        assert_eq!(config.market.rebuild_threshold, 1_000);
    }

    #[test]
    fn validate_falls_back_to_defaults() {
        let mut config = Config::default();
        config.market.min_alpha = 10 * WAD;
        config.market.max_alpha = WAD;
        config.market.max_bins = 0;
        config.pricing.max_chunk_exponent = 50 * WAD;
        config.pricing.min_seed_factor = 0;
        config.validate();

        let defaults = Config::default();
        assert_eq!(config.market.min_alpha, defaults.market.min_alpha);
        assert_eq!(config.market.max_alpha, defaults.market.max_alpha);
        assert_eq!(config.market.max_bins, defaults.market.max_bins);
        assert_eq!(config.pricing.max_chunk_exponent, defaults.pricing.max_chunk_exponent);
        assert_eq!(config.pricing.min_seed_factor, defaults.pricing.min_seed_factor);
    }

    #[test]
    fn reads_decimal_overrides_from_env() {
        env::set_var("CLMSR_MAX_CHUNK_EXPONENT", "0.25");
        env::set_var("CLMSR_MAX_CHUNKS_PER_TRADE", "not-a-number");
        let config = Config::from_env();
        env::remove_var("CLMSR_MAX_CHUNK_EXPONENT");
        env::remove_var("CLMSR_MAX_CHUNKS_PER_TRADE");

        assert_eq!(config.pricing.max_chunk_exponent, WAD / 4);
        assert_eq!(config.pricing.max_chunks_per_trade, 1_000);
    }
}
