//! src/market.rs
//! Market geometry, lifecycle and the caller-owned market registry.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::MarketConfig;
use crate::error::{ClmsrError, Result};
use crate::fixed_point::{wad_to_decimal, WAD};
use crate::range_tree::RangeMultiplyTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarketId(pub u64);

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Pending,
    Active,
    Ended,
    Settled,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Pending => "pending",
            MarketStatus::Active => "active",
            MarketStatus::Ended => "ended",
            MarketStatus::Settled => "settled",
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// Parameters for a new market. Ticks are half-open: bin `i` covers
/// `[min_tick + i * tick_spacing, min_tick + (i + 1) * tick_spacing)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketParams {
    pub min_tick: i64,
    pub max_tick: i64,
    pub tick_spacing: i64,
    /// Liquidity parameter (WAD).
    pub alpha: u128,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Audit entry for one applied seeding batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedRecord {
    pub tag: String,
    pub ranges: usize,
    pub updates: u32,
}

#[derive(Debug, Clone)]
pub struct Market {
    id: MarketId,
    min_tick: i64,
    max_tick: i64,
    tick_spacing: i64,
    alpha: u128,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    is_active: bool,
    settlement_tick: Option<i64>,
    seed_log: Vec<SeedRecord>,
    pub(crate) tree: RangeMultiplyTree,
}

impl Market {
    /// Validate geometry, liquidity and window, then start from a uniform
    /// distribution (every bin weighs 1.0).
    pub fn new(id: MarketId, params: &MarketParams, config: &MarketConfig) -> Result<Self> {
        if params.min_tick >= params.max_tick {
            return Err(ClmsrError::InvalidGeometry("min_tick must be below max_tick"));
        }
        if params.tick_spacing <= 0 {
            return Err(ClmsrError::InvalidGeometry("tick_spacing must be positive"));
        }
        let span = i128::from(params.max_tick) - i128::from(params.min_tick);
        if span % i128::from(params.tick_spacing) != 0 {
            return Err(ClmsrError::InvalidGeometry(
                "tick span must be a multiple of tick_spacing",
            ));
        }
        let bins = usize::try_from(span / i128::from(params.tick_spacing)).unwrap_or(usize::MAX);
        if bins > config.max_bins {
            return Err(ClmsrError::InvalidBinCount {
                bins,
                max: config.max_bins,
            });
        }
        if params.alpha < config.min_alpha || params.alpha > config.max_alpha {
            return Err(ClmsrError::InvalidLiquidity {
                alpha: params.alpha,
                min: config.min_alpha,
                max: config.max_alpha,
            });
        }
        if params.start >= params.end {
            return Err(ClmsrError::InvalidTimeWindow);
        }

        let tree = RangeMultiplyTree::uniform(bins, WAD)?
            .with_rebuild_threshold(config.rebuild_threshold);

        Ok(Self {
            id,
            min_tick: params.min_tick,
            max_tick: params.max_tick,
            tick_spacing: params.tick_spacing,
            alpha: params.alpha,
            start: params.start,
            end: params.end,
            is_active: true,
            settlement_tick: None,
            seed_log: Vec::new(),
            tree,
        })
    }

    pub fn id(&self) -> MarketId {
        self.id
    }

    pub fn alpha(&self) -> u128 {
        self.alpha
    }

    pub fn bins(&self) -> usize {
        self.tree.bins()
    }

    pub fn min_tick(&self) -> i64 {
        self.min_tick
    }

    pub fn max_tick(&self) -> i64 {
        self.max_tick
    }

    pub fn tick_spacing(&self) -> i64 {
        self.tick_spacing
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_settled(&self) -> bool {
        self.settlement_tick.is_some()
    }

    pub fn settlement_tick(&self) -> Option<i64> {
        self.settlement_tick
    }

    pub fn seed_log(&self) -> &[SeedRecord] {
        &self.seed_log
    }

    pub fn tree(&self) -> &RangeMultiplyTree {
        &self.tree
    }

    pub fn status(&self, now: DateTime<Utc>) -> MarketStatus {
        if self.is_settled() {
            MarketStatus::Settled
        } else if now >= self.end {
            MarketStatus::Ended
        } else if now >= self.start && self.is_active {
            MarketStatus::Active
        } else {
            MarketStatus::Pending
        }
    }

    /// Trading is allowed only while the market is `Active`.
    pub fn ensure_tradable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_settled() {
            return Err(ClmsrError::MarketAlreadySettled(self.id));
        }
        if now < self.start {
            return Err(ClmsrError::MarketNotStarted(self.id));
        }
        if now >= self.end {
            return Err(ClmsrError::MarketExpired(self.id));
        }
        if !self.is_active {
            return Err(ClmsrError::MarketNotActive(self.id));
        }
        Ok(())
    }

    /// Weights may change until settlement.
    pub fn ensure_mutable(&self) -> Result<()> {
        if self.is_settled() {
            return Err(ClmsrError::MarketAlreadySettled(self.id));
        }
        Ok(())
    }

    /// Map a half-open tick range to an inclusive bin range `(lo, hi)`.
    pub fn bin_range(&self, lower_tick: i64, upper_tick: i64) -> Result<(usize, usize)> {
        let invalid = |reason| ClmsrError::InvalidRange {
            lower: lower_tick,
            upper: upper_tick,
            reason,
        };
        if lower_tick >= upper_tick {
            return Err(invalid("lower tick must be below upper tick"));
        }
        if lower_tick < self.min_tick || upper_tick > self.max_tick {
            return Err(invalid("range outside market bounds"));
        }
        let lower_offset = i128::from(lower_tick) - i128::from(self.min_tick);
        let upper_offset = i128::from(upper_tick) - i128::from(self.min_tick);
        let spacing = i128::from(self.tick_spacing);
        if lower_offset % spacing != 0 || upper_offset % spacing != 0 {
            return Err(invalid("ticks not aligned to spacing"));
        }
        // Bounded by bins (<= max_bins), so the casts are lossless.
        let lo = (lower_offset / spacing) as usize;
        let hi = (upper_offset / spacing) as usize - 1;
        Ok((lo, hi))
    }

    pub fn set_active(&mut self, active: bool) -> Result<()> {
        self.ensure_mutable()?;
        self.is_active = active;
        Ok(())
    }

    /// Record the outcome. Terminal: a settled market never trades again.
    pub fn settle(&mut self, tick: i64, now: DateTime<Utc>) -> Result<()> {
        if self.is_settled() {
            return Err(ClmsrError::MarketAlreadySettled(self.id));
        }
        if now < self.end {
            return Err(ClmsrError::MarketNotEnded(self.id));
        }
        if tick < self.min_tick || tick >= self.max_tick {
            return Err(ClmsrError::InvalidSettlementTick {
                tick,
                min_tick: self.min_tick,
                max_tick: self.max_tick,
            });
        }
        self.settlement_tick = Some(tick);
        info!(market = %self.id, tick, "market settled");
        Ok(())
    }

    /// Payout owed to a position of `quantity` over `[lower_tick, upper_tick)`.
    pub fn settlement_payout(&self, lower_tick: i64, upper_tick: i64, quantity: u128) -> Result<u128> {
        let tick = self
            .settlement_tick
            .ok_or(ClmsrError::MarketNotSettled(self.id))?;
        self.bin_range(lower_tick, upper_tick)?;
        if (lower_tick..upper_tick).contains(&tick) {
            Ok(quantity)
        } else {
            Ok(0)
        }
    }

    pub(crate) fn record_seed(&mut self, record: SeedRecord) {
        self.seed_log.push(record);
    }
}

/// Caller-owned repository of markets.
///
/// Exclusive access to a market goes through `&mut MarketRegistry`, so one
/// trade at a time can be in flight per registry.
#[derive(Debug, Default)]
pub struct MarketRegistry {
    markets: HashMap<MarketId, Market>,
    next_id: u64,
    config: MarketConfig,
}

impl MarketRegistry {
    pub fn new(config: MarketConfig) -> Self {
        Self {
            markets: HashMap::new(),
            next_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn create_market(&mut self, params: MarketParams) -> Result<MarketId> {
        let id = MarketId(self.next_id.max(1));
        let market = Market::new(id, &params, &self.config)?;
        info!(
            market = %id,
            bins = market.bins(),
            alpha = %wad_to_decimal(market.alpha()),
            start = %params.start,
            end = %params.end,
            "market created"
        );
        self.markets.insert(id, market);
        self.next_id = id.0 + 1;
        Ok(id)
    }

    pub fn get(&self, id: MarketId) -> Result<&Market> {
        self.markets.get(&id).ok_or(ClmsrError::MarketNotFound(id))
    }

    pub fn get_mut(&mut self, id: MarketId) -> Result<&mut Market> {
        self.markets.get_mut(&id).ok_or(ClmsrError::MarketNotFound(id))
    }

    pub fn settle_market(&mut self, id: MarketId, tick: i64, now: DateTime<Utc>) -> Result<()> {
        self.get_mut(id)?.settle(tick, now)
    }

    pub fn set_active(&mut self, id: MarketId, active: bool) -> Result<()> {
        self.get_mut(id)?.set_active(active)
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}
