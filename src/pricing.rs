//! src/pricing.rs
//! CLMSR pricing on top of the range tree.
//!
//! Buying `q` over a bin range multiplies those weights by `e^(q/alpha)`;
//! the trader pays `alpha * (ln S_after - ln S_before)` where `S` is the sum
//! over all bins. Selling multiplies by `e^(-q/alpha)` and pays out the
//! difference the other way. Large trades are split into chunks so each
//! tree factor stays within `[e^-x, e^x]` for the configured chunk exponent
//! `x`; the per-chunk log differences telescope to the one-shot amount.

use chrono::{DateTime, Utc};
use ethereum_types::U256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::{debug, info, warn};

use crate::config::PricingConfig;
use crate::error::{ClmsrError, Result};
use crate::external::{apply_fee, FeePolicy, NoFee, PaymentGateway};
use crate::fixed_point::{
    exp_e36, exp_neg_e36, ln_e36, ln_ratio_e36, mul_div, to_u128, wad_to_decimal, wdiv, wmul,
    Rounding, WAD,
};
use crate::market::{Market, MarketId, MarketRegistry, SeedRecord, TradeSide};
use crate::range_tree::{ChangeSet, RangeMultiplyTree};

/// How a quantity is split: `full_chunks` of `chunk_size`, then `remainder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunk_size: u128,
    pub full_chunks: u128,
    pub remainder: u128,
}

impl ChunkPlan {
    pub fn count(&self) -> u128 {
        self.full_chunks + u128::from(self.remainder > 0)
    }

    pub fn sizes(&self) -> impl Iterator<Item = u128> + '_ {
        let full = (0..self.full_chunks).map(move |_| self.chunk_size);
        full.chain((self.remainder > 0).then_some(self.remainder))
    }
}

/// A range trade request. `bound` is the maximum total cost for a buy and
/// the minimum total proceeds for a sell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub market_id: MarketId,
    pub lower_tick: i64,
    pub upper_tick: i64,
    pub quantity: u128,
    pub bound: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeReceipt {
    pub market_id: MarketId,
    pub side: TradeSide,
    pub lower_tick: i64,
    pub upper_tick: i64,
    pub quantity: u128,
    /// Cost or proceeds before fees.
    pub raw_amount: u128,
    pub fee: u128,
    /// Amount collected (buy) or disbursed (sell).
    pub total: u128,
    pub chunks: u32,
}

/// Keccak-256 over the market id, every range and every factor, all
/// big-endian. Seeding batches must carry this tag.
pub fn batch_integrity_tag(market_id: MarketId, ranges: &[(i64, i64)], factors: &[u128]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(market_id.0.to_be_bytes());
    for (lower, upper) in ranges {
        hasher.update(lower.to_be_bytes());
        hasher.update(upper.to_be_bytes());
    }
    for factor in factors {
        hasher.update(factor.to_be_bytes());
    }
    hasher.finalize().into()
}

/// How the traded range splits the pre-trade total `S`, as natural logs at
/// 36 decimals: `inside = ln(R / S)`, `outside = ln((S - R) / S)`.
///
/// Pricing works from these shares rather than from absolute sums, so the
/// result depends only on the cumulative exponent and never on how the
/// quantity was chunked.
#[derive(Debug, Clone, Copy)]
struct RangeShare {
    inside: i128,
    /// `None` when the range covers every bin.
    outside: Option<i128>,
}

/// `ln(S_E / S_0)` for a cumulative exponent `E`, split as
/// `linear * 1.0 + residual` so exponents of any size stay exact.
/// Both parts are oriented so the trade's amount is `alpha * (linear + residual)`.
#[derive(Debug, Clone, Copy)]
struct LogChange {
    /// WAD
    linear: u128,
    /// 36 decimals
    residual: i128,
}

impl RangeShare {
    fn measure(range_sum: U256, total_sum: U256) -> Result<Self> {
        // query() rounds up through pending tags and may overshoot the root
        let range_sum = range_sum.min(total_sum);
        let inside = ln_ratio_e36(range_sum, total_sum)?;
        let rest = total_sum - range_sum;
        let outside = if rest.is_zero() {
            None
        } else {
            Some(ln_ratio_e36(rest, total_sum)?)
        };
        Ok(Self { inside, outside })
    }

    /// Buy: `ln(1 + p(e^E - 1)) = E + ln(p + (1 - p)e^-E)`.
    /// Sell: `-ln(1 - p(1 - e^-E)) = -ln((1 - p) + p·e^-E)`.
    fn log_change(&self, side: TradeSide, exponent: u128) -> Result<LogChange> {
        match (side, self.outside) {
            // the whole market moves together: ln change is exactly ±E
            (_, None) => Ok(LogChange {
                linear: exponent,
                residual: 0,
            }),
            (TradeSide::Buy, Some(outside)) => Ok(LogChange {
                linear: exponent,
                residual: log_add_decayed(self.inside, outside, exponent)?,
            }),
            (TradeSide::Sell, Some(outside)) => Ok(LogChange {
                linear: 0,
                residual: -log_add_decayed(outside, self.inside, exponent)?,
            }),
        }
    }
}

/// `ln(e^kept + e^(decayed - exponent))` at 36 decimals, `exponent` a WAD.
fn log_add_decayed(kept: i128, decayed: i128, exponent: u128) -> Result<i128> {
    let shifted = exponent
        .checked_mul(WAD)
        .and_then(|e36| i128::try_from(e36).ok())
        .and_then(|e36| decayed.checked_sub(e36));
    let Some(shifted) = shifted else {
        // e^-170 and below: the decayed side is beneath one 36-decimal unit
        return Ok(kept + 1);
    };
    let (high, low) = if kept >= shifted {
        (kept, shifted)
    } else {
        (shifted, kept)
    };
    let tail = exp_neg_e36(U256::from(high.abs_diff(low)))?;
    let e36 = U256::from(WAD) * U256::from(WAD);
    let lift = ln_ratio_e36(e36 + U256::from(tail), e36)?;
    high.checked_add(lift).ok_or(ClmsrError::MathOverflow)
}

/// Run every chunk inside one transaction. Returns the raw amount and the
/// buffered tree writes; nothing is committed here.
///
/// Chunk `i` covers the cumulative exponent `E_i = q_i / alpha` (rounded up
/// for buys, down for sells), so the exponents of all chunks add up to the
/// one-shot exponent. Each chunk's tree factor targets `e^(E_i - E_(i-1))`
/// plus whatever the previous factors' rounding left over, so rounding
/// never compounds across chunks.
fn price_chunks(
    tree: &RangeMultiplyTree,
    side: TradeSide,
    (lo, hi): (usize, usize),
    alpha: u128,
    plan: &ChunkPlan,
) -> Result<(u128, ChangeSet)> {
    let share = RangeShare::measure(tree.query(lo, hi)?, tree.total_sum())?;
    let rounding = match side {
        TradeSide::Buy => Rounding::Up,
        TradeSide::Sell => Rounding::Down,
    };

    let mut txn = tree.begin();
    let mut filled = 0u128;
    let mut exponent = 0u128;
    let mut previous = share.log_change(side, 0)?;
    let mut linear = 0u128;
    let mut residual = 0i128;
    // ln(target product / applied product), 36 decimals
    let mut carry = 0i128;

    for chunk in plan.sizes() {
        filled = filled.checked_add(chunk).ok_or(ClmsrError::MathOverflow)?;
        let next_exponent = wdiv(filled, alpha, rounding)?;
        let step = (next_exponent - exponent)
            .checked_mul(WAD)
            .and_then(|e36| i128::try_from(e36).ok())
            .ok_or(ClmsrError::MathOverflow)?;
        let target = match side {
            TradeSide::Buy => step,
            TradeSide::Sell => -step,
        } + carry;
        let factor = exp_e36(target)?;
        carry = target - ln_e36(U256::from(factor))?;
        txn.update(lo, hi, factor)?;

        let next = share.log_change(side, next_exponent)?;
        linear = linear
            .checked_add(next.linear - previous.linear)
            .ok_or(ClmsrError::MathOverflow)?;
        residual = residual
            .checked_add(next.residual - previous.residual)
            .ok_or(ClmsrError::MathOverflow)?;
        previous = next;
        exponent = next_exponent;
    }

    // A factor below 1.0 carries a coarse relative rounding; square up with
    // one factor near 1.0 so the applied product matches e^E to one unit.
    if carry.unsigned_abs() > WAD {
        txn.update(lo, hi, exp_e36(carry)?)?;
    }

    let e36 = U256::from(WAD) * U256::from(WAD);
    let linear = U256::from(linear) * U256::from(WAD);
    let magnitude = U256::from(residual.unsigned_abs());
    let log_change = if residual >= 0 {
        linear.checked_add(magnitude).ok_or(ClmsrError::MathOverflow)?
    } else {
        linear.saturating_sub(magnitude)
    };
    let amount = to_u128(mul_div(U256::from(alpha), log_change, e36, rounding)?)?;
    let amount = match side {
        TradeSide::Buy => amount.max(1),
        TradeSide::Sell => amount,
    };
    Ok((amount, txn.into_changes()))
}

pub struct PricingEngine {
    config: PricingConfig,
    fees: Box<dyn FeePolicy + Send + Sync>,
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}

impl PricingEngine {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            config,
            fees: Box::new(NoFee),
        }
    }

    pub fn with_fee_policy(mut self, policy: impl FeePolicy + Send + Sync + 'static) -> Self {
        self.fees = Box::new(policy);
        self
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Split `quantity` into chunks of at most `alpha * max_chunk_exponent`.
    pub fn plan_chunks(&self, alpha: u128, quantity: u128) -> Result<ChunkPlan> {
        if quantity == 0 {
            return Err(ClmsrError::InvalidQuantity);
        }
        let chunk_size = wmul(alpha, self.config.max_chunk_exponent, Rounding::Down)?.max(1);
        let required = quantity.div_ceil(chunk_size);
        if required > u128::from(self.config.max_chunks_per_trade) {
            return Err(ClmsrError::ChunkLimitExceeded {
                required,
                limit: self.config.max_chunks_per_trade,
            });
        }
        Ok(ChunkPlan {
            chunk_size,
            full_chunks: quantity / chunk_size,
            remainder: quantity % chunk_size,
        })
    }

    fn quote(
        &self,
        market: &Market,
        side: TradeSide,
        lower_tick: i64,
        upper_tick: i64,
        quantity: u128,
    ) -> Result<(u128, ChunkPlan, ChangeSet)> {
        let bins = market.bin_range(lower_tick, upper_tick)?;
        let plan = self.plan_chunks(market.alpha(), quantity)?;
        debug!(
            market = %market.id(),
            side = side.as_str(),
            chunks = %plan.count(),
            chunk_size = %wad_to_decimal(plan.chunk_size),
            "chunk plan"
        );
        let (amount, changes) = price_chunks(&market.tree, side, bins, market.alpha(), &plan)?;
        Ok((amount, plan, changes))
    }

    /// Cost (before fees) of buying `quantity` over `[lower_tick, upper_tick)`.
    pub fn calculate_open_cost(
        &self,
        registry: &MarketRegistry,
        id: MarketId,
        lower_tick: i64,
        upper_tick: i64,
        quantity: u128,
    ) -> Result<u128> {
        let market = registry.get(id)?;
        market.ensure_mutable()?;
        let (cost, _, _) = self.quote(market, TradeSide::Buy, lower_tick, upper_tick, quantity)?;
        Ok(cost)
    }

    /// Proceeds (before fees) of selling `quantity` over `[lower_tick, upper_tick)`.
    pub fn calculate_close_proceeds(
        &self,
        registry: &MarketRegistry,
        id: MarketId,
        lower_tick: i64,
        upper_tick: i64,
        quantity: u128,
    ) -> Result<u128> {
        let market = registry.get(id)?;
        market.ensure_mutable()?;
        let (proceeds, _, _) = self.quote(market, TradeSide::Sell, lower_tick, upper_tick, quantity)?;
        Ok(proceeds)
    }

    pub fn get_range_sum(
        &self,
        registry: &MarketRegistry,
        id: MarketId,
        lower_tick: i64,
        upper_tick: i64,
    ) -> Result<U256> {
        let market = registry.get(id)?;
        let (lo, hi) = market.bin_range(lower_tick, upper_tick)?;
        market.tree.query(lo, hi)
    }

    /// Implied probability (WAD) of the outcome landing in the range.
    pub fn range_price(
        &self,
        registry: &MarketRegistry,
        id: MarketId,
        lower_tick: i64,
        upper_tick: i64,
    ) -> Result<u128> {
        let market = registry.get(id)?;
        let (lo, hi) = market.bin_range(lower_tick, upper_tick)?;
        let range_sum = market.tree.query(lo, hi)?;
        let price = mul_div(range_sum, U256::from(WAD), market.tree.total_sum(), Rounding::Down)?;
        to_u128(price)
    }

    /// Largest quantity whose cost does not exceed `cost`:
    /// `q = alpha * ln(1 + S * (e^(C/alpha) - 1) / R)`, rounded down.
    /// Evaluated in log space, so any budget has an answer.
    pub fn calculate_quantity_from_cost(
        &self,
        registry: &MarketRegistry,
        id: MarketId,
        lower_tick: i64,
        upper_tick: i64,
        cost: u128,
    ) -> Result<u128> {
        if cost == 0 {
            return Err(ClmsrError::InvalidQuantity);
        }
        let market = registry.get(id)?;
        market.ensure_mutable()?;
        let (lo, hi) = market.bin_range(lower_tick, upper_tick)?;
        let alpha = market.alpha();
        let range_sum = market.tree.query(lo, hi)?;
        let total_sum = market.tree.total_sum();

        // E = c + ln(v / p) with c = C / alpha and v = 1 - (1 - p)e^-c
        let cost_exponent = wdiv(cost, alpha, Rounding::Down)?;
        let decay = exp_neg_e36(U256::from(cost_exponent) * U256::from(WAD))?;
        let e36 = U256::from(WAD) * U256::from(WAD);
        let scaled_total = total_sum.checked_mul(e36).ok_or(ClmsrError::MathOverflow)?;
        let range_sum = range_sum.min(total_sum);
        let outside = (total_sum - range_sum) * U256::from(decay);
        let remaining = scaled_total.saturating_sub(outside);
        let lift = ln_ratio_e36(remaining, range_sum * e36)?;

        let log_growth = U256::from(cost_exponent) * U256::from(WAD) + U256::from(lift.max(0) as u128);
        to_u128(mul_div(U256::from(alpha), log_growth, e36, Rounding::Down)?)
    }

    /// Apply a signed batch of range multipliers in one transaction.
    pub fn apply_range_factor_batch(
        &self,
        registry: &mut MarketRegistry,
        id: MarketId,
        ranges: &[(i64, i64)],
        factors: &[u128],
        integrity_tag: [u8; 32],
    ) -> Result<SeedRecord> {
        let market = registry.get_mut(id)?;
        market.ensure_mutable()?;
        if ranges.len() != factors.len() {
            return Err(ClmsrError::BatchLengthMismatch {
                ranges: ranges.len(),
                factors: factors.len(),
            });
        }
        if ranges.is_empty() {
            return Err(ClmsrError::EmptyBatch);
        }
        let (min, max) = (self.config.min_seed_factor, self.config.max_seed_factor);
        if let Some(factor) = factors.iter().find(|f| **f < min || **f > max) {
            return Err(ClmsrError::InvalidFactor {
                factor: *factor,
                min,
                max,
            });
        }
        let expected = batch_integrity_tag(id, ranges, factors);
        if expected != integrity_tag {
            return Err(ClmsrError::IntegrityTagMismatch {
                expected: hex::encode(expected),
                provided: hex::encode(integrity_tag),
            });
        }

        let bins = ranges
            .iter()
            .map(|(lower, upper)| market.bin_range(*lower, *upper))
            .collect::<Result<Vec<_>>>()?;

        let mut txn = market.tree.begin();
        for ((lo, hi), factor) in bins.iter().zip(factors) {
            txn.update(*lo, *hi, *factor)?;
        }
        let updates = txn.updates();
        let changes = txn.into_changes();
        market.tree.commit(changes);

        let record = SeedRecord {
            tag: hex::encode(expected),
            ranges: ranges.len(),
            updates,
        };
        market.record_seed(record.clone());
        info!(market = %id, ranges = ranges.len(), tag = %record.tag, "seeding batch applied");

        if let Err(err) = market.tree.maybe_rebuild() {
            warn!(market = %id, error = %err, "range tree rebuild failed");
        }
        Ok(record)
    }

    /// Buy `quantity` over the intent's range. Fails with
    /// `CostExceedsMaximum` if the total (fee included) exceeds `bound`.
    pub fn open_position<P: PaymentGateway + ?Sized>(
        &self,
        registry: &mut MarketRegistry,
        intent: &TradeIntent,
        now: DateTime<Utc>,
        payments: &mut P,
    ) -> Result<TradeReceipt> {
        self.execute(registry, TradeSide::Buy, intent, now, payments)
    }

    /// Sell `quantity` over the intent's range. Fails with
    /// `ProceedsBelowMinimum` if the total (fee deducted) is under `bound`.
    pub fn close_position<P: PaymentGateway + ?Sized>(
        &self,
        registry: &mut MarketRegistry,
        intent: &TradeIntent,
        now: DateTime<Utc>,
        payments: &mut P,
    ) -> Result<TradeReceipt> {
        self.execute(registry, TradeSide::Sell, intent, now, payments)
    }

    fn execute<P: PaymentGateway + ?Sized>(
        &self,
        registry: &mut MarketRegistry,
        side: TradeSide,
        intent: &TradeIntent,
        now: DateTime<Utc>,
        payments: &mut P,
    ) -> Result<TradeReceipt> {
        let id = intent.market_id;
        let market = registry.get_mut(id)?;
        market.ensure_tradable(now)?;

        let (raw_amount, plan, changes) =
            self.quote(market, side, intent.lower_tick, intent.upper_tick, intent.quantity)?;
        let fee = self.fees.fee(side, raw_amount)?;
        let total = apply_fee(side, raw_amount, fee)?;

        match side {
            TradeSide::Buy if total > intent.bound => {
                return Err(ClmsrError::CostExceedsMaximum {
                    cost: total,
                    max: intent.bound,
                });
            }
            TradeSide::Sell if total < intent.bound => {
                return Err(ClmsrError::ProceedsBelowMinimum {
                    proceeds: total,
                    min: intent.bound,
                });
            }
            _ => {}
        }

        let undo = market.tree.commit(changes);
        let paid = match side {
            TradeSide::Buy => payments.collect(id, total),
            TradeSide::Sell => payments.disburse(id, total),
        };
        if let Err(reason) = paid {
            market.tree.revert(undo);
            warn!(market = %id, side = side.as_str(), %reason, "payment failed, trade reverted");
            return Err(ClmsrError::PaymentFailed(reason));
        }

        if let Err(err) = market.tree.maybe_rebuild() {
            warn!(market = %id, error = %err, "range tree rebuild failed");
        }

        // Bounded by max_chunks_per_trade.
        let chunks = u32::try_from(plan.count()).unwrap_or(u32::MAX);
        debug!(
            market = %id,
            side = side.as_str(),
            lower = intent.lower_tick,
            upper = intent.upper_tick,
            quantity = %wad_to_decimal(intent.quantity),
            total = %wad_to_decimal(total),
            chunks,
            "trade executed"
        );

        Ok(TradeReceipt {
            market_id: id,
            side,
            lower_tick: intent.lower_tick,
            upper_tick: intent.upper_tick,
            quantity: intent.quantity,
            raw_amount,
            fee,
            total,
            chunks,
        })
    }
}
