//! Stress simulation for the CLMSR engine
//!
//! Each simulated market runs a full lifecycle in memory:
//! 1. **Trading**: traders of varying skill buy and sell ranges around their belief
//! 2. **Settlement**: the outcome is drawn from a hidden true bin
//! 3. **Invariants**: maker loss stays within `alpha * ln(bins)` and the tree
//!    root agrees with a from-scratch resummation
//! 4. **Performance**: executed trades per second across a rayon pool

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use ethereum_types::U256;
use rand::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ClmsrError;
use crate::external::LedgerGateway;
use crate::fixed_point::{wln, wmul, Rounding, WAD};
use crate::market::{MarketId, MarketParams, MarketRegistry};
use crate::pricing::{PricingEngine, TradeIntent};

// Simulation parameters (defaults; override via STRESS_* env vars)
const NUM_MARKETS: usize = 8;
const NUM_TRADERS: usize = 100;
const TRADES_PER_MARKET: usize = 2_000;
const NUM_BINS: usize = 1_000;
const ALPHA: f64 = 1_000.0;
const SELL_PROBABILITY: f64 = 0.25;
const MAX_TRADE_QUANTITY: f64 = 25.0;
const SEED: u64 = 42;

const TICK_SPACING: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StressConfig {
    pub num_markets: usize,
    pub num_traders: usize,
    pub trades_per_market: usize,
    pub bins: usize,
    pub alpha: f64,
    pub sell_probability: f64,
    pub max_trade_quantity: f64,
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            num_markets: NUM_MARKETS,
            num_traders: NUM_TRADERS,
            trades_per_market: TRADES_PER_MARKET,
            bins: NUM_BINS,
            alpha: ALPHA,
            sell_probability: SELL_PROBABILITY,
            max_trade_quantity: MAX_TRADE_QUANTITY,
            seed: SEED,
        }
    }
}

impl StressConfig {
    pub fn from_env() -> Self {
        Self {
            num_markets: env_usize("STRESS_NUM_MARKETS", NUM_MARKETS),
            num_traders: env_usize("STRESS_NUM_TRADERS", NUM_TRADERS),
            trades_per_market: env_usize("STRESS_TRADES_PER_MARKET", TRADES_PER_MARKET),
            bins: env_usize("STRESS_BINS", NUM_BINS),
            alpha: env_f64_min("STRESS_ALPHA", ALPHA, 0.001),
            sell_probability: env_f64_clamped("STRESS_SELL_PROBABILITY", SELL_PROBABILITY, 0.0, 1.0),
            max_trade_quantity: env_f64_min("STRESS_MAX_TRADE_QUANTITY", MAX_TRADE_QUANTITY, 0.000_001),
            seed: env_u64("STRESS_SEED", SEED),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_f64_clamped(name: &str, default: f64, min: f64, max: f64) -> f64 {
    env_f64(name, default).clamp(min, max)
}

fn env_f64_min(name: &str, default: f64, min: f64) -> f64 {
    env_f64(name, default).max(min)
}

fn to_wad(value: f64) -> u128 {
    (value * WAD as f64) as u128
}

fn from_wad(value: i128) -> f64 {
    value as f64 / WAD as f64
}

/// A simulated trader; skill 0.0 is pure noise, 1.0 knows the true bin.
#[derive(Debug, Clone)]
struct Trader {
    skill: f64,
}

#[derive(Debug, Clone)]
struct Position {
    lower_tick: i64,
    upper_tick: i64,
    quantity: u128,
}

#[derive(Debug, Default)]
struct TradeCounts {
    executed: u64,
    skipped: u64,
    rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketReport {
    pub market_index: usize,
    pub executed: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub settlement_tick: i64,
    pub collected: f64,
    pub paid_out: f64,
    pub maker_pnl: f64,
    pub loss_bound: f64,
    pub within_loss_bound: bool,
    pub tree_consistent: bool,
    pub final_true_range_price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub config: StressConfig,
    pub executed: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub duration_secs: f64,
    pub trades_per_second: f64,
    pub worst_loss_ratio: f64,
    pub all_within_loss_bound: bool,
    pub all_trees_consistent: bool,
    pub markets: Vec<MarketReport>,
}

/// Belief about the outcome bin: skilled traders land near the true bin.
fn simulate_belief(rng: &mut StdRng, skill: f64, true_bin: usize, bins: usize) -> usize {
    let spread = (1.0 - skill) * bins as f64 / 2.0;
    let noise = (rng.gen::<f64>() - 0.5) * 2.0 * spread;
    (true_bin as f64 + noise).clamp(0.0, (bins - 1) as f64) as usize
}

/// Root vs. resummation within 1e-15 relative.
fn root_matches_resum(root: U256, resum: U256) -> bool {
    let diff = if root > resum { root - resum } else { resum - root };
    diff.checked_mul(U256::exp10(15))
        .map(|scaled| scaled <= resum)
        .unwrap_or(false)
}

fn is_trade_rejection(err: &ClmsrError) -> bool {
    matches!(
        err,
        ClmsrError::ChunkLimitExceeded { .. } | ClmsrError::MathOverflow | ClmsrError::MathUnderflow
    )
}

fn simulate_market(index: usize, config: &Config, stress: &StressConfig) -> Result<MarketReport> {
    let mut rng = StdRng::seed_from_u64(stress.seed.wrapping_add(index as u64));
    let mut registry = MarketRegistry::new(config.market.clone());
    let engine = PricingEngine::new(config.pricing.clone());
    let mut gateway = LedgerGateway::default();

    let start = Utc::now();
    let end = start + Duration::days(1);
    let trading_time = start + Duration::hours(1);
    let bins = stress.bins;
    let alpha = to_wad(stress.alpha);

    let id: MarketId = registry.create_market(MarketParams {
        min_tick: 0,
        max_tick: bins as i64 * TICK_SPACING,
        tick_spacing: TICK_SPACING,
        alpha,
        start,
        end,
    })?;

    let traders: Vec<Trader> = (0..stress.num_traders)
        .map(|_| Trader { skill: rng.gen() })
        .collect();
    let true_bin = rng.gen_range(0..bins);
    let mut positions: HashMap<usize, Vec<Position>> = HashMap::new();
    let mut counts = TradeCounts::default();

    for _ in 0..stress.trades_per_market {
        let trader_idx = rng.gen_range(0..traders.len());
        let held = positions.get(&trader_idx).map_or(0, Vec::len);

        if held > 0 && rng.gen::<f64>() < stress.sell_probability {
            let slot = rng.gen_range(0..held);
            let Some(position) = positions.get_mut(&trader_idx).and_then(|p| p.get_mut(slot)) else {
                counts.skipped += 1;
                continue;
            };
            let fraction = 0.1 + rng.gen::<f64>() * 0.9;
            let quantity = ((position.quantity as f64 * fraction) as u128).clamp(1, position.quantity);
            let intent = TradeIntent {
                market_id: id,
                lower_tick: position.lower_tick,
                upper_tick: position.upper_tick,
                quantity,
                bound: 0,
            };
            match engine.close_position(&mut registry, &intent, trading_time, &mut gateway) {
                Ok(_) => {
                    position.quantity -= quantity;
                    counts.executed += 1;
                }
                Err(err) if is_trade_rejection(&err) => counts.rejected += 1,
                Err(err) => return Err(err.into()),
            }
            if let Some(held) = positions.get_mut(&trader_idx) {
                held.retain(|p| p.quantity > 0);
            }
            continue;
        }

        let belief = simulate_belief(&mut rng, traders[trader_idx].skill, true_bin, bins);
        let half_width = rng.gen_range(0..=(bins / 20).max(1));
        let lo = belief.saturating_sub(half_width);
        let hi = (belief + half_width).min(bins - 1);
        let quantity = to_wad(rng.gen::<f64>() * stress.max_trade_quantity).max(1);
        let intent = TradeIntent {
            market_id: id,
            lower_tick: lo as i64 * TICK_SPACING,
            upper_tick: (hi as i64 + 1) * TICK_SPACING,
            quantity,
            bound: u128::MAX,
        };

        match engine.open_position(&mut registry, &intent, trading_time, &mut gateway) {
            Ok(receipt) => {
                positions.entry(trader_idx).or_default().push(Position {
                    lower_tick: receipt.lower_tick,
                    upper_tick: receipt.upper_tick,
                    quantity: receipt.quantity,
                });
                counts.executed += 1;
            }
            Err(err) if is_trade_rejection(&err) => counts.rejected += 1,
            Err(err) => return Err(err.into()),
        }
    }

    let true_lower = true_bin as i64 * TICK_SPACING;
    let final_true_range_price =
        engine.range_price(&registry, id, true_lower, true_lower + TICK_SPACING)? as f64 / WAD as f64;

    let settlement_tick = true_lower + rng.gen_range(0..TICK_SPACING);
    registry.settle_market(id, settlement_tick, end)?;
    let market = registry.get(id)?;

    let mut paid_out: u128 = 0;
    for position in positions.values().flatten() {
        paid_out += market.settlement_payout(position.lower_tick, position.upper_tick, position.quantity)?;
    }

    let maker_pnl = gateway.maker_balance - i128::try_from(paid_out)?;
    let ln_bins = wln(U256::from(bins as u128 * WAD))?;
    let loss_bound = wmul(alpha, u128::try_from(ln_bins)?, Rounding::Up)?;
    let within_loss_bound = maker_pnl >= -i128::try_from(loss_bound)?;
    let tree_consistent = root_matches_resum(market.tree().total_sum(), market.tree().resum_leaves()?);

    debug!(
        market = index,
        executed = counts.executed,
        pnl = from_wad(maker_pnl),
        bound = from_wad(loss_bound as i128),
        "market simulated"
    );

    Ok(MarketReport {
        market_index: index,
        executed: counts.executed,
        skipped: counts.skipped,
        rejected: counts.rejected,
        settlement_tick,
        collected: from_wad(gateway.collected as i128),
        paid_out: from_wad(paid_out as i128),
        maker_pnl: from_wad(maker_pnl),
        loss_bound: from_wad(loss_bound as i128),
        within_loss_bound,
        tree_consistent,
        final_true_range_price,
    })
}

/// Run every market on the rayon pool and aggregate the results.
pub fn run_stress_test(config: &Config, stress: &StressConfig) -> Result<StressReport> {
    if stress.bins > config.market.max_bins {
        bail!("STRESS_BINS {} exceeds configured max_bins {}", stress.bins, config.market.max_bins);
    }

    info!(
        "Simulating {} markets x {} trades ({} bins, alpha {})",
        stress.num_markets, stress.trades_per_market, stress.bins, stress.alpha
    );
    let start_time = Instant::now();

    let markets = (0..stress.num_markets)
        .into_par_iter()
        .map(|index| simulate_market(index, config, stress))
        .collect::<Result<Vec<_>>>()?;

    let duration = start_time.elapsed();
    let executed: u64 = markets.iter().map(|m| m.executed).sum();
    let skipped: u64 = markets.iter().map(|m| m.skipped).sum();
    let rejected: u64 = markets.iter().map(|m| m.rejected).sum();
    let trades_per_second = executed as f64 / duration.as_secs_f64().max(f64::EPSILON);
    let worst_loss_ratio = markets
        .iter()
        .map(|m| (-m.maker_pnl / m.loss_bound).max(0.0))
        .fold(0.0, f64::max);

    let report = StressReport {
        config: stress.clone(),
        executed,
        skipped,
        rejected,
        duration_secs: duration.as_secs_f64(),
        trades_per_second,
        worst_loss_ratio,
        all_within_loss_bound: markets.iter().all(|m| m.within_loss_bound),
        all_trees_consistent: markets.iter().all(|m| m.tree_consistent),
        markets,
    };

    info!("Simulation finished in {:.2?}", duration);
    info!("   Executed {} trades ({} skipped, {} rejected)", executed, skipped, rejected);
    info!("   Performance: {:.2} trades/second", trades_per_second);
    info!("   Worst maker loss / bound: {:.4}", worst_loss_ratio);

    Ok(report)
}
