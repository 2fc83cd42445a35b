//! Seams to collaborators outside the pricing engine: moving funds and
//! deciding fees.

use serde::{Deserialize, Serialize};

use crate::error::{ClmsrError, Result};
use crate::market::{MarketId, TradeSide};

/// Settles the cash side of a trade after the tree change is committed.
/// A returned error makes the engine roll the trade back.
pub trait PaymentGateway {
    /// Take `amount` (WAD) from the trader for a buy.
    fn collect(&mut self, market: MarketId, amount: u128) -> std::result::Result<(), String>;

    /// Pay `amount` (WAD) to the trader for a sell.
    fn disburse(&mut self, market: MarketId, amount: u128) -> std::result::Result<(), String>;
}

/// Fee charged on top of (buys) or withheld from (sells) the raw amount.
pub trait FeePolicy {
    fn fee(&self, side: TradeSide, raw_amount: u128) -> Result<u128>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFee;

impl FeePolicy for NoFee {
    fn fee(&self, _side: TradeSide, _raw_amount: u128) -> Result<u128> {
        Ok(0)
    }
}

/// Proportional fee in basis points, rounded up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BasisPointFee {
    pub buy_bps: u32,
    pub sell_bps: u32,
}

const BPS_DENOMINATOR: u128 = 10_000;

impl BasisPointFee {
    pub fn new(buy_bps: u32, sell_bps: u32) -> Self {
        Self { buy_bps, sell_bps }
    }

    pub fn flat(bps: u32) -> Self {
        Self::new(bps, bps)
    }
}

impl FeePolicy for BasisPointFee {
    fn fee(&self, side: TradeSide, raw_amount: u128) -> Result<u128> {
        let bps = match side {
            TradeSide::Buy => self.buy_bps,
            TradeSide::Sell => self.sell_bps,
        };
        let scaled = raw_amount
            .checked_mul(u128::from(bps))
            .ok_or(ClmsrError::MathOverflow)?;
        Ok(scaled.div_ceil(BPS_DENOMINATOR))
    }
}

/// Amount that actually changes hands once the fee is applied.
pub fn apply_fee(side: TradeSide, raw_amount: u128, fee: u128) -> Result<u128> {
    match side {
        TradeSide::Buy => raw_amount.checked_add(fee).ok_or(ClmsrError::MathOverflow),
        TradeSide::Sell => Ok(raw_amount.saturating_sub(fee)),
    }
}

/// In-memory gateway with a balance ledger, used by the stress simulation
/// and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerGateway {
    /// Net cash received by the market maker (WAD, signed).
    pub maker_balance: i128,
    pub collected: u128,
    pub disbursed: u128,
    /// Fail the next call with this message.
    pub fail_next: Option<String>,
}

impl LedgerGateway {
    fn take_failure(&mut self) -> std::result::Result<(), String> {
        match self.fail_next.take() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

impl PaymentGateway for LedgerGateway {
    fn collect(&mut self, _market: MarketId, amount: u128) -> std::result::Result<(), String> {
        self.take_failure()?;
        let signed = i128::try_from(amount).map_err(|_| "amount exceeds ledger range".to_string())?;
        self.maker_balance += signed;
        self.collected += amount;
        Ok(())
    }

    fn disburse(&mut self, _market: MarketId, amount: u128) -> std::result::Result<(), String> {
        self.take_failure()?;
        let signed = i128::try_from(amount).map_err(|_| "amount exceeds ledger range".to_string())?;
        self.maker_balance -= signed;
        self.disbursed += amount;
        Ok(())
    }
}
