//! src/fixed_point.rs
//! 18-decimal fixed-point ("WAD") arithmetic for the pricing engine.
//!
//! Multiply and divide take an explicit [`Rounding`] at every call site.
//! `wexp` and `wln` evaluate their series at 36 decimals and round once
//! when scaling back to WAD.

use ethereum_types::U256;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::error::{ClmsrError, Result};

pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Internal precision for the exp/ln series.
const E36: u128 = WAD * WAD;

/// ln(2) at 36 decimals.
const LN2_E36: u128 = 693_147_180_559_945_309_417_232_121_458_176_568;

/// Upper bound of the `wexp` domain (40.0). e^40 in WAD still fits a u128.
pub const MAX_EXP_INPUT: i128 = 40 * WAD as i128;

/// Lower bound of the `wexp` domain (-40.0). e^-40 is still >= 1 unit.
pub const MIN_EXP_INPUT: i128 = -MAX_EXP_INPUT;

/// `wln` accepts values up to 1e40 (in WAD units, 1e58).
const MAX_LN_INPUT_EXP10: usize = 58;

/// Bits needed to represent `E36`; floor(log2(1e36)) = 119.
const E36_BITS: i64 = 120;

const EXP_SERIES_TERMS: u32 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

#[inline]
fn wad_u256() -> U256 {
    U256::from(WAD)
}

#[inline]
fn e36_u256() -> U256 {
    U256::from(E36)
}

/// Narrow a 256-bit value back to a u128 WAD.
pub fn to_u128(value: U256) -> Result<u128> {
    if value > U256::from(u128::MAX) {
        return Err(ClmsrError::MathOverflow);
    }
    Ok(value.low_u128())
}

fn div_rounding(numerator: U256, denominator: U256, rounding: Rounding) -> Result<U256> {
    if denominator.is_zero() {
        return Err(ClmsrError::DivisionByZero);
    }
    let quotient = numerator / denominator;
    match rounding {
        Rounding::Up if !(numerator % denominator).is_zero() => Ok(quotient + U256::one()),
        _ => Ok(quotient),
    }
}

/// Signed division rounding half away from zero. `denominator` must be positive.
fn div_round_nearest(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.unsigned_abs() * 2 >= denominator.unsigned_abs() {
        quotient + numerator.signum()
    } else {
        quotient
    }
}

/// `a * b` at WAD scale.
pub fn wmul(a: u128, b: u128, rounding: Rounding) -> Result<u128> {
    let product = U256::from(a) * U256::from(b);
    to_u128(div_rounding(product, wad_u256(), rounding)?)
}

/// `a / b` at WAD scale.
pub fn wdiv(a: u128, b: u128, rounding: Rounding) -> Result<u128> {
    if b == 0 {
        return Err(ClmsrError::DivisionByZero);
    }
    let numerator = U256::from(a) * wad_u256();
    to_u128(div_rounding(numerator, U256::from(b), rounding)?)
}

/// `a * b` at WAD scale where `a` is a 256-bit aggregate (tree sums).
pub fn wmul_wide(a: U256, b: u128, rounding: Rounding) -> Result<U256> {
    let product = a
        .checked_mul(U256::from(b))
        .ok_or(ClmsrError::MathOverflow)?;
    div_rounding(product, wad_u256(), rounding)
}

/// `a * b / denominator` over 256 bits.
pub fn mul_div(a: U256, b: U256, denominator: U256, rounding: Rounding) -> Result<U256> {
    let product = a.checked_mul(b).ok_or(ClmsrError::MathOverflow)?;
    div_rounding(product, denominator, rounding)
}

/// e^r at 36 decimals for 0 <= r < ln(2).
fn exp_taylor_e36(r: U256) -> U256 {
    let e36 = e36_u256();
    let mut sum = e36;
    let mut term = e36;
    for n in 1..=EXP_SERIES_TERMS {
        term = term * r / (e36 * U256::from(n));
        if term.is_zero() {
            break;
        }
        sum = sum + term;
    }
    sum
}

/// Natural exponential of a signed WAD, rounded up.
///
/// Valid for `x` in `[MIN_EXP_INPUT, MAX_EXP_INPUT]`; outside that window
/// the call fails instead of saturating.
pub fn wexp(x: i128) -> Result<u128> {
    if x > MAX_EXP_INPUT {
        return Err(ClmsrError::MathOverflow);
    }
    if x < MIN_EXP_INPUT {
        return Err(ClmsrError::MathUnderflow);
    }
    exp_e36(x * WAD as i128)
}

/// e^x for a 36-decimal `x`, returned as a WAD rounded up.
///
/// Same domain as [`wexp`]. The argument is reduced as `x = k·ln2 + r`
/// with `|r| <= ln2/2`, so the series converges in a few dozen terms.
pub(crate) fn exp_e36(x36: i128) -> Result<u128> {
    let bound = MAX_EXP_INPUT * WAD as i128;
    if x36 > bound {
        return Err(ClmsrError::MathOverflow);
    }
    if x36 < -bound {
        return Err(ClmsrError::MathUnderflow);
    }

    let ln2 = LN2_E36 as i128;
    let k = div_round_nearest(x36, ln2);
    let r = x36 - k * ln2;

    let e36 = e36_u256();
    let e_abs = exp_taylor_e36(U256::from(r.unsigned_abs()));
    let e_r = if r < 0 {
        div_rounding(e36 * e36, e_abs, Rounding::Up)?
    } else {
        e_abs
    };

    let shift = k.unsigned_abs() as usize;
    let (numerator, denominator) = if k >= 0 {
        (e_r << shift, wad_u256())
    } else {
        (e_r, wad_u256() << shift)
    };
    to_u128(div_rounding(numerator, denominator, Rounding::Up)?)
}

/// e^-x at 36 decimals for a non-negative 36-decimal `x`, rounded up.
/// Never returns zero: anything below one unit comes back as 1.
pub(crate) fn exp_neg_e36(x: U256) -> Result<u128> {
    let ln2 = U256::from(LN2_E36);
    let k = x / ln2;
    if k >= U256::from(E36_BITS as u64) {
        return Ok(1);
    }
    let r = x - k * ln2;

    let e36 = e36_u256();
    let inverse = div_rounding(e36 * e36, exp_taylor_e36(r), Rounding::Up)?;
    let scaled = div_rounding(inverse, U256::one() << k.low_u64() as usize, Rounding::Up)?;
    Ok(scaled.low_u128().max(1))
}

/// ln(x / 1e36) at 36 decimals for any nonzero 256-bit `x`.
fn ln_scaled_e36(scaled: U256) -> Result<i128> {
    if scaled.is_zero() {
        return Err(ClmsrError::MathUnderflow);
    }

    let e36 = e36_u256();
    let two_e36 = e36 + e36;

    // Normalize into [1, 2) at 36 decimals: scaled = mantissa * 2^exponent.
    let mut exponent = scaled.bits() as i64 - E36_BITS;
    let mut mantissa = if exponent >= 0 {
        scaled >> (exponent as usize)
    } else {
        scaled << (exponent.unsigned_abs() as usize)
    };
    while mantissa >= two_e36 {
        mantissa = mantissa >> 1usize;
        exponent += 1;
    }
    while mantissa < e36 {
        mantissa = mantissa << 1usize;
        exponent -= 1;
    }

    // ln(m) = 2·atanh(t), t = (m - 1) / (m + 1) in [0, 1/3)
    let t = (mantissa - e36) * e36 / (mantissa + e36);
    let t_squared = t * t / e36;
    let mut sum = t;
    let mut term = t;
    let mut divisor = 3u64;
    loop {
        term = term * t_squared / e36;
        if term.is_zero() {
            break;
        }
        sum = sum + term / U256::from(divisor);
        divisor += 2;
    }

    let ln_mantissa = (sum.low_u128() * 2) as i128;
    Ok(ln_mantissa + exponent as i128 * LN2_E36 as i128)
}

/// ln(x) at 36 decimals for a WAD `x` in `(0, 1e40]`.
pub(crate) fn ln_e36(x: U256) -> Result<i128> {
    if x.is_zero() {
        return Err(ClmsrError::MathUnderflow);
    }
    if x > U256::exp10(MAX_LN_INPUT_EXP10) {
        return Err(ClmsrError::MathOverflow);
    }
    ln_scaled_e36(x * wad_u256())
}

/// ln(numerator / denominator) at 36 decimals. Both sides may use the full
/// 256-bit range; only their ratio matters.
pub(crate) fn ln_ratio_e36(numerator: U256, denominator: U256) -> Result<i128> {
    if denominator.is_zero() {
        return Err(ClmsrError::DivisionByZero);
    }
    ln_scaled_e36(numerator)?
        .checked_sub(ln_scaled_e36(denominator)?)
        .ok_or(ClmsrError::MathOverflow)
}

/// Natural log of a WAD, rounded to nearest.
pub fn wln(x: U256) -> Result<i128> {
    Ok(div_round_nearest(ln_e36(x)?, WAD as i128))
}

/// Parse a decimal (e.g. from configuration) into WAD units.
/// Digits beyond the 18th decimal are truncated.
pub fn wad_from_decimal(value: Decimal) -> Result<u128> {
    if value.is_sign_negative() {
        return Err(ClmsrError::MathUnderflow);
    }
    let mantissa = value.mantissa().unsigned_abs();
    let scale = value.scale();
    if scale <= 18 {
        mantissa
            .checked_mul(10u128.pow(18 - scale))
            .ok_or(ClmsrError::MathOverflow)
    } else {
        Ok(mantissa / 10u128.pow(scale - 18))
    }
}

/// Human-readable form of a WAD for logs and reports.
pub fn wad_to_decimal(value: u128) -> Decimal {
    i128::try_from(value)
        .ok()
        .and_then(|v| Decimal::try_from_i128_with_scale(v, 18).ok())
        .or_else(|| Decimal::from_u128(value / WAD))
        .unwrap_or(Decimal::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    const E_WAD_UP: u128 = 2_718_281_828_459_045_236;
    const E_INV_WAD_UP: u128 = 367_879_441_171_442_322;
    const LN2_WAD: i128 = 693_147_180_559_945_309;

    #[test]
    fn wmul_rounds_in_requested_direction() {
        // 1/3 * 1/3 is not representable exactly
        let third = WAD / 3;
        let down = wmul(third, third, Rounding::Down).unwrap();
        let up = wmul(third, third, Rounding::Up).unwrap();
        assert_eq!(up, down + 1);
        assert_eq!(wmul(2 * WAD, 3 * WAD, Rounding::Up).unwrap(), 6 * WAD);
    }

    #[test]
    fn wdiv_rounds_and_rejects_zero() {
        assert_eq!(wdiv(WAD, 3 * WAD, Rounding::Down).unwrap(), 333_333_333_333_333_333);
        assert_eq!(wdiv(WAD, 3 * WAD, Rounding::Up).unwrap(), 333_333_333_333_333_334);
        assert_eq!(wdiv(WAD, 0, Rounding::Down), Err(ClmsrError::DivisionByZero));
    }

    #[test]
    fn wmul_reports_overflow() {
        assert_eq!(wmul(u128::MAX, 2 * WAD, Rounding::Down), Err(ClmsrError::MathOverflow));
        assert_eq!(
            wmul_wide(U256::MAX, 2 * WAD, Rounding::Down),
            Err(ClmsrError::MathOverflow)
        );
    }

    #[test]
    fn wexp_known_values() {
        assert_eq!(wexp(0).unwrap(), WAD);
        assert_eq!(wexp(WAD as i128).unwrap(), E_WAD_UP);
        assert_eq!(wexp(-(WAD as i128)).unwrap(), E_INV_WAD_UP);
        assert!(wexp(LN2_WAD).unwrap().abs_diff(2 * WAD) <= 1);
    }

    #[test]
    fn wexp_rejects_out_of_domain() {
        assert_eq!(wexp(MAX_EXP_INPUT + 1), Err(ClmsrError::MathOverflow));
        assert_eq!(wexp(MIN_EXP_INPUT - 1), Err(ClmsrError::MathUnderflow));
        assert!(wexp(MAX_EXP_INPUT).is_ok());
        assert!(wexp(MIN_EXP_INPUT).unwrap() > 0);
    }

    #[test]
    fn wln_known_values() {
        assert_eq!(wln(U256::from(WAD)).unwrap(), 0);
        assert_eq!(wln(U256::from(2 * WAD)).unwrap(), LN2_WAD);
        assert_eq!(wln(U256::from(WAD / 2)).unwrap(), -LN2_WAD);
        assert_eq!(wln(U256::from(E_WAD_UP)).unwrap(), WAD as i128);
    }

    #[test]
    fn wln_rejects_zero_and_huge_inputs() {
        assert_eq!(wln(U256::zero()), Err(ClmsrError::MathUnderflow));
        assert_eq!(
            wln(U256::exp10(MAX_LN_INPUT_EXP10) + U256::one()),
            Err(ClmsrError::MathOverflow)
        );
        assert!(wln(U256::exp10(MAX_LN_INPUT_EXP10)).is_ok());
        // smallest positive WAD: ln(1e-18) = -41.44653167389282...
        let smallest = wln(U256::one()).unwrap();
        assert_eq!(smallest, -41_446_531_673_892_822_312);
    }

    #[test]
    fn exp_neg_known_values() {
        let e36 = WAD * WAD;
        assert_eq!(exp_neg_e36(U256::zero()).unwrap(), e36);
        // e^-1 = 0.367879441171442321595523770161460867|4...
        let inv_e = exp_neg_e36(U256::from(e36)).unwrap();
        assert!(inv_e.abs_diff(367_879_441_171_442_321_595_523_770_161_460_867) <= 100, "{inv_e}");
        assert_eq!(exp_neg_e36(U256::from(e36) * U256::from(200u64)).unwrap(), 1);
    }

    #[test]
    fn ln_ratio_depends_only_on_the_ratio() {
        let small = ln_ratio_e36(U256::from(3u64), U256::from(12u64)).unwrap();
        let huge = ln_ratio_e36(U256::from(3u64) << 200usize, U256::from(12u64) << 200usize).unwrap();
        assert_eq!(small, huge);
        assert_eq!(small, -2 * LN2_E36 as i128);
        assert_eq!(ln_ratio_e36(U256::MAX, U256::MAX).unwrap(), 0);
        assert_eq!(ln_ratio_e36(U256::one(), U256::zero()), Err(ClmsrError::DivisionByZero));
    }

    #[test]
    fn exp_e36_agrees_with_wexp() {
        for x in [-3 * WAD as i128, -1, 0, 7, WAD as i128 / 3, 12 * WAD as i128] {
            assert_eq!(exp_e36(x * WAD as i128).unwrap(), wexp(x).unwrap());
        }
        assert_eq!(exp_e36(MAX_EXP_INPUT * WAD as i128 + 1), Err(ClmsrError::MathOverflow));
    }

    #[test]
    fn decimal_round_trip() {
        let alpha = Decimal::from_str("1.5").unwrap();
        assert_eq!(wad_from_decimal(alpha).unwrap(), 1_500_000_000_000_000_000);
        assert_eq!(wad_to_decimal(1_500_000_000_000_000_000), alpha);
        assert!(wad_from_decimal(Decimal::from_str("-1").unwrap()).is_err());
    }

    proptest! {
        #[test]
        fn ln_inverts_exp(x in 0i128..MAX_EXP_INPUT) {
            // wexp rounds up, so the round trip may land one unit above x
            let back = wln(U256::from(wexp(x).unwrap())).unwrap();
            prop_assert!((0..=1).contains(&(back - x)), "x={} back={}", x, back);
        }

        #[test]
        fn exp_is_monotone(a in MIN_EXP_INPUT..MAX_EXP_INPUT, delta in 1i128..1_000_000_000_000) {
            let b = (a + delta).min(MAX_EXP_INPUT);
            prop_assert!(wexp(b).unwrap() >= wexp(a).unwrap());
        }

        #[test]
        fn exp_inverts_ln(units in 1u128..1_000_000u128) {
            let y = units * WAD / 7 + WAD;
            let back = wexp(wln(U256::from(y)).unwrap()).unwrap();
            // one unit of ln error scales by y
            let tolerance = y / WAD + 2;
            prop_assert!(back.abs_diff(y) <= tolerance, "y={} back={}", y, back);
        }
    }
}
