//! 256-bit integer arithmetic for flow rates, balances, gas and time deltas.
//!
//! Everything money-related stays in `U256`/`I256`; floats never enter the
//! estimation or pricing paths.

use alloy::primitives::{I256, U256};

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Estimation sentinel for accounts that never run dry.
pub const NO_RISK: u64 = 0;

/// Latest timestamp chrono can represent (+262142-12-31T23:59:59Z).
///
/// Estimations further out than this are clamped and never come due.
pub const FAR_FUTURE: u64 = 8_210_266_876_799;

/// Safety margin applied to simulated gas usage (10%).
pub const GAS_LIMIT_MARGIN_BPS: u32 = 1_000;

/// `n / d` rounded half up. `None` when `d` is zero.
#[inline]
pub fn div_round_half_up(n: U256, d: U256) -> Option<U256> {
    if d.is_zero() {
        return None;
    }
    let q = n / d;
    let r = n % d;
    // r >= d - r  <=>  2r >= d, without overflowing
    if r >= d - r {
        Some(q + U256::from(1u8))
    } else {
        Some(q)
    }
}

/// Whole seconds until `balance` is consumed at `net_flow_rate`.
///
/// Signs are ignored; `None` on a zero rate.
#[inline]
pub fn seconds_until_zero(balance: I256, net_flow_rate: I256) -> Option<U256> {
    div_round_half_up(balance.unsigned_abs(), net_flow_rate.unsigned_abs())
}

/// Projected unix timestamp at which the account becomes insolvent.
///
/// - non-negative net flow: [`NO_RISK`]
/// - negative net flow and balance already negative: `now`
/// - otherwise `now + |balance| / |rate|`, clamped to [`FAR_FUTURE`]
pub fn insolvency_timestamp(now: u64, net_flow_rate: I256, balance: I256) -> u64 {
    if !net_flow_rate.is_negative() {
        return NO_RISK;
    }
    if balance.is_negative() {
        return now;
    }

    let Some(seconds) = seconds_until_zero(balance, net_flow_rate) else {
        return NO_RISK;
    };

    let at = U256::from(now).saturating_add(seconds);
    if at >= U256::from(FAR_FUTURE) {
        FAR_FUTURE
    } else {
        at.to::<u64>()
    }
}

/// Apply basis points increase.
/// Returns: value * (10000 + basis_points) / 10000
#[inline]
pub fn apply_basis_points_up(value: U256, basis_points: u32) -> U256 {
    let factor = BPS_DENOMINATOR + U256::from(basis_points);
    value.saturating_mul(factor) / BPS_DENOMINATOR
}

/// Simulated gas plus the safety margin.
#[inline]
pub fn gas_limit_with_margin(estimate: u64) -> u64 {
    apply_basis_points_up(U256::from(estimate), GAS_LIMIT_MARGIN_BPS).saturating_to::<u64>()
}

/// Gas price for the `attempt`-th try (1-based): `base × multiplier^(attempt−1)`.
///
/// The multiplier is in basis points (11000 = ×1.1). Returns the price and
/// whether it hit `cap`; a capped price is exactly `cap`.
pub fn gas_price_for_attempt(base: u128, multiplier_bps: u32, attempt: u32, cap: u128) -> (u128, bool) {
    let cap_u = U256::from(cap);
    let factor = U256::from(multiplier_bps);
    let mut price = U256::from(base);

    for _ in 1..attempt.max(1) {
        price = price.saturating_mul(factor) / BPS_DENOMINATOR;
        if price >= cap_u {
            break;
        }
    }

    if price >= cap_u {
        (cap, true)
    } else {
        (price.to::<u128>(), false)
    }
}

/// Convert gwei (config units) to wei.
#[inline]
pub fn gwei_to_wei(gwei: f64) -> u128 {
    (gwei.max(0.0) * 1e9) as u128
}

/// Multiplier (e.g. 1.1) to basis points (11000).
#[inline]
pub fn multiplier_to_bps(multiplier: f64) -> u32 {
    (multiplier.max(1.0) * 10_000.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(v: i64) -> I256 {
        I256::try_from(v).unwrap()
    }

    #[test]
    fn test_div_round_half_up() {
        assert_eq!(div_round_half_up(U256::from(10), U256::from(4)), Some(U256::from(3)));
        assert_eq!(div_round_half_up(U256::from(9), U256::from(4)), Some(U256::from(2)));
        assert_eq!(div_round_half_up(U256::from(100), U256::from(10)), Some(U256::from(10)));
        assert_eq!(div_round_half_up(U256::from(1), U256::ZERO), None);
        // No overflow near the top of the range
        assert_eq!(div_round_half_up(U256::MAX, U256::MAX), Some(U256::from(1)));
    }

    #[test]
    fn test_non_negative_flow_is_no_risk() {
        for balance in [i(-5), i(0), i(1_000_000)] {
            assert_eq!(insolvency_timestamp(1_000, i(0), balance), NO_RISK);
            assert_eq!(insolvency_timestamp(1_000, i(42), balance), NO_RISK);
        }
    }

    #[test]
    fn test_negative_balance_is_now() {
        assert_eq!(insolvency_timestamp(1_700_000_000, i(-1), i(-1)), 1_700_000_000);
    }

    #[test]
    fn test_exact_division() {
        assert_eq!(insolvency_timestamp(1_000, i(-100), i(10_000)), 1_100);
        assert_eq!(insolvency_timestamp(0, i(-1_000_000), i(60_000_000)), 60);
    }

    #[test]
    fn test_clamps_to_far_future() {
        let balance = I256::MAX;
        assert_eq!(insolvency_timestamp(1_000, i(-1), balance), FAR_FUTURE);
    }

    #[test]
    fn test_far_future_matches_chrono() {
        assert_eq!(
            chrono::DateTime::<chrono::Utc>::MAX_UTC.timestamp(),
            FAR_FUTURE as i64
        );
    }

    #[test]
    fn test_gas_limit_margin() {
        assert_eq!(gas_limit_with_margin(100_000), 110_000);
        assert_eq!(gas_limit_with_margin(0), 0);
    }

    #[test]
    fn test_gas_price_progression() {
        // 1 gwei, x1.5, cap 3 gwei
        let base = 1_000_000_000;
        let cap = 3_000_000_000;
        assert_eq!(gas_price_for_attempt(base, 15_000, 1, cap), (base, false));
        assert_eq!(gas_price_for_attempt(base, 15_000, 2, cap), (1_500_000_000, false));
        assert_eq!(gas_price_for_attempt(base, 15_000, 3, cap), (2_250_000_000, false));
        assert_eq!(gas_price_for_attempt(base, 15_000, 4, cap), (cap, true));
        assert_eq!(gas_price_for_attempt(base, 15_000, 400, cap), (cap, true));
    }

    #[test]
    fn test_base_above_cap_is_clamped() {
        assert_eq!(gas_price_for_attempt(10, 11_000, 1, 5), (5, true));
    }

    #[test]
    fn test_config_conversions() {
        assert_eq!(gwei_to_wei(1.5), 1_500_000_000);
        assert_eq!(multiplier_to_bps(1.1), 11_000);
        assert_eq!(multiplier_to_bps(0.5), 10_000);
    }
}
