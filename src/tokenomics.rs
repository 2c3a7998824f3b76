//! Tokenomics Engine.
//!
//! Deterministic, pure pricing and fee-split rules that turn reported token
//! usage into MULE amounts. Every function here takes its configuration by
//! reference rather than reading a global — there is no ambient mutable
//! state anywhere in this crate (§9 design notes).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::classifier::Tier;

/// Conversion rates and fee policy, loaded once at startup and held as a
/// plain value thereafter (see [`crate::config::TokenomicsConfig`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokenomics {
    pub welcome_amount: Decimal,
    pub platform_fee_rate: Decimal,
    pub conversion_rates: ConversionRates,
}

/// Tokens-per-MULE, one rate per tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConversionRates {
    pub small: u64,
    pub medium: u64,
    pub large: u64,
    pub xl: u64,
}

impl ConversionRates {
    pub fn rate(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Small => self.small,
            Tier::Medium => self.medium,
            Tier::Large => self.large,
            Tier::Xl => self.xl,
        }
    }
}

impl Default for ConversionRates {
    fn default() -> Self {
        Self {
            small: 1_000_000,
            medium: 500_000,
            large: 250_000,
            xl: 125_000,
        }
    }
}

impl Default for Tokenomics {
    fn default() -> Self {
        Self {
            welcome_amount: Decimal::ONE,
            platform_fee_rate: Decimal::new(10, 2), // 0.10
            conversion_rates: ConversionRates::default(),
        }
    }
}

/// Round to 6 fractional digits, half-away-from-zero — the rounding rule
/// every MULE-denominated value in this crate goes through exactly once.
pub fn round6(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(6, RoundingStrategy::MidpointAwayFromZero)
}

/// `n` reported or estimated tokens at `tier` → MULE. Negative `n` (a
/// malformed report) clamps to zero rather than producing a negative price.
pub fn tokens_to_mules(n: i64, tier: Tier, cfg: &Tokenomics) -> Decimal {
    if n <= 0 {
        return Decimal::ZERO;
    }
    let rate = cfg.conversion_rates.rate(tier);
    round6(Decimal::from(n) / Decimal::from(rate))
}

/// Inverse of [`tokens_to_mules`]: how many tokens `m` MULE buys at `tier`.
pub fn mules_to_tokens(m: Decimal, tier: Tier, cfg: &Tokenomics) -> u64 {
    if m <= Decimal::ZERO {
        return 0;
    }
    let rate = cfg.conversion_rates.rate(tier);
    (m * Decimal::from(rate)).floor().try_into().unwrap_or(0)
}

/// What the serving provider is credited after the platform fee.
pub fn provider_earnings(m: Decimal, cfg: &Tokenomics) -> Decimal {
    round6(m * (Decimal::ONE - cfg.platform_fee_rate))
}

/// What the platform retains from a consumption amount.
pub fn platform_fee(m: Decimal, cfg: &Tokenomics) -> Decimal {
    round6(m * cfg.platform_fee_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Tokenomics {
        Tokenomics::default()
    }

    #[test]
    fn tokens_to_mules_medium_round_number() {
        assert_eq!(
            tokens_to_mules(500_000, Tier::Medium, &cfg()),
            Decimal::new(1_000_000, 6)
        );
    }

    #[test]
    fn tokens_to_mules_small_single_token() {
        assert_eq!(
            tokens_to_mules(1, Tier::Small, &cfg()),
            Decimal::new(1, 6)
        );
    }

    #[test]
    fn fee_and_earnings_split_one_mule() {
        let cfg = cfg();
        let one = Decimal::ONE;
        assert_eq!(platform_fee(one, &cfg), Decimal::new(100_000, 6));
        assert_eq!(provider_earnings(one, &cfg), Decimal::new(900_000, 6));
    }

    #[test]
    fn earnings_plus_fee_never_exceeds_amount() {
        let cfg = cfg();
        for n in [1_i64, 7, 12345, 999_999] {
            let m = tokens_to_mules(n, Tier::Large, &cfg);
            let total = provider_earnings(m, &cfg) + platform_fee(m, &cfg);
            assert!(total <= m);
        }
    }

    #[test]
    fn negative_or_zero_token_count_clamps_to_zero() {
        let cfg = cfg();
        assert_eq!(tokens_to_mules(-5, Tier::Medium, &cfg), Decimal::ZERO);
        assert_eq!(tokens_to_mules(0, Tier::Medium, &cfg), Decimal::ZERO);
    }

    #[test]
    fn round_trip_never_overestimates_tokens() {
        let cfg = cfg();
        for tier in [Tier::Small, Tier::Medium, Tier::Large, Tier::Xl] {
            for n in [0_i64, 1, 100, 999_999] {
                let m = tokens_to_mules(n, tier, &cfg);
                let back = mules_to_tokens(m, tier, &cfg);
                assert!(back <= n as u64);
            }
        }
    }

    #[test]
    fn round6_uses_midpoint_away_from_zero() {
        // 1/3 at 6dp is 0.333333; 2/3 is 0.666667 (rounds up, not banker's).
        let one_third = Decimal::ONE / Decimal::from(3);
        assert_eq!(round6(one_third), Decimal::new(333_333, 6));
        let two_thirds = Decimal::from(2) / Decimal::from(3);
        assert_eq!(round6(two_thirds), Decimal::new(666_667, 6));
    }
}
