use std::collections::HashSet;

use ethers::types::Address;

use crate::config::ExchangeConfig;
use crate::nine::NcgAmount;

/// Immutable exchange rules applied to every deposit: banned senders, the
/// exchangeable range, and the fee. The fee ratio is converted to basis
/// points once so per-event arithmetic stays in integers.
pub struct ExchangePolicy {
    banned: HashSet<Address>,
    minimum: NcgAmount,
    maximum: NcgAmount,
    fee_basis_points: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampOutcome {
    BelowMinimum,
    Within(NcgAmount),
    AboveMaximum {
        capped: NcgAmount,
        excess: NcgAmount,
    },
}

impl ExchangePolicy {
    const BASIS_POINTS: u64 = 10_000;

    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let ratio = config.fee_ratio;
        if !ratio.is_finite() || !(0.0..1.0).contains(&ratio) {
            anyhow::bail!("exchange fee ratio must lie in [0, 1), got {ratio}");
        }
        if config.minimum_amount > config.maximum_amount {
            anyhow::bail!(
                "minimum exchangeable amount {} exceeds maximum {}",
                config.minimum_amount,
                config.maximum_amount
            );
        }
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let fee_basis_points = (ratio * Self::BASIS_POINTS as f64).round() as u64;
        Ok(Self {
            banned: config.banned_addresses.iter().copied().collect(),
            minimum: config.minimum_amount,
            maximum: config.maximum_amount,
            fee_basis_points,
        })
    }

    pub fn is_banned(&self, address: &Address) -> bool {
        self.banned.contains(address)
    }

    pub fn clamp(&self, amount: NcgAmount) -> ClampOutcome {
        if amount < self.minimum {
            ClampOutcome::BelowMinimum
        } else if amount > self.maximum {
            ClampOutcome::AboveMaximum {
                capped: self.maximum,
                excess: amount.saturating_sub(self.maximum),
            }
        } else {
            ClampOutcome::Within(amount)
        }
    }

    pub fn fee(&self, amount: NcgAmount) -> NcgAmount {
        amount.apply_ratio_floor(self.fee_basis_points, Self::BASIS_POINTS)
    }

    pub fn minimum(&self) -> NcgAmount {
        self.minimum
    }

    pub fn maximum(&self) -> NcgAmount {
        self.maximum
    }
}
