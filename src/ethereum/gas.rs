use ethers::types::U256;

/// Transforms a base gas price into the price actually offered. Policies
/// compose left to right, so a tip bounded by a hard cap is
/// `Composite([Tip, Limit])`.
pub trait GasPricePolicy: Send + Sync {
    fn calculate(&self, base: U256) -> U256;
}

/// Scales the price by a ratio, rounding down. Ratios are carried as
/// integer thousandths so the arithmetic stays exact in U256.
pub struct TipPolicy {
    numerator: U256,
}

impl TipPolicy {
    const SCALE: u64 = 1_000;

    pub fn from_ratio(ratio: f64) -> anyhow::Result<Self> {
        if !ratio.is_finite() || ratio < 0.0 {
            anyhow::bail!("gas tip ratio must be a non-negative number, got {ratio}");
        }
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let numerator = (ratio * Self::SCALE as f64).round() as u64;
        Ok(Self {
            numerator: U256::from(numerator),
        })
    }
}

impl GasPricePolicy for TipPolicy {
    fn calculate(&self, base: U256) -> U256 {
        base.saturating_mul(self.numerator) / U256::from(Self::SCALE)
    }
}

/// Hard ceiling on the offered price.
pub struct LimitPolicy {
    cap: U256,
}

impl LimitPolicy {
    pub fn new(cap: U256) -> Self {
        Self { cap }
    }
}

impl GasPricePolicy for LimitPolicy {
    fn calculate(&self, base: U256) -> U256 {
        base.min(self.cap)
    }
}

pub struct CompositePolicy {
    policies: Vec<Box<dyn GasPricePolicy>>,
}

impl CompositePolicy {
    pub fn new(policies: Vec<Box<dyn GasPricePolicy>>) -> Self {
        Self { policies }
    }
}

impl GasPricePolicy for CompositePolicy {
    fn calculate(&self, base: U256) -> U256 {
        self.policies
            .iter()
            .fold(base, |price, policy| policy.calculate(price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(100, 1.5, 150)]
    #[test_case(100, 1.0, 100)]
    #[test_case(3, 1.5, 4; "floors the scaled price")]
    #[test_case(0, 2.0, 0)]
    #[test_case(7, 0.333, 2; "thousandths resolution")]
    fn tip_scales_and_floors(base: u64, ratio: f64, expected: u64) {
        let policy = TipPolicy::from_ratio(ratio).unwrap();
        assert_eq!(policy.calculate(U256::from(base)), U256::from(expected));
    }

    #[test]
    fn tip_rejects_bad_ratios() {
        assert!(TipPolicy::from_ratio(-0.5).is_err());
        assert!(TipPolicy::from_ratio(f64::NAN).is_err());
        assert!(TipPolicy::from_ratio(f64::INFINITY).is_err());
    }

    #[test]
    fn limit_caps() {
        let policy = LimitPolicy::new(U256::from(100));
        assert_eq!(policy.calculate(U256::from(150)), U256::from(100));
        assert_eq!(policy.calculate(U256::from(50)), U256::from(50));
    }

    #[test_case(10, 1.5, 100, 15; "tip below cap")]
    #[test_case(100, 1.5, 100, 100; "cap binds")]
    #[test_case(67, 1.5, 100, 100; "tip lands exactly on cap")]
    #[test_case(0, 1.5, 100, 0)]
    fn composite_is_min_of_tipped_and_cap(base: u64, ratio: f64, cap: u64, expected: u64) {
        let policy = CompositePolicy::new(vec![
            Box::new(TipPolicy::from_ratio(ratio).unwrap()),
            Box::new(LimitPolicy::new(U256::from(cap))),
        ]);
        assert_eq!(policy.calculate(U256::from(base)), U256::from(expected));
    }

    #[test]
    fn empty_composite_is_identity() {
        let policy = CompositePolicy::new(Vec::new());
        assert_eq!(policy.calculate(U256::from(42)), U256::from(42));
    }
}
