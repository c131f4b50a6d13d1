use std::fmt;
use std::str::FromStr;

use ethers::types::U256;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// NCG carries two decimal places on chain, so amounts are held as integer
/// hundredths. Every conversion that could produce a finer value rounds
/// down; wrapped NCG uses 18 decimals, making one hundredth equal 10^16
/// base units.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NcgAmount(u64);

/// Base units of wNCG per hundredth of NCG.
const WEI_PER_HUNDREDTH: u64 = 10_000_000_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseAmountError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount digits: {0}")]
    Digits(String),

    #[error("amount finer than two decimal places: {0}")]
    TooPrecise(String),

    #[error("amount out of range: {0}")]
    Overflow(String),
}

impl NcgAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_hundredths(hundredths: u64) -> Self {
        Self(hundredths)
    }

    pub const fn hundredths(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(sum) => Some(Self(sum)),
            None => None,
        }
    }

    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(difference) => Some(Self(difference)),
            None => None,
        }
    }

    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiplies by `numerator / denominator`, rounding down.
    pub fn apply_ratio_floor(self, numerator: u64, denominator: u64) -> Self {
        let scaled = u128::from(self.0) * u128::from(numerator) / u128::from(denominator);
        // The ratio is at most 1, so the result fits back into hundredths.
        Self(scaled as u64)
    }

    /// The equivalent amount of wNCG base units (18 decimal places).
    pub fn to_wei(self) -> U256 {
        U256::from(self.0) * U256::from(WEI_PER_HUNDREDTH)
    }

    /// Converts wNCG base units down to whole hundredths of NCG, discarding
    /// anything finer. `None` when the value exceeds the representable
    /// range.
    pub fn from_wei_floor(wei: U256) -> Option<Self> {
        let hundredths = wei / U256::from(WEI_PER_HUNDREDTH);
        if hundredths > U256::from(u64::MAX) {
            return None;
        }
        Some(Self(hundredths.as_u64()))
    }
}

impl fmt::Display for NcgAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl fmt::Debug for NcgAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NcgAmount({self})")
    }
}

impl FromStr for NcgAmount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseAmountError::Empty);
        }
        let (integral, fraction) = match s.split_once('.') {
            Some((integral, fraction)) => (integral, fraction),
            None => (s, ""),
        };
        if integral.is_empty() || !integral.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError::Digits(s.to_owned()));
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError::Digits(s.to_owned()));
        }
        // Trailing zeroes past the second place are tolerated, significant
        // digits there are not.
        if fraction.len() > 2 && fraction[2..].bytes().any(|b| b != b'0') {
            return Err(ParseAmountError::TooPrecise(s.to_owned()));
        }
        let whole: u64 = integral
            .parse()
            .map_err(|_| ParseAmountError::Overflow(s.to_owned()))?;
        let mut hundredths = 0u64;
        for (position, digit) in fraction.bytes().take(2).enumerate() {
            hundredths += u64::from(digit - b'0') * if position == 0 { 10 } else { 1 };
        }
        whole
            .checked_mul(100)
            .and_then(|scaled| scaled.checked_add(hundredths))
            .map(Self)
            .ok_or_else(|| ParseAmountError::Overflow(s.to_owned()))
    }
}

impl Serialize for NcgAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NcgAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl de::Visitor<'_> for AmountVisitor {
            type Value = NcgAmount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an NCG amount with at most two decimal places")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }

            // Configuration sources parse bare numbers before handing
            // them over; the shortest float representation round-trips
            // two-decimal literals exactly.
            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                value.to_string().parse().map_err(de::Error::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                value.to_string().parse().map_err(de::Error::custom)
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                value.to_string().parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("0", 0)]
    #[test_case("10", 1_000)]
    #[test_case("10.5", 1_050)]
    #[test_case("150.00", 15_000)]
    #[test_case("0.01", 1)]
    #[test_case("1.230000", 123; "trailing zeroes tolerated")]
    fn parses(input: &str, hundredths: u64) {
        assert_eq!(input.parse(), Ok(NcgAmount::from_hundredths(hundredths)));
    }

    #[test_case(""; "empty")]
    #[test_case("1.234"; "three significant places")]
    #[test_case("-1"; "negative")]
    #[test_case("1.2.3"; "double point")]
    #[test_case("."; "bare point")]
    #[test_case("99999999999999999999"; "overflow")]
    fn rejects(input: &str) {
        assert!(input.parse::<NcgAmount>().is_err());
    }

    #[test]
    fn displays_two_places() {
        assert_eq!(NcgAmount::from_hundredths(1_000).to_string(), "10.00");
        assert_eq!(NcgAmount::from_hundredths(1).to_string(), "0.01");
        assert_eq!(NcgAmount::from_hundredths(12_345).to_string(), "123.45");
    }

    #[test]
    fn wei_round_trip_floors() {
        let ten = NcgAmount::from_hundredths(1_000);
        assert_eq!(ten.to_wei(), U256::exp10(19));
        assert_eq!(NcgAmount::from_wei_floor(ten.to_wei()), Some(ten));

        // 0.00999... NCG scales down to nothing.
        let dust = U256::from(9_999_999_999_999_999u64);
        assert_eq!(NcgAmount::from_wei_floor(dust), Some(NcgAmount::ZERO));

        assert_eq!(NcgAmount::from_wei_floor(U256::MAX), None);
    }

    #[test]
    fn ratio_floors() {
        // 1% of 99.99 NCG is 0.9999, which truncates to 0.99.
        let amount = NcgAmount::from_hundredths(9_999);
        assert_eq!(
            amount.apply_ratio_floor(100, 10_000),
            NcgAmount::from_hundredths(99)
        );
        assert_eq!(
            NcgAmount::ZERO.apply_ratio_floor(100, 10_000),
            NcgAmount::ZERO
        );
    }
}
