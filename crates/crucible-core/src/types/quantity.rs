//! # Fixed-Point Quantities
//!
//! Weights are signed milligram counts and fractions are signed
//! parts-per-million. Neither type ever touches floating point: human
//! decimal text ("35.22") is parsed digit by digit and printed the same way.
//!
//! Serialization is format-aware. Human-readable formats (JSON, TOML) see
//! decimal strings such as `"35.220"` and may send strings or plain numbers;
//! binary formats (postcard on disk) see the raw integer.

use crate::CrucibleError;
use crate::primitives::{MILLIGRAMS_PER_GRAM, PPM};
use serde::de::{self, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;

const WEIGHT_DIGITS: u32 = 3;
const FRACTION_DIGITS: u32 = 6;

// =============================================================================
// WEIGHT
// =============================================================================

/// A weight in milligrams (three decimal places of grams).
///
/// Arithmetic saturates instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Weight(i64);

impl Weight {
    /// Zero grams.
    pub const ZERO: Weight = Weight(0);

    /// Create a weight from a milligram count.
    #[must_use]
    pub const fn from_milligrams(mg: i64) -> Self {
        Self(mg)
    }

    /// Create a weight from whole grams.
    #[must_use]
    pub const fn from_grams(grams: i64) -> Self {
        Self(grams.saturating_mul(MILLIGRAMS_PER_GRAM))
    }

    /// Get the raw milligram count.
    #[must_use]
    pub const fn milligrams(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.saturating_abs())
    }

    /// Multiply by a fixed-point factor, rounding half away from zero to the
    /// nearest milligram.
    #[must_use]
    pub fn scale(self, factor: Fraction) -> Self {
        let scaled = div_round(i128::from(self.0) * i128::from(factor.ppm()), i128::from(PPM));
        Self(clamp_i64(scaled))
    }

    /// Take `permille` thousandths of this weight, truncating toward zero.
    #[must_use]
    pub const fn permille(self, permille: i64) -> Self {
        Self(self.0.saturating_mul(permille) / 1000)
    }
}

impl Add for Weight {
    type Output = Weight;

    fn add(self, rhs: Weight) -> Weight {
        Weight(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Weight {
    fn add_assign(&mut self, rhs: Weight) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Weight {
    type Output = Weight;

    fn sub(self, rhs: Weight) -> Weight {
        Weight(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Weight {
    type Output = Weight;

    fn neg(self) -> Weight {
        Weight(self.0.saturating_neg())
    }
}

impl std::iter::Sum for Weight {
    fn sum<I: Iterator<Item = Weight>>(iter: I) -> Weight {
        iter.fold(Weight::ZERO, Add::add)
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed(f, self.0, WEIGHT_DIGITS)
    }
}

impl FromStr for Weight {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, WEIGHT_DIGITS).map(Self).ok_or_else(|| {
            CrucibleError::ValidationError(format!(
                "invalid weight '{}': expected grams with at most 3 decimal places",
                s.trim()
            ))
        })
    }
}

// =============================================================================
// FRACTION
// =============================================================================

/// A dimensionless factor in parts per million.
///
/// Used for fine-gold fractions (`0.587000`) and for wax-to-metal density
/// factors (`13.250000`), so values above one are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fraction(i64);

impl Fraction {
    /// Exactly one.
    pub const ONE: Fraction = Fraction(PPM);

    #[must_use]
    pub const fn from_ppm(ppm: i64) -> Self {
        Self(ppm)
    }

    #[must_use]
    pub const fn from_permille(permille: i64) -> Self {
        Self(permille.saturating_mul(1000))
    }

    #[must_use]
    pub const fn ppm(self) -> i64 {
        self.0
    }

    /// `part / whole`, rounded to the nearest ppm. `None` when `whole` is zero.
    #[must_use]
    pub fn ratio(part: Weight, whole: Weight) -> Option<Self> {
        if whole.is_zero() {
            return None;
        }
        let value = div_round(
            i128::from(part.milligrams()) * i128::from(PPM),
            i128::from(whole.milligrams()),
        );
        Some(Self(clamp_i64(value)))
    }

    /// Take `permille` thousandths of this fraction, truncating toward zero.
    #[must_use]
    pub const fn permille(self, permille: i64) -> Self {
        Self(self.0.saturating_mul(permille) / 1000)
    }
}

impl Add for Fraction {
    type Output = Fraction;

    fn add(self, rhs: Fraction) -> Fraction {
        Fraction(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Fraction {
    type Output = Fraction;

    fn sub(self, rhs: Fraction) -> Fraction {
        Fraction(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fixed(f, self.0, FRACTION_DIGITS)
    }
}

impl FromStr for Fraction {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, FRACTION_DIGITS).map(Self).ok_or_else(|| {
            CrucibleError::ValidationError(format!("invalid fraction '{}'", s.trim()))
        })
    }
}

// =============================================================================
// SERDE
// =============================================================================

macro_rules! fixed_point_serde {
    ($ty:ident, $digits:expr, $what:literal) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.collect_str(self)
                } else {
                    serializer.serialize_i64(self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    deserializer
                        .deserialize_any(FixedPointVisitor {
                            digits: $digits,
                            what: $what,
                        })
                        .map(Self)
                } else {
                    i64::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

fixed_point_serde!(Weight, WEIGHT_DIGITS, "weight");
fixed_point_serde!(Fraction, FRACTION_DIGITS, "fraction");

/// Accepts decimal strings and JSON numbers for a fixed-point value.
struct FixedPointVisitor {
    digits: u32,
    what: &'static str,
}

impl<'de> Visitor<'de> for FixedPointVisitor {
    type Value = i64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a decimal {} with at most {} fractional digits",
            self.what, self.digits
        )
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
        parse_fixed(v, self.digits).ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
        v.checked_mul(10i64.pow(self.digits))
            .ok_or_else(|| E::invalid_value(Unexpected::Signed(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
        i64::try_from(v)
            .ok()
            .and_then(|whole| whole.checked_mul(10i64.pow(self.digits)))
            .ok_or_else(|| E::invalid_value(Unexpected::Unsigned(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
        // Shortest round-trip text of the number, then exact decimal parsing.
        let text = v.to_string();
        parse_fixed(&text, self.digits).ok_or_else(|| E::invalid_value(Unexpected::Float(v), &self))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Parse `[+-]digits[.digits]` into an integer scaled by `10^digits`.
///
/// Returns `None` for empty input, stray characters, too many fractional
/// digits or overflow.
fn parse_fixed(text: &str, digits: u32) -> Option<i64> {
    let text = text.trim();
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (whole, frac) = body.split_once('.').unwrap_or((body, ""));

    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if frac.len() > digits as usize {
        return None;
    }

    let whole_value: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_value: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    for _ in frac.len()..digits as usize {
        frac_value *= 10;
    }

    let magnitude = whole_value
        .checked_mul(10i64.pow(digits))?
        .checked_add(frac_value)?;
    Some(if negative { -magnitude } else { magnitude })
}

fn write_fixed(f: &mut fmt::Formatter<'_>, value: i64, digits: u32) -> fmt::Result {
    let scale = 10u64.pow(digits);
    let magnitude = value.unsigned_abs();
    let sign = if value < 0 { "-" } else { "" };
    write!(
        f,
        "{}{}.{:0width$}",
        sign,
        magnitude / scale,
        magnitude % scale,
        width = digits as usize
    )
}

/// Integer division rounding half away from zero. `denominator` must be non-zero.
fn div_round(numerator: i128, denominator: i128) -> i128 {
    let (numerator, denominator) = if denominator < 0 {
        (-numerator, -denominator)
    } else {
        (numerator, denominator)
    };
    let half = denominator / 2;
    if numerator >= 0 {
        (numerator + half) / denominator
    } else {
        (numerator - half) / denominator
    }
}

fn clamp_i64(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_parses_decimal_grams() {
        assert_eq!("35.22".parse::<Weight>().expect("parse").milligrams(), 35_220);
        assert_eq!("100".parse::<Weight>().expect("parse").milligrams(), 100_000);
        assert_eq!("0.001".parse::<Weight>().expect("parse").milligrams(), 1);
        assert_eq!(".5".parse::<Weight>().expect("parse").milligrams(), 500);
        assert_eq!("-3".parse::<Weight>().expect("parse").milligrams(), -3_000);
        assert_eq!(" +7.1 ".parse::<Weight>().expect("parse").milligrams(), 7_100);
    }

    #[test]
    fn weight_rejects_malformed_text() {
        for bad in ["", ".", "-", "1.2345", "1,5", "abc", "1e3", "--1"] {
            assert!(
                matches!(bad.parse::<Weight>(), Err(CrucibleError::ValidationError(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn weight_display_is_three_decimals() {
        assert_eq!(Weight::from_milligrams(35_220).to_string(), "35.220");
        assert_eq!(Weight::from_milligrams(-3_000).to_string(), "-3.000");
        assert_eq!(Weight::from_milligrams(5).to_string(), "0.005");
        assert_eq!(Weight::from_milligrams(-5).to_string(), "-0.005");
    }

    #[test]
    fn weight_arithmetic_saturates() {
        let max = Weight::from_milligrams(i64::MAX);
        assert_eq!(max + Weight::from_milligrams(1), max);
        assert_eq!(-Weight::from_milligrams(i64::MIN), max);
    }

    #[test]
    fn weight_scale_rounds_half_away_from_zero() {
        let factor = Fraction::from_ppm(13_250_000);
        // 7.555 g wax * 13.25 = 100.10375 g
        let scaled = Weight::from_milligrams(7_555).scale(factor);
        assert_eq!(scaled.milligrams(), 100_104);
        let half = Weight::from_milligrams(1).scale(Fraction::from_ppm(500_000));
        assert_eq!(half.milligrams(), 1);
        let neg_half = Weight::from_milligrams(-1).scale(Fraction::from_ppm(500_000));
        assert_eq!(neg_half.milligrams(), -1);
    }

    #[test]
    fn fraction_ratio() {
        let f = Fraction::ratio(Weight::from_grams(50), Weight::from_grams(100)).expect("ratio");
        assert_eq!(f.ppm(), 500_000);
        assert_eq!(f.to_string(), "0.500000");
        assert!(Fraction::ratio(Weight::from_grams(1), Weight::ZERO).is_none());
    }

    #[test]
    fn permille_truncates() {
        assert_eq!(Weight::from_grams(100).permille(50), Weight::from_grams(5));
        assert_eq!(Fraction::from_permille(587).permille(50).ppm(), 29_350);
    }

    #[test]
    fn postcard_uses_raw_integers() {
        let bytes = postcard::to_allocvec(&Weight::from_milligrams(35_220)).expect("encode");
        let back: Weight = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(back, Weight::from_milligrams(35_220));
    }
}
