//! # Metal Catalogue
//!
//! The closed set of metals the floor casts, and the formula tables keyed
//! on them. Every property is looked up by variant; nothing is inferred
//! from the metal's name.
//!
//! | metal | density | fine  | cast °C | oven °C | quench min |
//! |-------|---------|-------|---------|---------|------------|
//! | 10W   | 11      | 0.417 | 1100    | 1100    | 15         |
//! | 10Y   | 11      | 0.417 | 1100    | 1100    | 15         |
//! | 10R   | 11      | 0.417 | 1100    | 1100    | 8          |
//! | 14W   | 13.25   | 0.587 | 1050    | 1150    | 15         |
//! | 14Y   | 13.25   | 0.587 | 1030    | 1050    | 15         |
//! | 14R   | 13.25   | 0.587 | 1100    | 1050    | 7          |
//! | 18W   | 16.5    | 0.752 | 1050    | 1050    | 15         |
//! | 18Y   | 16.5    | 0.752 | 1060    | 1050    | 15         |
//! | 18R   | 16.5    | 0.752 | 1100    | 1020    | 3          |
//! | Pt    | 21      | pure  | 1000    | 1000    | 8          |
//! | Ag    | 11      | pure  | 980     | 980     | 15         |

use crate::composition::CompositionRule;
use crate::types::{CrucibleError, Fraction, Weight};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A castable metal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metal {
    #[serde(rename = "10W")]
    Gold10White = 0,
    #[serde(rename = "10Y")]
    Gold10Yellow = 1,
    #[serde(rename = "10R")]
    Gold10Rose = 2,
    #[serde(rename = "14W")]
    Gold14White = 3,
    #[serde(rename = "14Y")]
    Gold14Yellow = 4,
    #[serde(rename = "14R")]
    Gold14Rose = 5,
    #[serde(rename = "18W")]
    Gold18White = 6,
    #[serde(rename = "18Y")]
    Gold18Yellow = 7,
    #[serde(rename = "18R")]
    Gold18Rose = 8,
    Platinum = 9,
    Silver = 10,
}

/// Karat family of a gold alloy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Karat {
    K10,
    K14,
    K18,
}

impl Metal {
    /// The full catalogue, in display order.
    pub const ALL: [Metal; 11] = [
        Metal::Gold10White,
        Metal::Gold10Yellow,
        Metal::Gold10Rose,
        Metal::Gold14White,
        Metal::Gold14Yellow,
        Metal::Gold14Rose,
        Metal::Gold18White,
        Metal::Gold18Yellow,
        Metal::Gold18Rose,
        Metal::Platinum,
        Metal::Silver,
    ];

    /// Canonical code, as shown to operators.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Gold10White => "10W",
            Self::Gold10Yellow => "10Y",
            Self::Gold10Rose => "10R",
            Self::Gold14White => "14W",
            Self::Gold14Yellow => "14Y",
            Self::Gold14Rose => "14R",
            Self::Gold18White => "18W",
            Self::Gold18Yellow => "18Y",
            Self::Gold18Rose => "18R",
            Self::Platinum => "Platinum",
            Self::Silver => "Silver",
        }
    }

    /// Stable one-byte key used by the storage layer.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_ordinal(ordinal: u8) -> Option<Metal> {
        Self::ALL.get(ordinal as usize).copied()
    }

    const fn karat(self) -> Option<Karat> {
        match self {
            Self::Gold10White | Self::Gold10Yellow | Self::Gold10Rose => Some(Karat::K10),
            Self::Gold14White | Self::Gold14Yellow | Self::Gold14Rose => Some(Karat::K14),
            Self::Gold18White | Self::Gold18Yellow | Self::Gold18Rose => Some(Karat::K18),
            Self::Platinum | Self::Silver => None,
        }
    }

    /// Wax-to-metal density factor.
    #[must_use]
    pub const fn density_factor(self) -> Fraction {
        match self {
            Self::Platinum => Fraction::from_ppm(21_000_000),
            Self::Silver => Fraction::from_ppm(11_000_000),
            _ => match self.karat() {
                Some(Karat::K14) => Fraction::from_ppm(13_250_000),
                Some(Karat::K18) => Fraction::from_ppm(16_500_000),
                _ => Fraction::from_ppm(11_000_000),
            },
        }
    }

    /// Expected share of fine gold in the fresh portion, for gold alloys.
    #[must_use]
    pub const fn fine_fraction(self) -> Option<Fraction> {
        match self.karat() {
            Some(Karat::K10) => Some(Fraction::from_ppm(417_000)),
            Some(Karat::K14) => Some(Fraction::from_ppm(587_000)),
            Some(Karat::K18) => Some(Fraction::from_ppm(752_000)),
            None => None,
        }
    }

    /// The rule Metal-Prep and Supply compositions are checked against.
    #[must_use]
    pub const fn composition_rule(self) -> CompositionRule {
        match self.fine_fraction() {
            Some(fraction) => CompositionRule::GoldFraction(fraction),
            None => CompositionRule::PureOnly,
        }
    }

    /// Pour temperature in °C.
    #[must_use]
    pub const fn casting_temperature(self) -> u16 {
        match self {
            Self::Gold10White | Self::Gold10Yellow | Self::Gold10Rose => 1100,
            Self::Gold14White => 1050,
            Self::Gold14Yellow => 1030,
            Self::Gold14Rose => 1100,
            Self::Gold18White => 1050,
            Self::Gold18Yellow => 1060,
            Self::Gold18Rose => 1100,
            Self::Platinum => 1000,
            Self::Silver => 980,
        }
    }

    /// Flask oven temperature in °C.
    #[must_use]
    pub const fn oven_temperature(self) -> u16 {
        match self {
            Self::Gold10White | Self::Gold10Yellow | Self::Gold10Rose => 1100,
            Self::Gold14White => 1150,
            Self::Gold14Yellow | Self::Gold14Rose => 1050,
            Self::Gold18White | Self::Gold18Yellow => 1050,
            Self::Gold18Rose => 1020,
            Self::Platinum => 1000,
            Self::Silver => 980,
        }
    }

    /// Minutes a flask must cool before it may be quenched.
    #[must_use]
    pub const fn quench_minutes(self) -> u32 {
        match self {
            Self::Gold10Rose | Self::Platinum => 8,
            Self::Gold14Rose => 7,
            Self::Gold18Rose => 3,
            _ => 15,
        }
    }

    /// Metal needed to cast a tree of the given net wax weight.
    #[must_use]
    pub fn estimated_metal_weight(self, tree_weight: Weight) -> Weight {
        tree_weight.scale(self.density_factor())
    }
}

/// When a flask completed at `completed` may be quenched.
#[must_use]
pub fn ready_at(completed: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
    completed + Duration::minutes(i64::from(minutes))
}

impl fmt::Display for Metal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Metal {
    type Err = CrucibleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|metal| metal.code().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CrucibleError::ValidationError(format!("unknown metal '{wanted}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ordinals_round_trip() {
        for metal in Metal::ALL {
            assert_eq!(Metal::from_ordinal(metal.ordinal()), Some(metal));
        }
        assert_eq!(Metal::from_ordinal(11), None);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("14y".parse::<Metal>().ok(), Some(Metal::Gold14Yellow));
        assert_eq!(" platinum ".parse::<Metal>().ok(), Some(Metal::Platinum));
        assert!(matches!(
            "14K".parse::<Metal>(),
            Err(CrucibleError::ValidationError(_))
        ));
        // no substring guessing
        assert!("Plat".parse::<Metal>().is_err());
    }

    #[test]
    fn estimated_weight_uses_density() {
        let net = Weight::from_grams(10);
        assert_eq!(Metal::Gold10Yellow.estimated_metal_weight(net), Weight::from_grams(110));
        assert_eq!(
            Metal::Gold14White.estimated_metal_weight(net),
            Weight::from_milligrams(132_500)
        );
        assert_eq!(Metal::Gold18Rose.estimated_metal_weight(net), Weight::from_grams(165));
        assert_eq!(Metal::Platinum.estimated_metal_weight(net), Weight::from_grams(210));
        assert_eq!(Metal::Silver.estimated_metal_weight(net), Weight::from_grams(110));
    }

    #[test]
    fn temperature_tables() {
        assert_eq!(Metal::Gold14Yellow.casting_temperature(), 1030);
        assert_eq!(Metal::Gold14White.oven_temperature(), 1150);
        assert_eq!(Metal::Gold18Rose.oven_temperature(), 1020);
        assert_eq!(Metal::Silver.casting_temperature(), 980);
    }

    #[test]
    fn quench_table() {
        assert_eq!(Metal::Gold18Rose.quench_minutes(), 3);
        assert_eq!(Metal::Gold14Rose.quench_minutes(), 7);
        assert_eq!(Metal::Gold10Rose.quench_minutes(), 8);
        assert_eq!(Metal::Gold14Yellow.quench_minutes(), 15);
    }

    #[test]
    fn pure_metals_have_no_fine_fraction() {
        assert_eq!(Metal::Platinum.composition_rule(), CompositionRule::PureOnly);
        assert_eq!(
            Metal::Gold14Yellow.composition_rule(),
            CompositionRule::GoldFraction(Fraction::from_ppm(587_000))
        );
    }

    #[test]
    fn ready_at_adds_minutes() {
        let completed = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("time");
        let ready = ready_at(completed, Metal::Gold14Yellow.quench_minutes());
        assert_eq!(ready, Utc.with_ymd_and_hms(2026, 3, 1, 9, 15, 0).single().expect("time"));
    }
}
