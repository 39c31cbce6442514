//! # Composition Validator
//!
//! Pure tolerance rules that gate Metal-Prep, Supply, Cutting and
//! Reconciliation. No I/O, no state.
//!
//! Every band is ±`TOLERANCE_PERMILLE` of its reference, inclusive, and is
//! evaluated in `i128` so there is no rounding at the boundary:
//! `|actual - reference| * 1000 <= |reference| * 50`. The `low`/`high`
//! reported on failure are the outermost values that pass.

use crate::primitives::{MAX_WEIGHT_MG, PPM, PURE_ONLY_ALLOY_EPSILON_MG, TOLERANCE_PERMILLE};
use crate::types::{CrucibleError, CutLosses, Fraction, Weight};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// RULES AND INPUTS
// =============================================================================

/// What a metal's fresh portion must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionRule {
    /// No alloy may be added (platinum, silver).
    PureOnly,
    /// Fine gold must make up this share of `fine + alloy`.
    GoldFraction(Fraction),
    /// Only the total is checked.
    Unconstrained,
}

/// A planned or supplied metal mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    pub scrap: Weight,
    pub fine: Weight,
    pub alloy: Weight,
}

impl Composition {
    #[must_use]
    pub fn new(scrap: Weight, fine: Weight, alloy: Weight) -> Self {
        Self { scrap, fine, alloy }
    }

    /// The freshly added portion, `fine + alloy`.
    #[must_use]
    pub fn fresh(&self) -> Weight {
        self.fine + self.alloy
    }

    #[must_use]
    pub fn total(&self) -> Weight {
        self.scrap + self.fresh()
    }

    /// Reject negative or absurdly large components.
    pub fn ensure_in_range(&self) -> Result<(), CrucibleError> {
        require_weight("scrap", self.scrap)?;
        require_weight("fine", self.fine)?;
        require_weight("alloy", self.alloy)?;
        Ok(())
    }
}

// =============================================================================
// CHECK REPORTING
// =============================================================================

/// Which band a `ToleranceExceeded` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceCheck {
    SupplyTotal,
    FineFraction,
    PureAlloy,
    BeforeCut,
    AfterCut,
}

impl fmt::Display for ToleranceCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SupplyTotal => "supply total",
            Self::FineFraction => "fine fraction",
            Self::PureAlloy => "alloy in pure metal",
            Self::BeforeCut => "before-cut weight",
            Self::AfterCut => "after-cut weight",
        })
    }
}

/// A value reported in a tolerance error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Weight(Weight),
    Fraction(Fraction),
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weight(w) => write!(f, "{w} g"),
            Self::Fraction(x) => write!(f, "{x}"),
        }
    }
}

// =============================================================================
// BAND ARITHMETIC
// =============================================================================

/// Largest accepted distance from `reference`: `floor(|reference| * 5 %)`.
///
/// Distances are whole units, so `|d| <= margin` is the same test as
/// `|d| * 1000 <= |reference| * 50`. Reported bands use this value too.
#[must_use]
pub fn band_margin(reference: i128) -> i128 {
    reference.abs() * i128::from(TOLERANCE_PERMILLE) / 1000
}

/// True when `actual` lies within ±5 % of `reference`, inclusive.
#[must_use]
pub fn within_band(actual: i64, reference: i64) -> bool {
    (i128::from(actual) - i128::from(reference)).abs() <= band_margin(i128::from(reference))
}

fn narrow(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

/// Check a weight against its reference.
pub fn check_weight(
    check: ToleranceCheck,
    actual: Weight,
    reference: Weight,
) -> Result<(), CrucibleError> {
    if within_band(actual.milligrams(), reference.milligrams()) {
        return Ok(());
    }
    let margin = Weight::from_milligrams(narrow(band_margin(i128::from(reference.milligrams()))));
    Err(CrucibleError::ToleranceExceeded {
        check,
        computed: Quantity::Weight(actual),
        expected: Quantity::Weight(reference),
        low: Quantity::Weight(reference - margin),
        high: Quantity::Weight(reference + margin),
    })
}

/// Check `fine / (fine + alloy)` against the expected fraction, relative ±5 %.
///
/// An empty fresh portion (all scrap) has nothing to check and passes.
/// On failure the computed ratio is rounded away from `expected`, so it
/// never prints inside the reported band.
pub fn check_fine_fraction(
    expected: Fraction,
    fine: Weight,
    alloy: Weight,
) -> Result<(), CrucibleError> {
    let fresh = fine + alloy;
    if fresh.is_zero() {
        return Ok(());
    }
    // fine/fresh vs f  <=>  fine*PPM vs f*fresh, both scaled by PPM*mg
    let actual = i128::from(fine.milligrams()) * i128::from(PPM);
    let whole = i128::from(fresh.milligrams());
    let reference = i128::from(expected.ppm()) * whole;
    if (actual - reference).abs() <= band_margin(reference) {
        return Ok(());
    }
    let (quotient, remainder) = (actual.div_euclid(whole), actual.rem_euclid(whole));
    let computed = if actual > reference && remainder != 0 {
        quotient + 1
    } else {
        quotient
    };
    let margin = Fraction::from_ppm(narrow(band_margin(i128::from(expected.ppm()))));
    Err(CrucibleError::ToleranceExceeded {
        check: ToleranceCheck::FineFraction,
        computed: Quantity::Fraction(Fraction::from_ppm(narrow(computed))),
        expected: Quantity::Fraction(expected),
        low: Quantity::Fraction(expected - margin),
        high: Quantity::Fraction(expected + margin),
    })
}

fn check_pure(alloy: Weight) -> Result<(), CrucibleError> {
    let limit = Weight::from_milligrams(PURE_ONLY_ALLOY_EPSILON_MG);
    if alloy <= limit {
        return Ok(());
    }
    Err(CrucibleError::ToleranceExceeded {
        check: ToleranceCheck::PureAlloy,
        computed: Quantity::Weight(alloy),
        expected: Quantity::Weight(Weight::ZERO),
        low: Quantity::Weight(Weight::ZERO),
        high: Quantity::Weight(limit),
    })
}

// =============================================================================
// STAGE GATES
// =============================================================================

/// Validate a Metal-Prep plan or a Supply declaration.
///
/// The total is checked first against `required`, then the metal's rule is
/// applied to the fresh portion.
pub fn validate_composition(
    rule: CompositionRule,
    composition: &Composition,
    required: Weight,
) -> Result<(), CrucibleError> {
    composition.ensure_in_range()?;
    check_weight(ToleranceCheck::SupplyTotal, composition.total(), required)?;
    match rule {
        CompositionRule::PureOnly => check_pure(composition.alloy),
        CompositionRule::GoldFraction(expected) => {
            check_fine_fraction(expected, composition.fine, composition.alloy)
        }
        CompositionRule::Unconstrained => Ok(()),
    }
}

/// Validate cut weights and derive the losses.
///
/// `before_cut` is checked against `supplied` and `after_cast + after_scrap`
/// against `before_cut`. A zero reference skips its check.
pub fn validate_cut(
    supplied: Weight,
    before_cut: Weight,
    after_cast: Weight,
    after_scrap: Weight,
) -> Result<CutLosses, CrucibleError> {
    require_weight("before_cut", before_cut)?;
    require_weight("after_cast", after_cast)?;
    require_weight("after_scrap", after_scrap)?;

    if !supplied.is_zero() {
        check_weight(ToleranceCheck::BeforeCut, before_cut, supplied)?;
    }
    if !before_cut.is_zero() {
        check_weight(ToleranceCheck::AfterCut, after_cast + after_scrap, before_cut)?;
    }
    Ok(CutLosses::compute(supplied, before_cut, after_cast, after_scrap))
}

/// Reject a negative or out-of-range operator-entered weight.
pub fn require_weight(field: &str, weight: Weight) -> Result<Weight, CrucibleError> {
    if weight.is_negative() {
        return Err(CrucibleError::ValidationError(format!(
            "{field} must not be negative (got {weight})"
        )));
    }
    if weight.milligrams() > MAX_WEIGHT_MG {
        return Err(CrucibleError::ValidationError(format!(
            "{field} is out of range (got {weight})"
        )));
    }
    Ok(weight)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metal::Metal;

    fn g(text: &str) -> Weight {
        text.parse().expect("weight literal")
    }

    fn mix(scrap: &str, fine: &str, alloy: &str) -> Composition {
        Composition::new(g(scrap), g(fine), g(alloy))
    }

    #[test]
    fn fourteen_yellow_exact_mix_passes() {
        let rule = Metal::Gold14Yellow.composition_rule();
        let result = validate_composition(rule, &mix("40", "35.22", "24.78"), g("100"));
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn half_and_half_fails_fine_fraction() {
        let rule = Metal::Gold14Yellow.composition_rule();
        let err = validate_composition(rule, &mix("0", "50", "50"), g("100"))
            .expect_err("ratio must fail");
        match err {
            CrucibleError::ToleranceExceeded {
                check, computed, ..
            } => {
                assert_eq!(check, ToleranceCheck::FineFraction);
                assert_eq!(computed, Quantity::Fraction(Fraction::from_ppm(500_000)));
            }
            other => unreachable!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn band_is_inclusive_and_symmetric() {
        assert!(within_band(105_000, 100_000));
        assert!(within_band(95_000, 100_000));
        assert!(!within_band(105_001, 100_000));
        assert!(!within_band(94_999, 100_000));
    }

    #[test]
    fn total_boundary() {
        let rule = CompositionRule::Unconstrained;
        assert!(validate_composition(rule, &mix("105", "0", "0"), g("100")).is_ok());
        assert!(validate_composition(rule, &mix("95", "0", "0"), g("100")).is_ok());
        assert!(validate_composition(rule, &mix("105.001", "0", "0"), g("100")).is_err());
        assert!(validate_composition(rule, &mix("94.999", "0", "0"), g("100")).is_err());
    }

    #[test]
    fn fine_fraction_boundary_is_relative() {
        // expected 0.5 -> band 0.475..=0.525
        let f = Fraction::from_ppm(500_000);
        assert!(check_fine_fraction(f, g("52.5"), g("47.5")).is_ok());
        assert!(check_fine_fraction(f, g("47.5"), g("52.5")).is_ok());
        assert!(check_fine_fraction(f, g("52.501"), g("47.499")).is_err());
    }

    #[test]
    fn reported_weight_band_is_the_accepted_band() {
        let reference = g("100.007");
        let err = check_weight(ToleranceCheck::SupplyTotal, g("200"), reference)
            .expect_err("far outside");
        let CrucibleError::ToleranceExceeded {
            low: Quantity::Weight(low),
            high: Quantity::Weight(high),
            ..
        } = err
        else {
            unreachable!("expected a tolerance error");
        };
        assert_eq!((low, high), (g("95.007"), g("105.007")));
        let one = Weight::from_milligrams(1);
        assert!(check_weight(ToleranceCheck::SupplyTotal, low, reference).is_ok());
        assert!(check_weight(ToleranceCheck::SupplyTotal, high, reference).is_ok());
        assert!(check_weight(ToleranceCheck::SupplyTotal, low - one, reference).is_err());
        assert!(check_weight(ToleranceCheck::SupplyTotal, high + one, reference).is_err());
    }

    #[test]
    fn failing_ratio_never_prints_inside_the_band() {
        // 1849.051 / 3000 = 0.61635033..., just past 0.587 + 5 %
        let expected = Fraction::from_ppm(587_000);
        let err = check_fine_fraction(expected, g("1849.051"), g("1150.949"))
            .expect_err("just outside");
        let CrucibleError::ToleranceExceeded {
            computed: Quantity::Fraction(computed),
            low: Quantity::Fraction(low),
            high: Quantity::Fraction(high),
            ..
        } = err
        else {
            unreachable!("expected a tolerance error");
        };
        assert_eq!(low, Fraction::from_ppm(557_650));
        assert_eq!(high, Fraction::from_ppm(616_350));
        assert_eq!(computed, Fraction::from_ppm(616_351));
    }

    #[test]
    fn all_scrap_skips_ratio() {
        let rule = Metal::Gold18Yellow.composition_rule();
        assert!(validate_composition(rule, &mix("100", "0", "0"), g("100")).is_ok());
    }

    #[test]
    fn pure_metals_reject_alloy() {
        let rule = Metal::Platinum.composition_rule();
        assert!(validate_composition(rule, &mix("50", "50", "0.001"), g("100")).is_ok());
        let err = validate_composition(rule, &mix("50", "49", "1"), g("100"))
            .expect_err("alloy in platinum");
        assert!(matches!(
            err,
            CrucibleError::ToleranceExceeded {
                check: ToleranceCheck::PureAlloy,
                ..
            }
        ));
    }

    #[test]
    fn negative_component_is_validation_error() {
        let err = validate_composition(CompositionRule::Unconstrained, &mix("-1", "0", "0"), g("0"))
            .expect_err("negative");
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn cut_within_tolerance_computes_losses() {
        let losses = validate_cut(g("100"), g("96"), g("80"), g("14")).expect("cut passes");
        assert_eq!(losses.loss_total, g("6"));
        assert_eq!(losses.loss_i, g("4"));
        assert_eq!(losses.loss_ii, g("2"));
    }

    #[test]
    fn cut_checks_are_skipped_for_zero_references() {
        assert!(validate_cut(Weight::ZERO, g("10"), g("0"), g("0")).is_err());
        assert!(validate_cut(Weight::ZERO, Weight::ZERO, g("5"), g("5")).is_ok());
    }

    #[test]
    fn cut_after_weights_out_of_band() {
        let err = validate_cut(g("100"), g("100"), g("80"), g("10")).expect_err("after cut");
        assert!(matches!(
            err,
            CrucibleError::ToleranceExceeded {
                check: ToleranceCheck::AfterCut,
                ..
            }
        ));
    }
}
