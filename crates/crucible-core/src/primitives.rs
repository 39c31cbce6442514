//! # Floor Primitives
//!
//! Hardcoded runtime constants for the Crucible core.
//!
//! These values are compiled into the binary. Anything an operator is
//! expected to tune (sweep interval, grace period) only has its default
//! here; the application layer reads the effective value from config.

/// Tolerance band shared by every weight and ratio check, in permille.
///
/// - `50` = ±5 %, inclusive at both ends.
/// - Applies to supply totals, gold fine fractions, before-cut and
///   after-cut weights alike.
pub const TOLERANCE_PERMILLE: i64 = 50;

/// Milligrams per gram. `Weight` stores milligrams.
pub const MILLIGRAMS_PER_GRAM: i64 = 1000;

/// Parts per million in one whole. `Fraction` stores ppm.
pub const PPM: i64 = 1_000_000;

/// Largest alloy weight (milligrams) accepted for a pure-only metal.
///
/// Platinum and silver must be supplied without alloy; one milligram
/// absorbs scale rounding.
pub const PURE_ONLY_ALLOY_EPSILON_MG: i64 = 1;

/// Largest weight accepted at the API boundary (999 999 999.999 g).
pub const MAX_WEIGHT_MG: i64 = 999_999_999_999;

// =============================================================================
// PROMOTION SWEEP DEFAULTS
// =============================================================================

/// How often the promotion sweep polls for ready flasks, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// How long a flask must have been ready before it is promoted, in seconds.
pub const DEFAULT_PROMOTION_GRACE_SECS: i64 = 60;

/// Longest accepted grace period, in seconds (one week).
pub const MAX_PROMOTION_GRACE_SECS: i64 = 7 * 24 * 60 * 60;

/// Delay before the first sweep after start-up, in seconds.
pub const DEFAULT_SWEEP_STARTUP_DELAY_SECS: u64 = 2;

/// Actor recorded on rows written by the promotion sweep.
pub const AUTO_ACTOR: &str = "auto";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for tree and flask numbers.
pub const MAX_NUMBER_LENGTH: usize = 32;

/// Maximum length for operator names.
pub const MAX_ACTOR_LENGTH: usize = 64;

/// Maximum length for a bag label.
pub const MAX_BAG_LABEL_LENGTH: usize = 32;

/// Maximum number of bags attached to a single tree or flask.
pub const MAX_BAGS_PER_UNIT: usize = 64;
