//! # Automatic Promotion Sweep
//!
//! Moves flasks out of quenching once they have been ready for the grace
//! period. One pass is synchronous and stateless; the application decides
//! how often to run it.
//!
//! Each flask is promoted in its own transaction with the same guard a
//! manual post uses, so a flask an operator moved first is simply skipped.
//! A failure on one flask is logged and counted and never stops the pass.

use crate::events::EventKind;
use crate::machine::Pipeline;
use crate::types::{Actor, CrucibleError, FlaskId};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Candidates found ready.
    pub examined: usize,
    pub promoted: Vec<FlaskId>,
    /// Already moved on by someone else.
    pub skipped: Vec<FlaskId>,
    pub failed: Vec<FlaskId>,
}

impl Pipeline {
    /// Promote every quenching flask whose `ready_at` is at least the grace
    /// period in the past.
    pub fn promote_ready(&self) -> Result<SweepReport, CrucibleError> {
        let cutoff = self
            .now()
            .checked_sub_signed(self.grace())
            .ok_or_else(|| {
                CrucibleError::ValidationError(format!(
                    "grace period of {}s reaches outside the calendar",
                    self.grace().num_seconds()
                ))
            })?;
        let candidates = self.store().quenched_before(cutoff)?;
        debug!(candidates = candidates.len(), cutoff = %cutoff, "promotion sweep");
        Ok(self.promote_candidates(&candidates))
    }

    /// Try to promote the given flasks, each in its own transaction.
    pub fn promote_candidates(&self, candidates: &[FlaskId]) -> SweepReport {
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for &id in candidates {
            match self.promote_quenched(id, Actor::auto(), EventKind::QuenchingAutoPosted) {
                Ok(_) => report.promoted.push(id),
                Err(CrucibleError::PreconditionFailed { actual, .. }) => {
                    debug!(flask = id.0, stage = actual, "already promoted, skipping");
                    report.skipped.push(id);
                }
                Err(e) => {
                    warn!(flask = id.0, error = %e, "automatic promotion failed");
                    report.failed.push(id);
                }
            }
        }

        if !report.promoted.is_empty() || !report.failed.is_empty() {
            info!(
                promoted = report.promoted.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "promotion sweep finished"
            );
        }
        report
    }
}
