//! Periodic bulk rescoring.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use leadflow_scoring::LeadScorer;

use crate::repository::{LeadRepository, RepositoryError};
use crate::tasks::CancellationToken;

use super::JobError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreRefreshReport {
    pub scored: usize,
    pub changed: usize,
    /// Scored with the heuristic rather than a trained model.
    pub fallback: usize,
    pub model_version: Option<u64>,
}

/// Rescore every lead with the current model.
///
/// Races with write-path rescoring of the same lead are last-write-wins;
/// the stored score is a cache.
pub fn refresh_scores(
    leads: &dyn LeadRepository,
    scorer: &LeadScorer,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<ScoreRefreshReport, JobError> {
    let mut report = ScoreRefreshReport::default();

    for id in leads.ids()? {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let Some(lead) = leads.get(id)? else {
            continue;
        };
        let outcome = scorer.score(&lead.snapshot(), now);

        let mut changed = false;
        match leads.update(id, &mut |l| {
            changed = l.score() != outcome.score;
            l.set_score(outcome.score);
        }) {
            Ok(_) => {}
            Err(RepositoryError::LeadNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        }

        report.scored += 1;
        if changed {
            report.changed += 1;
        }
        if outcome.source.is_fallback() {
            report.fallback += 1;
        }
    }

    report.model_version = scorer.health().active_version;
    info!(
        scored = report.scored,
        changed = report.changed,
        fallback = report.fallback,
        version = ?report.model_version,
        "score refresh complete"
    );
    Ok(report)
}
