//! Snooze expiration.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::repository::{LeadRepository, RepositoryError};
use crate::tasks::CancellationToken;

use super::JobError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnoozeReport {
    pub examined: usize,
    pub expired: usize,
}

/// Clear every snooze whose deadline is at or before `now`.
///
/// Re-running with the same or a later `now` changes nothing further.
pub fn expire_due(
    leads: &dyn LeadRepository,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<SnoozeReport, JobError> {
    let mut report = SnoozeReport::default();

    for id in leads.ids()? {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let mut changed = false;
        match leads.update(id, &mut |lead| changed = lead.expire_snooze(now)) {
            Ok(_) => {}
            // deleted since `ids()`
            Err(RepositoryError::LeadNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        }
        report.examined += 1;
        if changed {
            debug!(lead_id = %id, "snooze expired");
            report.expired += 1;
        }
    }

    info!(examined = report.examined, expired = report.expired, "snooze expiration pass complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryLeadRepository;
    use chrono::{Duration, TimeZone};
    use leadflow_core::OrganisationId;
    use leadflow_leads::Lead;

    fn t() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 10, 12, 0, 0).unwrap()
    }

    fn snoozed_until(until: DateTime<Utc>) -> Lead {
        let created = t() - Duration::days(3);
        let mut lead = Lead::new(OrganisationId::new(), "Alan", "Turing", "alan@example.com", created);
        lead.snooze(until, created).unwrap();
        lead
    }

    fn all_leads(repo: &InMemoryLeadRepository) -> Vec<Lead> {
        repo.ids()
            .unwrap()
            .into_iter()
            .map(|id| repo.get(id).unwrap().unwrap())
            .collect()
    }

    #[test]
    fn elapsed_snooze_is_cleared_and_future_one_is_kept() {
        let past = snoozed_until(t() - Duration::hours(1));
        let future = snoozed_until(t() + Duration::hours(1));
        let (past_id, future_id) = (past.id(), future.id());
        let repo = InMemoryLeadRepository::with_leads([past, future]);

        let report = expire_due(&repo, t(), &CancellationToken::new()).unwrap();
        assert_eq!(report, SnoozeReport { examined: 2, expired: 1 });

        let past = repo.get(past_id).unwrap().unwrap();
        assert!(!past.is_snoozed());
        assert_eq!(past.snooze_until(), None);

        let future = repo.get(future_id).unwrap().unwrap();
        assert!(future.is_snoozed());
        assert_eq!(future.snooze_until(), Some(t() + Duration::hours(1)));
    }

    #[test]
    fn running_twice_is_the_same_as_running_once() {
        let repo = InMemoryLeadRepository::with_leads([
            snoozed_until(t() - Duration::minutes(5)),
            snoozed_until(t() + Duration::minutes(5)),
        ]);
        let token = CancellationToken::new();

        expire_due(&repo, t(), &token).unwrap();
        let once = all_leads(&repo);

        let second = expire_due(&repo, t(), &token).unwrap();
        assert_eq!(second.expired, 0);
        assert_eq!(all_leads(&repo), once);
    }

    #[test]
    fn cancellation_stops_before_the_next_lead() {
        let repo = InMemoryLeadRepository::with_leads([snoozed_until(t() - Duration::hours(1))]);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(expire_due(&repo, t(), &token).unwrap_err(), JobError::Cancelled);
        let id = repo.ids().unwrap()[0];
        assert!(repo.get(id).unwrap().unwrap().is_snoozed());
    }
}
