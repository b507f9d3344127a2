//! Report collector.
//!
//! Reads the latest agent report from every matched member and classifies it
//! against the declaration's current generation. Collection never fails as a
//! whole: every problem is folded into a per-member outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleetclass_api::{Member, Report};
use fleetclass_names::{DeclarationName, MemberId};
use tokio::time::Instant;
use tracing::debug;

use super::fanout::fan_out;
use crate::fleet::MemberClient;

/// Classification of the report read from one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Evaluated against the current generation or a newer one.
    Fresh(Report),

    /// Evaluated against an older generation.
    Stale(Report),

    /// No usable report: the read failed, timed out or found nothing.
    Unavailable(String),
}

/// Classify what was read from `member` for `declaration` at `generation`.
pub fn classify_report(
    read: Result<Option<Report>, String>,
    member: &MemberId,
    declaration: &DeclarationName,
    generation: i64,
) -> ReportOutcome {
    let report = match read {
        Ok(Some(report)) => report,
        Ok(None) => return ReportOutcome::Unavailable("no report from member yet".to_string()),
        Err(e) => return ReportOutcome::Unavailable(e),
    };

    if let Err(e) = report.validate_for(member, declaration) {
        return ReportOutcome::Unavailable(format!("invalid report: {e}"));
    }

    // A report ahead of the declaration counts as fresh.
    if report.generation >= generation {
        ReportOutcome::Fresh(report)
    } else {
        ReportOutcome::Stale(report)
    }
}

/// Fetches reports from members.
pub struct Collector {
    client: Arc<dyn MemberClient>,
    member_timeout: Duration,
}

impl Collector {
    pub fn new(client: Arc<dyn MemberClient>, member_timeout: Duration) -> Self {
        Self {
            client,
            member_timeout,
        }
    }

    /// Read and classify the report of every member in `members`.
    pub async fn collect(
        &self,
        declaration: &DeclarationName,
        generation: i64,
        members: &[Member],
        deadline: Instant,
    ) -> BTreeMap<MemberId, ReportOutcome> {
        let tasks = members
            .iter()
            .map(|member| {
                let client = Arc::clone(&self.client);
                let member = member.clone();
                let name = declaration.clone();
                let id = member.id.clone();
                let task = async move { client.get_report(&member, &name).await };
                (id, task)
            })
            .collect::<Vec<_>>();

        let results = fan_out(tasks, self.member_timeout, deadline).await;

        results
            .into_iter()
            .map(|(member, result)| {
                let read = match result {
                    Ok(read) => read.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                let outcome = classify_report(read, &member, declaration, generation);
                debug!(member = %member, outcome = outcome_kind(&outcome), "Report collected");
                (member, outcome)
            })
            .collect()
    }
}

fn outcome_kind(outcome: &ReportOutcome) -> &'static str {
    match outcome {
        ReportOutcome::Fresh(_) => "fresh",
        ReportOutcome::Stale(_) => "stale",
        ReportOutcome::Unavailable(_) => "unavailable",
    }
}
