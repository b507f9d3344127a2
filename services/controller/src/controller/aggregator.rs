//! Status aggregator.
//!
//! Folds the matched set, the collected reports and the propagation outcomes
//! into a new [`DeclarationStatus`]. The fold is pure: identical inputs give
//! an identical status, entry order included, and feeding a result back in as
//! the previous status with the same inputs gives the same result again.
//!
//! Rules per member:
//!
//! | member    | input                       | result                                  |
//! |-----------|-----------------------------|-----------------------------------------|
//! | matched   | fresh report                | state from report, error cleared        |
//! | matched   | stale report                | previous state kept, `pending_refresh`  |
//! | matched   | no usable report            | previous state kept, error set          |
//! | unmatched | withdrawal confirmed        | removed from both lists                 |
//! | unmatched | withdrawal failed           | kept, health `Removing`, error set      |

use std::collections::{BTreeMap, BTreeSet};

use fleetclass_api::{
    AgentHealth, Condition, ConditionKind, DeclarationStatus, MemberInfo, MemberMatchStatus,
};
use fleetclass_names::MemberId;

use super::collector::ReportOutcome;
use super::propagator::{PropagationOutcome, PropagationReport};

pub const REASON_CONVERGED: &str = "Converged";
pub const REASON_CONVERGING: &str = "MembersConverging";
pub const REASON_WITHDRAWING: &str = "WithdrawingAgents";
pub const REASON_FINALIZING: &str = "Finalizing";

/// Everything one aggregation needs.
#[derive(Debug, Clone, Copy)]
pub struct AggregationInput<'a> {
    /// Generation of the declaration this attempt worked on.
    pub generation: i64,
    pub deleting: bool,
    pub matched: &'a BTreeSet<MemberId>,
    pub reports: &'a BTreeMap<MemberId, ReportOutcome>,
    pub propagation: &'a PropagationReport,
    pub previous: &'a DeclarationStatus,
}

pub fn aggregate(input: &AggregationInput<'_>) -> DeclarationStatus {
    let previous_statuses: BTreeMap<&MemberId, &MemberMatchStatus> = input
        .previous
        .matching_cluster_statuses
        .iter()
        .map(|s| (&s.member, s))
        .collect();
    let previous_info: BTreeMap<&MemberId, &MemberInfo> = input
        .previous
        .cluster_info
        .iter()
        .map(|i| (&i.member, i))
        .collect();

    let mut statuses = BTreeMap::new();
    let mut info = BTreeMap::new();

    if !input.deleting {
        for member in input.matched {
            let previous = previous_statuses.get(member).copied();
            statuses.insert(
                member.clone(),
                match_status(member, previous, input.reports.get(member), input.generation),
            );
            info.insert(
                member.clone(),
                member_info(
                    member,
                    previous_info.get(member).copied(),
                    input.propagation.outcomes.get(member),
                    input.propagation.hash.as_str(),
                ),
            );
        }
    }

    let leaving: BTreeSet<&MemberId> = previous_statuses
        .keys()
        .chain(previous_info.keys())
        .copied()
        .filter(|m| input.deleting || !input.matched.contains(*m))
        .collect();

    for member in leaving {
        let outcome = input.propagation.outcomes.get(member);
        let recorded = previous_info.get(member).copied();

        let error = match (outcome, recorded) {
            (Some(PropagationOutcome::Withdrawn), _) => continue,
            (Some(PropagationOutcome::Failed { error, .. }), _) => error.clone(),
            // Never propagated, nothing to withdraw.
            (_, None) => continue,
            (_, Some(_)) => "withdrawal not attempted".to_string(),
        };

        info.insert(
            member.clone(),
            MemberInfo {
                member: member.clone(),
                agent_health: AgentHealth::Removing,
                hash: recorded.and_then(|i| i.hash.clone()),
                last_propagated: recorded.and_then(|i| i.last_propagated),
                error: Some(error),
            },
        );
        if let Some(status) = previous_statuses.get(member) {
            statuses.insert(member.clone(), (*status).clone());
        }
    }

    let mut status = DeclarationStatus {
        observed_generation: input.generation,
        matching_cluster_statuses: statuses.into_values().collect(),
        cluster_info: info.into_values().collect(),
        condition: None,
    };
    status.condition = Some(condition(&status, input.deleting));
    status
}

fn match_status(
    member: &MemberId,
    previous: Option<&MemberMatchStatus>,
    report: Option<&ReportOutcome>,
    generation: i64,
) -> MemberMatchStatus {
    let mut status = previous
        .cloned()
        .unwrap_or_else(|| MemberMatchStatus::unknown(member.clone()));

    match report {
        Some(ReportOutcome::Fresh(report)) => {
            status.state = report.match_state();
            status.observed_generation = Some(report.generation);
            status.last_evaluated = Some(report.timestamp);
            status.pending_refresh = false;
            status.error = None;
        }
        Some(ReportOutcome::Stale(_)) => {
            status.pending_refresh = true;
            status.error = None;
        }
        Some(ReportOutcome::Unavailable(error)) => {
            status.pending_refresh = status.observed_generation.map_or(true, |g| g < generation);
            status.error = Some(error.clone());
        }
        None => {
            status.pending_refresh = status.observed_generation.map_or(true, |g| g < generation);
        }
    }
    status
}

fn member_info(
    member: &MemberId,
    previous: Option<&MemberInfo>,
    outcome: Option<&PropagationOutcome>,
    hash: &str,
) -> MemberInfo {
    let mut info = previous.cloned().unwrap_or_else(|| MemberInfo {
        member: member.clone(),
        agent_health: AgentHealth::Provisioning,
        hash: None,
        last_propagated: None,
        error: None,
    });

    match outcome {
        Some(PropagationOutcome::Ensured { changed, at }) => {
            info.agent_health = AgentHealth::Provisioned;
            info.hash = Some(hash.to_string());
            info.last_propagated = if *changed {
                Some(*at)
            } else {
                info.last_propagated.or(Some(*at))
            };
            info.error = None;
        }
        Some(PropagationOutcome::Failed { error, .. }) => {
            info.agent_health = AgentHealth::Failed;
            info.error = Some(error.clone());
        }
        Some(PropagationOutcome::Withdrawn) | None => {
            if info.agent_health != AgentHealth::Provisioned {
                info.agent_health = AgentHealth::Provisioning;
            }
        }
    }
    info
}

fn condition(status: &DeclarationStatus, deleting: bool) -> Condition {
    if deleting {
        let remaining = status.cluster_info.len();
        if remaining == 0 {
            return Condition::new(ConditionKind::Deleting, REASON_FINALIZING);
        }
        return Condition::new(ConditionKind::Deleting, REASON_WITHDRAWING)
            .with_message(format!("{remaining} member(s) still carry the classifier"));
    }

    let unhealthy = status
        .cluster_info
        .iter()
        .filter(|i| i.agent_health != AgentHealth::Provisioned || i.error.is_some())
        .count();
    let pending = status
        .matching_cluster_statuses
        .iter()
        .filter(|s| s.pending_refresh || s.error.is_some())
        .count();

    if unhealthy == 0 && pending == 0 {
        Condition::new(ConditionKind::Ready, REASON_CONVERGED)
    } else {
        Condition::new(ConditionKind::Progressing, REASON_CONVERGING).with_message(format!(
            "{unhealthy} member(s) not provisioned, {pending} member(s) awaiting a current report"
        ))
    }
}
