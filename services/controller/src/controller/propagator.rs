//! Cluster propagator.
//!
//! Places the agent artifact on every matched member whose copy is missing or
//! outdated, and withdraws it from members recorded in `cluster_info` that are
//! no longer matched (every recorded member when the declaration is being
//! deleted). Each member is handled by its own task; failures are recorded
//! per member and never stop the others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetclass_api::{AgentArtifact, AgentDeployment, ClassifierCopy, Declaration, Member};
use fleetclass_names::MemberId;
use fleetclass_reconcile::{ReconcileError, SpecHash};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::fanout::fan_out;
use crate::fleet::{MemberClient, MemberError};

/// What happened on one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// The artifact is present and current. `changed` is set when this
    /// attempt had to write it.
    Ensured { changed: bool, at: DateTime<Utc> },

    /// The artifact is gone from the member.
    Withdrawn,

    Failed { error: String, withdrawing: bool },
}

impl PropagationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-member results of one propagation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    /// Hash of the classifier copy that was ensured.
    pub hash: SpecHash,
    pub outcomes: BTreeMap<MemberId, PropagationOutcome>,
}

impl PropagationReport {
    pub fn failures(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_failure()).count()
    }

    /// Members whose artifact could not be withdrawn.
    pub fn pending_withdrawals(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, PropagationOutcome::Failed { withdrawing: true, .. }))
            .count()
    }
}

/// Build the artifact placed on members for `declaration`.
pub fn build_artifact(
    declaration: &Declaration,
    agent: &AgentDeployment,
) -> Result<AgentArtifact, ReconcileError> {
    let hash = SpecHash::of(&declaration.spec)?;
    Ok(AgentArtifact {
        name: declaration.name().clone(),
        agent: agent.clone(),
        classifier: ClassifierCopy {
            generation: declaration.generation(),
            spec_hash: hash.into(),
            classifier_labels: declaration.spec.classifier_labels.clone(),
            rules: declaration.spec.rules.clone(),
        },
    })
}

enum Action {
    Ensure(Member),
    Withdraw(Member),
}

/// Ensures and withdraws agent artifacts on members.
pub struct Propagator {
    client: Arc<dyn MemberClient>,
    member_timeout: Duration,
    agent: AgentDeployment,
}

impl Propagator {
    pub fn new(client: Arc<dyn MemberClient>, member_timeout: Duration, agent: AgentDeployment) -> Self {
        Self {
            client,
            member_timeout,
            agent,
        }
    }

    /// Run one propagation pass.
    ///
    /// `members` is the current catalog and `matched` the ids selected from
    /// it. When `deleting` is set nothing is ensured and every member recorded
    /// in the declaration's `cluster_info` is withdrawn.
    pub async fn propagate(
        &self,
        declaration: &Declaration,
        members: &[Member],
        matched: &BTreeSet<MemberId>,
        deleting: bool,
        deadline: Instant,
    ) -> Result<PropagationReport, ReconcileError> {
        let artifact = build_artifact(declaration, &self.agent)?;
        let hash = SpecHash::of(&declaration.spec)?;

        let catalog: BTreeMap<&MemberId, &Member> = members.iter().map(|m| (&m.id, m)).collect();
        let mut outcomes = BTreeMap::new();
        let mut actions = Vec::new();

        if !deleting {
            for id in matched {
                if let Some(member) = catalog.get(id) {
                    actions.push(Action::Ensure((*member).clone()));
                }
            }
        }

        for info in &declaration.status.cluster_info {
            if !deleting && matched.contains(&info.member) {
                continue;
            }
            match catalog.get(&info.member) {
                Some(member) => actions.push(Action::Withdraw((*member).clone())),
                None => {
                    warn!(
                        member = %info.member,
                        "Member no longer in catalog, treating artifact as withdrawn"
                    );
                    outcomes.insert(info.member.clone(), PropagationOutcome::Withdrawn);
                }
            }
        }

        let withdrawing: BTreeSet<MemberId> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Withdraw(m) => Some(m.id.clone()),
                Action::Ensure(_) => None,
            })
            .collect();

        let tasks = actions
            .into_iter()
            .map(|action| {
                let client = Arc::clone(&self.client);
                let artifact = artifact.clone();
                match action {
                    Action::Ensure(member) => (member.id.clone(), ensure(client, member, artifact)),
                    Action::Withdraw(member) => (member.id.clone(), withdraw(client, member, artifact)),
                }
            })
            .collect::<Vec<_>>();

        let results = fan_out(tasks, self.member_timeout, deadline).await;

        for (member, result) in results {
            let is_withdrawal = withdrawing.contains(&member);
            let outcome = match result {
                Ok(Ok(Some(changed))) => PropagationOutcome::Ensured {
                    changed,
                    at: Utc::now(),
                },
                Ok(Ok(None)) => PropagationOutcome::Withdrawn,
                Ok(Err(e)) => failed(&member, e.to_string(), is_withdrawal),
                Err(e) => failed(&member, e.to_string(), is_withdrawal),
            };
            outcomes.insert(member, outcome);
        }

        Ok(PropagationReport { hash, outcomes })
    }
}

fn failed(member: &MemberId, error: String, withdrawing: bool) -> PropagationOutcome {
    warn!(member = %member, withdrawing, error = %error, "Propagation to member failed");
    PropagationOutcome::Failed { error, withdrawing }
}

type TaskResult = Result<Option<bool>, MemberError>;
type Task = std::pin::Pin<Box<dyn std::future::Future<Output = TaskResult> + Send>>;

/// `Ok(Some(changed))` once the artifact on `member` equals `artifact`.
fn ensure(client: Arc<dyn MemberClient>, member: Member, artifact: AgentArtifact) -> Task {
    Box::pin(async move {
        let current = client.get_artifact(&member, &artifact.name).await?;
        if current.as_ref() == Some(&artifact) {
            debug!(member = %member.id, "Artifact up to date");
            return Ok(Some(false));
        }
        client.apply_artifact(&member, &artifact).await?;
        debug!(member = %member.id, hash = %artifact.classifier.spec_hash, "Artifact applied");
        Ok(Some(true))
    })
}

/// `Ok(None)` once the artifact is gone from `member`.
fn withdraw(client: Arc<dyn MemberClient>, member: Member, artifact: AgentArtifact) -> Task {
    Box::pin(async move {
        client.delete_artifact(&member, &artifact.name).await?;
        debug!(member = %member.id, "Artifact withdrawn");
        Ok(None)
    })
}
