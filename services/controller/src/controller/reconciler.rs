//! Classification reconciler.
//!
//! One call to [`ClassifierReconciler::reconcile`] is one attempt over one
//! declaration:
//!
//! ```text
//! open scope ─► match ─► record ─► propagate ─► collect ─► aggregate ─► commit ─► Stable
//!      │
//!      └─(deleting)─► withdraw ─► aggregate ─► finalize ─► commit ─► Removed
//! ```
//!
//! Before any artifact is placed, the finalizer and a `Provisioning` entry for
//! every newly matched member are committed, so every member that may carry
//! an artifact is known to later attempts and deletion waits for withdrawal.
//! Apart from that record, only the final commit is persisted, and it happens
//! on every path that opened a scope, early exits included.
//! The returned [`Directive`] tells the scheduler what to do next.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleetclass_api::{
    AgentDeployment, AgentHealth, Condition, ConditionKind, Member, MemberInfo,
    CLASSIFIER_FINALIZER,
};
use fleetclass_names::{AttemptId, DeclarationName, MemberId};
use fleetclass_reconcile::{
    Directive, DEFAULT_ATTEMPT_DEADLINE, DEFAULT_MAX_COMMIT_ATTEMPTS, DEFAULT_MEMBER_TIMEOUT,
    DEFAULT_RETRY_AFTER,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::aggregator::{aggregate, AggregationInput};
use super::collector::{Collector, ReportOutcome};
use super::matcher::{match_members, Selector};
use super::propagator::Propagator;
use super::scope::{CommitOutcome, DeclarationScope, PersistError};
use crate::config::{DEFAULT_AGENT_IMAGE, DEFAULT_AGENT_NAMESPACE};
use crate::fleet::{MemberCatalog, MemberClient};
use crate::store::DeclarationStore;

pub const REASON_INVALID_SELECTOR: &str = "InvalidSelector";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_CATALOG_UNAVAILABLE: &str = "CatalogUnavailable";

/// Where an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The declaration could not be read.
    Loading,
    /// Recording the finalizer and new placements before member I/O.
    Recording,
    Propagating,
    Matching,
    Aggregating,
    Committing,
    Stable,
    Withdrawing,
    Finalizing,
    Removed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Recording => "recording",
            Self::Propagating => "propagating",
            Self::Matching => "matching",
            Self::Aggregating => "aggregating",
            Self::Committing => "committing",
            Self::Stable => "stable",
            Self::Withdrawing => "withdrawing",
            Self::Finalizing => "finalizing",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Timeout for one remote operation against one member.
    pub member_timeout: Duration,
    /// Deadline for the member work of one attempt.
    pub attempt_deadline: Duration,
    pub max_commit_attempts: u32,
    /// Delay requested after conflicts, store failures and member failures.
    pub retry_after: Duration,
    pub agent: AgentDeployment,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            member_timeout: DEFAULT_MEMBER_TIMEOUT,
            attempt_deadline: DEFAULT_ATTEMPT_DEADLINE,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            retry_after: DEFAULT_RETRY_AFTER,
            agent: AgentDeployment {
                namespace: DEFAULT_AGENT_NAMESPACE.to_string(),
                image: DEFAULT_AGENT_IMAGE.to_string(),
            },
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub directive: Directive,
    pub phase: Phase,
    /// Generation the attempt worked on, if the declaration existed.
    pub generation: Option<i64>,
    /// Members with a failed propagation or no usable report.
    pub member_errors: usize,
}

impl AttemptSummary {
    fn new(directive: Directive, phase: Phase) -> Self {
        Self {
            directive,
            phase,
            generation: None,
            member_errors: 0,
        }
    }
}

/// Reconciles declarations against the member fleet.
pub struct ClassifierReconciler {
    store: Arc<dyn DeclarationStore>,
    catalog: Arc<dyn MemberCatalog>,
    propagator: Propagator,
    collector: Collector,
    config: ReconcilerConfig,
}

impl ClassifierReconciler {
    pub fn new(
        store: Arc<dyn DeclarationStore>,
        catalog: Arc<dyn MemberCatalog>,
        client: Arc<dyn MemberClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            propagator: Propagator::new(
                Arc::clone(&client),
                config.member_timeout,
                config.agent.clone(),
            ),
            collector: Collector::new(client, config.member_timeout),
            config,
        }
    }

    /// Run one attempt over `name`.
    pub async fn reconcile(&self, name: &DeclarationName) -> AttemptSummary {
        self.reconcile_attempt(name, AttemptId::new()).await
    }

    #[instrument(skip(self, name, attempt), fields(declaration = %name, attempt = %attempt))]
    async fn reconcile_attempt(&self, name: &DeclarationName, attempt: AttemptId) -> AttemptSummary {
        let scope = match DeclarationScope::open(
            Arc::clone(&self.store),
            name,
            self.config.max_commit_attempts,
        )
        .await
        {
            Ok(Some(scope)) => scope,
            Ok(None) => {
                debug!("Declaration not found, nothing to do");
                return AttemptSummary::new(Directive::Success, Phase::Removed);
            }
            Err(e) => {
                warn!(error = %e, "Failed to open declaration");
                return AttemptSummary::new(
                    Directive::RetryAfter(self.config.retry_after),
                    Phase::Loading,
                );
            }
        };

        let deadline = Instant::now() + self.config.attempt_deadline;
        let generation = scope.declaration().generation();

        let mut summary = if scope.declaration().meta.is_deleting() {
            self.withdraw(scope, deadline).await
        } else {
            self.converge(scope, deadline).await
        };
        summary.generation = Some(generation);

        info!(
            phase = %summary.phase,
            directive = %summary.directive,
            generation,
            member_errors = summary.member_errors,
            "Attempt finished"
        );
        summary
    }

    async fn converge(&self, mut scope: DeclarationScope, deadline: Instant) -> AttemptSummary {
        scope
            .declaration_mut()
            .meta
            .add_finalizer(CLASSIFIER_FINALIZER);

        let selector_source = scope.declaration().spec.cluster_selector.clone();
        let selector = match Selector::parse(&selector_source) {
            Ok(selector) => selector,
            Err(e) => {
                warn!(error = %e, "Invalid cluster selector");
                return self
                    .invalid(scope, Phase::Matching, REASON_INVALID_SELECTOR, e.to_string())
                    .await;
            }
        };

        let members = match self.catalog.list_members().await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "Member catalog unavailable");
                return self.catalog_unavailable(scope, ConditionKind::Progressing, e.to_string()).await;
            }
        };

        let matched = match_members(&members, &selector);
        debug!(phase = %Phase::Matching, matched = matched.len(), catalog = members.len(), "Members matched");

        if let Some(summary) = self.record_placements(&mut scope, &matched).await {
            return summary;
        }
        if scope.declaration().meta.is_deleting() {
            info!("Deletion requested during attempt, withdrawing instead");
            return self.withdraw(scope, deadline).await;
        }
        if scope.declaration().spec.cluster_selector != selector_source {
            debug!("Selector changed during attempt, deferring to the next attempt");
            let directive = self
                .commit(scope)
                .await
                .err()
                .unwrap_or(Directive::RetryAfter(Duration::ZERO));
            return AttemptSummary::new(directive, Phase::Recording);
        }

        let declaration = scope.declaration().clone();
        let propagation = match self
            .propagator
            .propagate(&declaration, &members, &matched, false, deadline)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Cannot build classifier copy");
                return self
                    .invalid(scope, Phase::Propagating, REASON_INVALID_SPEC, e.to_string())
                    .await;
            }
        };
        debug!(phase = %Phase::Propagating, failures = propagation.failures(), "Propagation finished");

        let matched_members: Vec<Member> = members
            .iter()
            .filter(|m| matched.contains(&m.id))
            .cloned()
            .collect();
        let reports = self
            .collector
            .collect(declaration.name(), declaration.generation(), &matched_members, deadline)
            .await;

        debug!(phase = %Phase::Aggregating, reports = reports.len(), "Aggregating status");
        let status = aggregate(&AggregationInput {
            generation: declaration.generation(),
            deleting: false,
            matched: &matched,
            reports: &reports,
            propagation: &propagation,
            previous: &declaration.status,
        });
        scope.set_status(status);

        let unavailable = reports
            .values()
            .filter(|r| matches!(r, ReportOutcome::Unavailable(_)))
            .count();
        let failures = propagation.failures();

        let (directive, phase) = match self.commit(scope).await {
            Ok(_) if failures > 0 => (Directive::RetryAfter(self.config.retry_after), Phase::Stable),
            Ok(_) => (Directive::Success, Phase::Stable),
            Err(directive) => (directive, Phase::Committing),
        };

        AttemptSummary {
            directive,
            phase,
            generation: None,
            member_errors: failures + unavailable,
        }
    }

    async fn withdraw(&self, mut scope: DeclarationScope, deadline: Instant) -> AttemptSummary {
        if !scope.declaration().meta.has_finalizer(CLASSIFIER_FINALIZER) {
            debug!("Deletion pending on other finalizers");
            let directive = self.commit(scope).await.err().unwrap_or(Directive::Success);
            return AttemptSummary::new(directive, Phase::Finalizing);
        }

        let members = match self.catalog.list_members().await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "Member catalog unavailable during withdrawal");
                let mut summary = self
                    .catalog_unavailable(scope, ConditionKind::Deleting, e.to_string())
                    .await;
                summary.phase = Phase::Withdrawing;
                return summary;
            }
        };

        let declaration = scope.declaration().clone();
        let propagation = match self
            .propagator
            .propagate(&declaration, &members, &Default::default(), true, deadline)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Cannot build classifier copy");
                return self
                    .invalid(scope, Phase::Withdrawing, REASON_INVALID_SPEC, e.to_string())
                    .await;
            }
        };

        let status = aggregate(&AggregationInput {
            generation: declaration.generation(),
            deleting: true,
            matched: &Default::default(),
            reports: &BTreeMap::new(),
            propagation: &propagation,
            previous: &declaration.status,
        });
        let remaining = status.cluster_info.len();
        scope.set_status(status);

        if remaining == 0 {
            info!("Withdrawn from every member, removing finalizer");
            scope
                .declaration_mut()
                .meta
                .remove_finalizer(CLASSIFIER_FINALIZER);
        } else {
            info!(remaining, "Withdrawal pending on members");
        }

        let member_errors = propagation.pending_withdrawals();
        match self.commit(scope).await {
            Ok(CommitOutcome::Removed) => AttemptSummary {
                directive: Directive::Success,
                phase: Phase::Removed,
                generation: None,
                member_errors,
            },
            Ok(_) if remaining == 0 => AttemptSummary {
                directive: Directive::Success,
                phase: Phase::Finalizing,
                generation: None,
                member_errors,
            },
            Ok(_) => AttemptSummary {
                directive: Directive::RetryAfter(self.config.retry_after),
                phase: Phase::Withdrawing,
                generation: None,
                member_errors,
            },
            Err(directive) => AttemptSummary {
                directive,
                phase: Phase::Withdrawing,
                generation: None,
                member_errors,
            },
        }
    }

    /// Commit the finalizer and a `Provisioning` entry for every matched
    /// member not yet in `cluster_info`. Nothing is written when both are
    /// already stored. Returns a summary when the attempt must stop before
    /// touching members.
    async fn record_placements(
        &self,
        scope: &mut DeclarationScope,
        matched: &BTreeSet<MemberId>,
    ) -> Option<AttemptSummary> {
        let status = &mut scope.declaration_mut().status;
        let mut added = 0;
        for member in matched {
            if status.member_info(member).is_none() {
                status.cluster_info.push(MemberInfo {
                    member: member.clone(),
                    agent_health: AgentHealth::Provisioning,
                    hash: None,
                    last_propagated: None,
                    error: None,
                });
                added += 1;
            }
        }
        if added > 0 {
            status.cluster_info.sort_by(|a, b| a.member.cmp(&b.member));
        }

        match scope.checkpoint().await {
            Ok(CommitOutcome::Unchanged) => None,
            Ok(outcome) => {
                debug!(phase = %Phase::Recording, added, outcome = ?outcome, "Placements recorded");
                None
            }
            Err(PersistError::Gone(name)) => {
                info!(declaration = %name, "Declaration removed before propagation");
                Some(AttemptSummary::new(Directive::Success, Phase::Removed))
            }
            Err(e) => {
                warn!(error = %e, "Failed to record placements");
                Some(AttemptSummary::new(
                    Directive::RetryAfter(self.config.retry_after),
                    Phase::Recording,
                ))
            }
        }
    }

    /// Record a terminal condition and commit.
    async fn invalid(
        &self,
        mut scope: DeclarationScope,
        phase: Phase,
        reason: &str,
        message: String,
    ) -> AttemptSummary {
        let generation = scope.declaration().generation();
        let mut status = scope.declaration().status.clone();
        status.observed_generation = generation;
        status.condition = Some(Condition::new(ConditionKind::Invalid, reason).with_message(message.clone()));
        scope.set_status(status);

        let directive = match self.commit(scope).await {
            Ok(_) => Directive::TerminalFailure(message),
            Err(directive) => directive,
        };
        AttemptSummary::new(directive, phase)
    }

    async fn catalog_unavailable(
        &self,
        mut scope: DeclarationScope,
        kind: ConditionKind,
        message: String,
    ) -> AttemptSummary {
        let mut status = scope.declaration().status.clone();
        status.condition = Some(Condition::new(kind, REASON_CATALOG_UNAVAILABLE).with_message(message));
        scope.set_status(status);

        let directive = self
            .commit(scope)
            .await
            .err()
            .unwrap_or(Directive::RetryAfter(self.config.retry_after));
        AttemptSummary::new(directive, Phase::Matching)
    }

    /// Close the scope. A failed commit maps to the directive to return.
    async fn commit(&self, scope: DeclarationScope) -> Result<CommitOutcome, Directive> {
        debug!(phase = %Phase::Committing, version = %scope.version(), "Committing");
        match scope.close().await {
            Ok(outcome) => {
                debug!(outcome = ?outcome, "Commit finished");
                Ok(outcome)
            }
            Err(PersistError::Gone(name)) => {
                info!(declaration = %name, "Declaration removed during attempt");
                Err(Directive::Success)
            }
            Err(e) => {
                warn!(error = %e, "Commit failed");
                Err(Directive::RetryAfter(self.config.retry_after))
            }
        }
    }
}
