//! Declaration, status, report and artifact definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetclass_names::{DeclarationName, MemberId};
use serde::{Deserialize, Serialize};

use crate::{ApiError, ObjectMeta};

// =============================================================================
// Enums
// =============================================================================

/// Result of evaluating the classification rules on one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchState {
    /// No report has been received yet.
    #[default]
    Unknown,
    Matching,
    NotMatching,
}

/// Health of the agent artifact on a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// Propagation has not succeeded yet.
    Provisioning,
    /// The artifact is present and up to date.
    Provisioned,
    /// The last propagation attempt failed.
    Failed,
    /// Withdrawal is pending.
    Removing,
}

/// Overall state of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Every matched member is provisioned and reported on the current generation.
    Ready,
    /// Some members are still converging or failing.
    Progressing,
    /// The spec cannot be acted upon (terminal until the spec changes).
    Invalid,
    /// Withdrawal from members is in progress.
    Deleting,
}

/// Comparison used by Kubernetes version rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionComparison {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
}

// =============================================================================
// Spec
// =============================================================================

/// Label the classification assigns to every matching member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierLabel {
    pub key: String,
    pub value: String,
}

/// A predicate evaluated by the agent on a member.
///
/// The controller never evaluates rules itself; it only ships them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationRule {
    /// Compares the member's Kubernetes version.
    KubernetesVersion {
        comparison: VersionComparison,
        version: String,
    },
    /// Counts deployed resources of a kind.
    DeployedResources {
        group: String,
        version: String,
        resource_kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        label_filters: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_count: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeclarationSpec {
    /// Label selector over member labels. Empty selects every member.
    #[serde(default)]
    pub cluster_selector: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classifier_labels: Vec<ClassifierLabel>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ClassificationRule>,
}

// =============================================================================
// Status
// =============================================================================

/// Per-member match result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberMatchStatus {
    pub member: MemberId,
    pub state: MatchState,

    /// Generation of the report the state was taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<DateTime<Utc>>,

    /// The member has not evaluated the current generation yet.
    #[serde(default)]
    pub pending_refresh: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MemberMatchStatus {
    /// Entry for a member seen for the first time.
    pub fn unknown(member: MemberId) -> Self {
        Self {
            member,
            state: MatchState::Unknown,
            observed_generation: None,
            last_evaluated: None,
            pending_refresh: true,
            error: None,
        }
    }
}

/// Per-member propagation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub member: MemberId,
    pub agent_health: AgentHealth,

    /// Spec hash of the classifier copy last propagated to the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_propagated: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall condition of a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(kind: ConditionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeclarationStatus {
    /// Spec generation the status was computed against.
    #[serde(default)]
    pub observed_generation: i64,

    /// Sorted by member id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matching_cluster_statuses: Vec<MemberMatchStatus>,

    /// Sorted by member id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_info: Vec<MemberInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl DeclarationStatus {
    pub fn match_status(&self, member: &MemberId) -> Option<&MemberMatchStatus> {
        self.matching_cluster_statuses
            .iter()
            .find(|s| &s.member == member)
    }

    pub fn member_info(&self, member: &MemberId) -> Option<&MemberInfo> {
        self.cluster_info.iter().find(|i| &i.member == member)
    }
}

// =============================================================================
// Declaration
// =============================================================================

/// The central classification object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    pub meta: ObjectMeta,
    pub spec: DeclarationSpec,
    #[serde(default)]
    pub status: DeclarationStatus,
}

impl Declaration {
    pub fn new(name: DeclarationName, spec: DeclarationSpec) -> Self {
        Self {
            meta: ObjectMeta::new(name),
            spec,
            status: DeclarationStatus::default(),
        }
    }

    pub fn name(&self) -> &DeclarationName {
        &self.meta.name
    }

    pub fn generation(&self) -> i64 {
        self.meta.generation
    }
}

// =============================================================================
// Members and reports
// =============================================================================

/// Catalog entry for a member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Base URL of the member's remote-object API.
    pub api_url: String,
}

/// Evaluation result written by the agent on a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub member: MemberId,
    pub declaration: DeclarationName,
    pub matching: bool,

    /// Declaration generation the agent evaluated.
    pub generation: i64,
    pub timestamp: DateTime<Utc>,
}

impl Report {
    pub fn match_state(&self) -> MatchState {
        if self.matching {
            MatchState::Matching
        } else {
            MatchState::NotMatching
        }
    }

    /// Checks that the report was written for `member` and `declaration`.
    pub fn validate_for(
        &self,
        member: &MemberId,
        declaration: &DeclarationName,
    ) -> Result<(), ApiError> {
        if &self.member != member {
            return Err(ApiError::MemberMismatch {
                expected: member.clone(),
                actual: self.member.clone(),
            });
        }
        if &self.declaration != declaration {
            return Err(ApiError::DeclarationMismatch {
                expected: declaration.clone(),
                actual: self.declaration.clone(),
            });
        }
        if self.generation < 0 {
            return Err(ApiError::InvalidGeneration(self.generation));
        }
        Ok(())
    }
}

// =============================================================================
// Agent artifact
// =============================================================================

/// Reference to the agent deployment the classifier copy depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDeployment {
    pub namespace: String,
    pub image: String,
}

/// Scoped copy of a declaration's classification rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierCopy {
    pub generation: i64,
    pub spec_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classifier_labels: Vec<ClassifierLabel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ClassificationRule>,
}

/// Everything the controller places on a matched member for one declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentArtifact {
    pub name: DeclarationName,
    pub agent: AgentDeployment,
    pub classifier: ClassifierCopy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(s: &str) -> MemberId {
        s.parse().unwrap()
    }

    fn report() -> Report {
        Report {
            member: member("fleet/a"),
            declaration: "prod".parse().unwrap(),
            matching: true,
            generation: 3,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_match_state_serialization() {
        assert_eq!(
            serde_json::to_string(&MatchState::NotMatching).unwrap(),
            "\"not_matching\""
        );
        assert_eq!(MatchState::default(), MatchState::Unknown);
    }

    #[test]
    fn test_rule_tagged_serialization() {
        let rule = ClassificationRule::KubernetesVersion {
            comparison: VersionComparison::GreaterThanOrEqualTo,
            version: "1.27.0".to_string(),
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "kubernetes_version");
        assert_eq!(json["comparison"], "greater_than_or_equal_to");
    }

    #[test]
    fn test_report_validate_for() {
        let report = report();
        assert!(report
            .validate_for(&member("fleet/a"), &"prod".parse().unwrap())
            .is_ok());
        assert!(matches!(
            report.validate_for(&member("fleet/b"), &"prod".parse().unwrap()),
            Err(ApiError::MemberMismatch { .. })
        ));
        assert!(matches!(
            report.validate_for(&member("fleet/a"), &"dev".parse().unwrap()),
            Err(ApiError::DeclarationMismatch { .. })
        ));
    }

    #[test]
    fn test_status_skips_empty_fields() {
        let status = DeclarationStatus::default();
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"observed_generation": 0}));
    }

    #[test]
    fn test_declaration_roundtrip() {
        let mut decl = Declaration::new(
            "prod".parse().unwrap(),
            DeclarationSpec {
                cluster_selector: "env=prod".to_string(),
                ..Default::default()
            },
        );
        decl.status
            .matching_cluster_statuses
            .push(MemberMatchStatus::unknown(member("fleet/a")));

        let json = serde_json::to_string(&decl).unwrap();
        let parsed: Declaration = serde_json::from_str(&json).unwrap();
        assert_eq!(decl, parsed);
    }
}
