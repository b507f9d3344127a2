//! Shared fixtures: an in-memory fleet driven through the real reconciler.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetclass_api::{Declaration, DeclarationSpec, Member, Report};
use fleetclass_controller::controller::{AttemptSummary, ClassifierReconciler, ReconcilerConfig};
use fleetclass_controller::fleet::{FakeMemberClient, InMemoryCatalog};
use fleetclass_controller::store::{DeclarationStore, InMemoryDeclarationStore};
use fleetclass_names::{DeclarationName, MemberId};

pub struct Fleet {
    pub store: Arc<InMemoryDeclarationStore>,
    pub catalog: Arc<InMemoryCatalog>,
    pub client: Arc<FakeMemberClient>,
    pub reconciler: ClassifierReconciler,
}

pub fn member_id(s: &str) -> MemberId {
    s.parse().unwrap()
}

pub fn decl_name(s: &str) -> DeclarationName {
    s.parse().unwrap()
}

pub fn member(id: &str, labels: &[(&str, &str)]) -> Member {
    Member {
        id: member_id(id),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        api_url: format!("http://{}.members.invalid", id.replace('/', "-")),
    }
}

pub fn test_config() -> ReconcilerConfig {
    ReconcilerConfig {
        member_timeout: Duration::from_millis(500),
        attempt_deadline: Duration::from_secs(5),
        ..ReconcilerConfig::default()
    }
}

impl Fleet {
    pub fn new(members: Vec<Member>) -> Self {
        Self::with_config(members, test_config())
    }

    pub fn with_config(members: Vec<Member>, config: ReconcilerConfig) -> Self {
        let store = Arc::new(InMemoryDeclarationStore::new());
        let catalog = Arc::new(InMemoryCatalog::new(members));
        let client = Arc::new(FakeMemberClient::new());
        let reconciler =
            ClassifierReconciler::new(store.clone(), catalog.clone(), client.clone(), config);
        Self {
            store,
            catalog,
            client,
            reconciler,
        }
    }

    pub async fn declare(&self, name: &str, selector: &str) -> Declaration {
        self.store
            .create(Declaration::new(
                decl_name(name),
                DeclarationSpec {
                    cluster_selector: selector.to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap()
            .declaration
    }

    pub async fn reconcile(&self, name: &str) -> AttemptSummary {
        self.reconciler.reconcile(&decl_name(name)).await
    }

    pub async fn declaration(&self, name: &str) -> Option<Declaration> {
        self.store
            .get(&decl_name(name))
            .await
            .unwrap()
            .map(|s| s.declaration)
    }

    /// Have the agent on `member` report for `name` at `generation`.
    pub fn report(&self, member: &str, name: &str, matching: bool, generation: i64) {
        self.client.put_report(Report {
            member: member_id(member),
            declaration: decl_name(name),
            matching,
            generation,
            timestamp: Utc::now(),
        });
    }

    /// Have every member holding the artifact for `name` report on the
    /// generation it was given.
    pub fn agents_report(&self, members: &[&str], name: &str, matching: bool) {
        for m in members {
            if let Some(artifact) = self.client.artifact(&member_id(m), &decl_name(name)) {
                self.report(m, name, matching, artifact.classifier.generation);
            }
        }
    }

    pub fn has_artifact(&self, member: &str, name: &str) -> bool {
        self.client.has_artifact(&member_id(member), &decl_name(name))
    }
}

/// Member ids listed in the declaration's match statuses, in order.
pub fn matched_members(declaration: &Declaration) -> Vec<String> {
    declaration
        .status
        .matching_cluster_statuses
        .iter()
        .map(|s| s.member.to_string())
        .collect()
}
