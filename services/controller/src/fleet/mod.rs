//! Member cluster interfaces.
//!
//! - [`MemberCatalog`] lists the member clusters and their selectable labels
//! - [`MemberClient`] talks to one member's remote-object API: it places and
//!   removes the agent artifact and reads the agent's latest report
//!
//! A fake client is provided for tests and local development.

mod fake;
mod http;

pub use fake::FakeMemberClient;
pub use http::HttpMemberClient;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fleetclass_api::{AgentArtifact, Member, Report};
use fleetclass_names::{DeclarationName, MemberId};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from a single remote operation against one member.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemberError {
    /// The member could not be reached.
    #[error("member unreachable: {0}")]
    Unreachable(String),

    /// The operation did not finish in time.
    #[error("member did not answer within {0:?}")]
    Timeout(Duration),

    /// The member answered with an error status.
    #[error("member rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The member answered with a body that could not be decoded.
    #[error("invalid response from member: {0}")]
    Decode(String),
}

/// Errors from the member catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("member catalog unavailable: {0}")]
    Unavailable(String),

    #[error("invalid catalog entry: {0}")]
    InvalidEntry(String),
}

/// Source of member clusters.
#[async_trait]
pub trait MemberCatalog: Send + Sync {
    /// List all members, sorted by id.
    async fn list_members(&self) -> Result<Vec<Member>, CatalogError>;
}

/// Remote-object API of a member cluster.
#[async_trait]
pub trait MemberClient: Send + Sync {
    /// Read the artifact placed for `name`, if any.
    async fn get_artifact(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<Option<AgentArtifact>, MemberError>;

    /// Create or replace the artifact.
    async fn apply_artifact(&self, member: &Member, artifact: &AgentArtifact)
        -> Result<(), MemberError>;

    /// Remove the artifact. Removing an absent artifact succeeds.
    async fn delete_artifact(&self, member: &Member, name: &DeclarationName)
        -> Result<(), MemberError>;

    /// Read the agent's latest report for `name`, if any.
    async fn get_report(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<Option<Report>, MemberError>;
}

/// Catalog held in memory.
#[derive(Default)]
pub struct InMemoryCatalog {
    members: RwLock<BTreeMap<MemberId, Member>>,
}

impl InMemoryCatalog {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: RwLock::new(members.into_iter().map(|m| (m.id.clone(), m)).collect()),
        }
    }

    /// Add or replace a member.
    pub async fn upsert(&self, member: Member) {
        self.members.write().await.insert(member.id.clone(), member);
    }

    /// Remove a member. Returns false if it was not present.
    pub async fn remove(&self, id: &MemberId) -> bool {
        self.members.write().await.remove(id).is_some()
    }

    /// Replace the labels of a member.
    pub async fn set_labels(&self, id: &MemberId, labels: BTreeMap<String, String>) -> bool {
        match self.members.write().await.get_mut(id) {
            Some(member) => {
                member.labels = labels;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl MemberCatalog for InMemoryCatalog {
    async fn list_members(&self) -> Result<Vec<Member>, CatalogError> {
        Ok(self.members.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, env: &str) -> Member {
        Member {
            id: id.parse().unwrap(),
            labels: BTreeMap::from([("env".to_string(), env.to_string())]),
            api_url: format!("http://{}.invalid", id.replace('/', "-")),
        }
    }

    #[tokio::test]
    async fn test_catalog_lists_sorted() {
        let catalog = InMemoryCatalog::new([member("b/two", "prod"), member("a/one", "dev")]);
        let ids: Vec<String> = catalog
            .list_members()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a/one", "b/two"]);
    }

    #[tokio::test]
    async fn test_catalog_set_labels_and_remove() {
        let catalog = InMemoryCatalog::new([member("a/one", "dev")]);
        let id: MemberId = "a/one".parse().unwrap();

        assert!(catalog.set_labels(&id, BTreeMap::new()).await);
        assert!(catalog.list_members().await.unwrap()[0].labels.is_empty());

        assert!(catalog.remove(&id).await);
        assert!(!catalog.remove(&id).await);
    }
}
