//! Fake member client for testing and development.
//!
//! Keeps artifacts and reports per member in memory and lets tests make
//! individual members unreachable, slow, or unable to delete.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fleetclass_api::{AgentArtifact, Member, Report};
use fleetclass_names::{DeclarationName, MemberId};
use tracing::debug;

use super::{MemberClient, MemberError};

#[derive(Debug, Default, Clone)]
struct FakeMember {
    artifacts: BTreeMap<DeclarationName, AgentArtifact>,
    reports: BTreeMap<DeclarationName, Report>,
    unreachable: bool,
    reject_deletes: bool,
    latency: Option<Duration>,
    applies: u32,
    deletes: u32,
}

/// In-memory stand-in for the member remote-object API.
#[derive(Debug, Default)]
pub struct FakeMemberClient {
    members: Mutex<HashMap<MemberId, FakeMember>>,
}

impl FakeMemberClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MemberId, FakeMember>> {
        self.members
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store a report as if the agent on `report.member` had written it.
    pub fn put_report(&self, report: Report) {
        self.lock()
            .entry(report.member.clone())
            .or_default()
            .reports
            .insert(report.declaration.clone(), report);
    }

    /// Store an artifact directly, bypassing the controller.
    pub fn put_artifact(&self, member: &MemberId, artifact: AgentArtifact) {
        self.lock()
            .entry(member.clone())
            .or_default()
            .artifacts
            .insert(artifact.name.clone(), artifact);
    }

    pub fn set_unreachable(&self, member: &MemberId, unreachable: bool) {
        self.lock().entry(member.clone()).or_default().unreachable = unreachable;
    }

    /// Make artifact deletion on `member` fail while leaving other calls working.
    pub fn set_reject_deletes(&self, member: &MemberId, reject: bool) {
        self.lock().entry(member.clone()).or_default().reject_deletes = reject;
    }

    /// Delay every call to `member`.
    pub fn set_latency(&self, member: &MemberId, latency: Option<Duration>) {
        self.lock().entry(member.clone()).or_default().latency = latency;
    }

    pub fn artifact(&self, member: &MemberId, name: &DeclarationName) -> Option<AgentArtifact> {
        self.lock()
            .get(member)
            .and_then(|m| m.artifacts.get(name).cloned())
    }

    pub fn has_artifact(&self, member: &MemberId, name: &DeclarationName) -> bool {
        self.artifact(member, name).is_some()
    }

    /// Number of apply calls that reached `member`.
    pub fn apply_count(&self, member: &MemberId) -> u32 {
        self.lock().get(member).map_or(0, |m| m.applies)
    }

    /// Number of delete calls that reached `member`.
    pub fn delete_count(&self, member: &MemberId) -> u32 {
        self.lock().get(member).map_or(0, |m| m.deletes)
    }

    /// Waits for the configured latency and fails if the member is unreachable.
    async fn enter(&self, member: &Member) -> Result<(), MemberError> {
        let (latency, unreachable) = {
            let members = self.lock();
            let state = members.get(&member.id);
            (
                state.and_then(|m| m.latency),
                state.is_some_and(|m| m.unreachable),
            )
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return Err(MemberError::Unreachable(format!(
                "[FAKE] {} is unreachable",
                member.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MemberClient for FakeMemberClient {
    async fn get_artifact(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<Option<AgentArtifact>, MemberError> {
        self.enter(member).await?;
        Ok(self.artifact(&member.id, name))
    }

    async fn apply_artifact(
        &self,
        member: &Member,
        artifact: &AgentArtifact,
    ) -> Result<(), MemberError> {
        self.enter(member).await?;
        debug!(member = %member.id, declaration = %artifact.name, "[FAKE] Applying artifact");
        let mut members = self.lock();
        let state = members.entry(member.id.clone()).or_default();
        state.applies += 1;
        state
            .artifacts
            .insert(artifact.name.clone(), artifact.clone());
        Ok(())
    }

    async fn delete_artifact(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<(), MemberError> {
        self.enter(member).await?;
        let mut members = self.lock();
        let state = members.entry(member.id.clone()).or_default();
        if state.reject_deletes {
            return Err(MemberError::Rejected {
                status: 500,
                body: "[FAKE] delete rejected".to_string(),
            });
        }
        debug!(member = %member.id, declaration = %name, "[FAKE] Deleting artifact");
        state.deletes += 1;
        state.artifacts.remove(name);
        Ok(())
    }

    async fn get_report(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<Option<Report>, MemberError> {
        self.enter(member).await?;
        Ok(self
            .lock()
            .get(&member.id)
            .and_then(|m| m.reports.get(name).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn member() -> Member {
        Member {
            id: "fleet/a".parse().unwrap(),
            labels: BTreeMap::new(),
            api_url: "http://fake".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fake_delete_absent_succeeds() {
        let client = FakeMemberClient::new();
        let name: DeclarationName = "prod".parse().unwrap();
        client.delete_artifact(&member(), &name).await.unwrap();
        assert_eq!(client.delete_count(&member().id), 1);
    }

    #[tokio::test]
    async fn test_fake_unreachable() {
        let client = FakeMemberClient::new();
        let name: DeclarationName = "prod".parse().unwrap();
        client.set_unreachable(&member().id, true);
        let result = client.get_report(&member(), &name).await;
        assert!(matches!(result, Err(MemberError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_fake_report_roundtrip() {
        let client = FakeMemberClient::new();
        let report = Report {
            member: member().id,
            declaration: "prod".parse().unwrap(),
            matching: true,
            generation: 1,
            timestamp: Utc::now(),
        };
        client.put_report(report.clone());
        let fetched = client
            .get_report(&member(), &report.declaration)
            .await
            .unwrap();
        assert_eq!(fetched, Some(report));
    }
}
