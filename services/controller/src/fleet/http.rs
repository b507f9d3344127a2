//! HTTP client for member remote-object APIs.
//!
//! Endpoints, relative to `Member::api_url`:
//! - `GET|PUT|DELETE /v1/classifiers/{name}` for the agent artifact
//! - `GET /v1/classifierreports/{name}` for the agent's report

use std::time::Duration;

use async_trait::async_trait;
use fleetclass_api::{AgentArtifact, Member, Report};
use fleetclass_names::DeclarationName;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{MemberClient, MemberError};

/// Member client speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMemberClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpMemberClient {
    /// Create a client whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, MemberError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemberError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    fn artifact_url(member: &Member, name: &DeclarationName) -> String {
        format!(
            "{}/v1/classifiers/{}",
            member.api_url.trim_end_matches('/'),
            name
        )
    }

    fn report_url(member: &Member, name: &DeclarationName) -> String {
        format!(
            "{}/v1/classifierreports/{}",
            member.api_url.trim_end_matches('/'),
            name
        )
    }

    fn map_send_error(&self, err: reqwest::Error) -> MemberError {
        if err.is_timeout() {
            MemberError::Timeout(self.timeout)
        } else {
            MemberError::Unreachable(err.to_string())
        }
    }

    async fn get_optional<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, MemberError> {
        debug!(url = %url, "Fetching from member");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;

        let body = response
            .json::<T>()
            .await
            .map_err(|e| MemberError::Decode(e.to_string()))?;
        Ok(Some(body))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MemberError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(MemberError::Rejected { status, body })
}

#[async_trait]
impl MemberClient for HttpMemberClient {
    async fn get_artifact(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<Option<AgentArtifact>, MemberError> {
        self.get_optional(&Self::artifact_url(member, name)).await
    }

    async fn apply_artifact(
        &self,
        member: &Member,
        artifact: &AgentArtifact,
    ) -> Result<(), MemberError> {
        let url = Self::artifact_url(member, &artifact.name);
        debug!(url = %url, "Applying artifact on member");
        let response = self
            .client
            .put(&url)
            .json(artifact)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_artifact(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<(), MemberError> {
        let url = Self::artifact_url(member, name);
        debug!(url = %url, "Deleting artifact on member");
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        // Already gone.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn get_report(
        &self,
        member: &Member,
        name: &DeclarationName,
    ) -> Result<Option<Report>, MemberError> {
        self.get_optional(&Self::report_url(member, name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_urls_trim_trailing_slash() {
        let member = Member {
            id: "fleet/a".parse().unwrap(),
            labels: BTreeMap::new(),
            api_url: "https://a.example/".to_string(),
        };
        let name: DeclarationName = "prod".parse().unwrap();
        assert_eq!(
            HttpMemberClient::artifact_url(&member, &name),
            "https://a.example/v1/classifiers/prod"
        );
        assert_eq!(
            HttpMemberClient::report_url(&member, &name),
            "https://a.example/v1/classifierreports/prod"
        );
    }
}
