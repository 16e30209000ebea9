//! Client for the upstream repository traffic API.
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("trafficstats/", env!("CARGO_PKG_VERSION"));

use crate::record::RecordKind;
use crate::types::{Credential, OwnerKind};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(#[from] reqwest::Error),
    #[error("upstream rejected request for {path}: {status}")]
    Rejected { status: StatusCode, path: String },
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RepoMetadata {
    pub star_count: u32,
}

/// Remote source of traffic data. Every call is a single round trip; nothing
/// is retried within a sync cycle.
#[async_trait]
pub trait TrafficSource: Send + Sync {
    /// Raw daily clone entries. Normalization is left to the caller.
    async fn fetch_clones(
        &self,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<Vec<Value>, SourceError>;

    async fn fetch_views(
        &self,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<Vec<Value>, SourceError>;

    async fn fetch_metadata(
        &self,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<RepoMetadata, SourceError>;
}

#[derive(Deserialize)]
struct TrafficPayload {
    #[serde(alias = "clones", alias = "views")]
    entries: Vec<Value>,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    stargazers_count: u64,
}

/// Builds the `owner/name` path for a tracked repository.
pub fn resolve_repo_path(
    repository_id: &str,
    owner_kind: OwnerKind,
    credential: &Credential,
) -> String {
    if repository_id.contains('/') {
        return repository_id.to_string();
    }

    let owner = match (owner_kind, &credential.organization) {
        (OwnerKind::Individual, _) => &credential.identity,
        (OwnerKind::Organization, Some(org)) => org,
        (OwnerKind::Organization, None) => {
            tracing::warn!(
                repository = repository_id,
                "organization repository but no organization configured, using individual owner"
            );
            &credential.identity
        }
    };
    format!("{owner}/{repository_id}")
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: Url,
}

impl GitHubClient {
    pub fn new(api_url: Url, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(GitHubClient { client, api_url })
    }

    fn url(&self, repository_path: &str, tail: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SourceError::MalformedResponse(format!("invalid api url: {}", self.api_url))
            })?
            .pop_if_empty()
            .push("repos")
            .extend(repository_path.split('/'))
            .extend(tail);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: Url,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&credential.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Rejected {
                status,
                path: repository_path.to_string(),
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| SourceError::MalformedResponse(format!("{repository_path}: {e}")))
    }

    async fn fetch_traffic(
        &self,
        repository_path: &str,
        kind: RecordKind,
        credential: &Credential,
    ) -> Result<Vec<Value>, SourceError> {
        let segment = match kind {
            RecordKind::Clone => "clones",
            RecordKind::View => "views",
        };
        let url = self.url(repository_path, &["traffic", segment])?;
        let payload: TrafficPayload = self.get(url, repository_path, credential).await?;
        Ok(payload.entries)
    }
}

#[async_trait]
impl TrafficSource for GitHubClient {
    async fn fetch_clones(
        &self,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<Vec<Value>, SourceError> {
        self.fetch_traffic(repository_path, RecordKind::Clone, credential)
            .await
    }

    async fn fetch_views(
        &self,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<Vec<Value>, SourceError> {
        self.fetch_traffic(repository_path, RecordKind::View, credential)
            .await
    }

    async fn fetch_metadata(
        &self,
        repository_path: &str,
        credential: &Credential,
    ) -> Result<RepoMetadata, SourceError> {
        let url = self.url(repository_path, &[])?;
        let payload: RepositoryPayload = self.get(url, repository_path, credential).await?;
        let star_count = u32::try_from(payload.stargazers_count).map_err(|_| {
            SourceError::MalformedResponse(format!(
                "{repository_path}: star count out of range: {}",
                payload.stargazers_count
            ))
        })?;
        Ok(RepoMetadata { star_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential::new("octocat", "t0ken")
    }

    async fn client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(Url::parse(&server.uri()).unwrap(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_resolve_repo_path() {
        let user = credential();
        let org = credential().with_organization("acme");

        assert_eq!(resolve_repo_path("other/repo", OwnerKind::Organization, &org), "other/repo");
        assert_eq!(resolve_repo_path("repo", OwnerKind::Individual, &org), "octocat/repo");
        assert_eq!(resolve_repo_path("repo", OwnerKind::Organization, &org), "acme/repo");
        // No organization configured falls back to the individual owner
        assert_eq!(resolve_repo_path("repo", OwnerKind::Organization, &user), "octocat/repo");
    }

    #[tokio::test]
    async fn test_fetch_traffic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello/traffic/clones"))
            .and(header("authorization", "Bearer t0ken"))
            .and(header("accept", "application/vnd.github+json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 7,
                "uniques": 3,
                "clones": [
                    { "timestamp": "2024-01-01T00:00:00Z", "count": 5, "uniques": 2 },
                    { "timestamp": "2024-01-02T00:00:00Z", "count": 2, "uniques": 1 }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello/traffic/views"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "count": 0, "uniques": 0, "views": []
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "full_name": "octocat/hello",
                "stargazers_count": 42
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let clones = client.fetch_clones("octocat/hello", &credential()).await.unwrap();
        assert_eq!(clones.len(), 2);
        assert_eq!(clones[0]["count"], 5);
        assert!(client.fetch_views("octocat/hello", &credential()).await.unwrap().is_empty());
        assert_eq!(
            client.fetch_metadata("octocat/hello", &credential()).await.unwrap(),
            RepoMetadata { star_count: 42 }
        );
    }

    #[tokio::test]
    async fn test_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "message": "Not Found" })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .fetch_views("octocat/missing", &credential())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::Rejected {
                status: StatusCode::NOT_FOUND,
                ref path
            } if path == "octocat/missing"
        ));
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello/traffic/clones"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "hello" })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        assert!(matches!(
            client.fetch_clones("octocat/hello", &credential()).await,
            Err(SourceError::MalformedResponse(_))
        ));
        assert!(matches!(
            client.fetch_metadata("octocat/hello", &credential()).await,
            Err(SourceError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let client =
            GitHubClient::new(Url::parse("http://127.0.0.1:1").unwrap(), Duration::from_secs(1))
                .unwrap();
        assert!(matches!(
            client.fetch_clones("octocat/hello", &credential()).await,
            Err(SourceError::Unavailable(_))
        ));
    }
}
