//! The credential service endpoints consumed by the client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::storage::CredentialStorage;
use crate::types::{AttestationResponse, AttestationSubmission, Group};
use crate::verifier::Verifier;
use crate::wire::{export_active, GroupTreeList};

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[async_trait]
pub trait CredentialApi: Send + Sync {
    /// `GET /groups`
    async fn groups(&self) -> Result<Vec<Group>, ApiError>;

    /// `GET /trees`: every active tree with its Bloom filter, no layers.
    async fn tree_filters(&self) -> Result<GroupTreeList, ApiError>;

    /// `GET /trees?ids=...`: full trees for the given ids.
    async fn trees(&self, tree_ids: &[String]) -> Result<GroupTreeList, ApiError>;

    /// `POST /attestations`
    async fn submit_attestation(
        &self,
        submission: &AttestationSubmission,
    ) -> Result<AttestationResponse, ApiError>;
}

/// HTTP client for a remote credential service.
pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Http(format!("status {status}: {body}")))
    }

    async fn fetch_trees(&self, request: reqwest::RequestBuilder) -> Result<GroupTreeList, ApiError> {
        let response = request
            .header(reqwest::header::ACCEPT, PROTOBUF_CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        let bytes = Self::checked(response)
            .await?
            .bytes()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        GroupTreeList::from_bytes(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CredentialApi for HttpApi {
    async fn groups(&self) -> Result<Vec<Group>, ApiError> {
        let response = self
            .client
            .get(self.url("/groups"))
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn tree_filters(&self) -> Result<GroupTreeList, ApiError> {
        self.fetch_trees(self.client.get(self.url("/trees"))).await
    }

    async fn trees(&self, tree_ids: &[String]) -> Result<GroupTreeList, ApiError> {
        let ids = tree_ids.join(",");
        self.fetch_trees(self.client.get(self.url("/trees")).query(&[("ids", ids)]))
            .await
    }

    async fn submit_attestation(
        &self,
        submission: &AttestationSubmission,
    ) -> Result<AttestationResponse, ApiError> {
        let response = self
            .client
            .post(self.url("/attestations"))
            .json(submission)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Self::checked(response)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Serves the endpoints in-process from local storage.
///
/// Used by the offline prover and by tests. Trees go through the same
/// protobuf encoding a remote service would send.
pub struct LocalApi {
    storage: Arc<dyn CredentialStorage>,
    groups: Vec<Group>,
    verifier: Arc<Verifier>,
}

impl LocalApi {
    pub fn new(storage: Arc<dyn CredentialStorage>, groups: Vec<Group>, verifier: Arc<Verifier>) -> Self {
        Self {
            storage,
            groups,
            verifier,
        }
    }

    async fn export(&self, tree_ids: Option<&[String]>) -> Result<GroupTreeList, ApiError> {
        let list = export_active(self.storage.as_ref(), &self.groups, tree_ids)
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;
        GroupTreeList::from_bytes(&list.to_bytes()).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CredentialApi for LocalApi {
    async fn groups(&self) -> Result<Vec<Group>, ApiError> {
        Ok(self.groups.clone())
    }

    async fn tree_filters(&self) -> Result<GroupTreeList, ApiError> {
        self.export(None).await
    }

    async fn trees(&self, tree_ids: &[String]) -> Result<GroupTreeList, ApiError> {
        self.export(Some(tree_ids)).await
    }

    async fn submit_attestation(
        &self,
        submission: &AttestationSubmission,
    ) -> Result<AttestationResponse, ApiError> {
        self.verifier
            .respond(submission)
            .await
            .map_err(|e| ApiError::Http(e.to_string()))
    }
}
