//! Request/response channel: the workflow REST surface.
//!
//! Every mutating call returns the full updated snapshot wrapped in an
//! envelope; the engine merges it through the same version gate as push
//! updates, so a response racing a push frame can never roll state back.
//! Calls may be pending indefinitely — nothing here retries or blocks
//! beyond the single awaited request.

use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::model::{Approval, SchemaField, UrlInfo, WorkflowPhase, WorkflowSnapshot, WorkflowTransition};

/// Envelope the backend wraps mutating responses in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEnvelope {
    pub success: bool,
    pub workflow: WorkflowSnapshot,
    #[serde(default)]
    pub message: Option<String>,
}

/// Transition request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub target_phase: WorkflowPhase,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Approval resolution body — the request/response half of the
/// dual-channel submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approval_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Transition history response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHistory {
    #[serde(default)]
    pub transitions: Vec<WorkflowTransition>,
    #[serde(default)]
    pub approvals: Vec<Approval>,
}

/// Typed client for the workflow endpoints.
#[derive(Clone)]
pub struct WorkflowApi {
    client: reqwest::Client,
    base_url: String,
}

impl WorkflowApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, pipeline_id: &str, suffix: &str) -> String {
        format!("{}/workflow/{}{}", self.base_url, pipeline_id, suffix)
    }

    /// Fetch the full workflow state by pipeline id.
    pub async fn fetch_workflow(&self, pipeline_id: &str) -> Result<WorkflowSnapshot, ApiError> {
        let resp = self.client.get(self.url(pipeline_id, "")).send().await?;
        Self::decode(resp).await
    }

    /// Submit the URL list; returns the full updated snapshot.
    pub async fn update_urls(
        &self,
        pipeline_id: &str,
        urls: &[UrlInfo],
    ) -> Result<WorkflowSnapshot, ApiError> {
        let resp = self
            .client
            .post(self.url(pipeline_id, "/urls"))
            .json(urls)
            .send()
            .await?;
        Ok(Self::decode::<WorkflowEnvelope>(resp).await?.workflow)
    }

    /// Submit the schema field list; returns the full updated snapshot.
    pub async fn update_schema(
        &self,
        pipeline_id: &str,
        fields: &[SchemaField],
    ) -> Result<WorkflowSnapshot, ApiError> {
        let resp = self
            .client
            .post(self.url(pipeline_id, "/schema"))
            .json(fields)
            .send()
            .await?;
        Ok(Self::decode::<WorkflowEnvelope>(resp).await?.workflow)
    }

    /// Submit a transition request; returns the full updated snapshot.
    pub async fn transition(
        &self,
        pipeline_id: &str,
        request: &TransitionRequest,
    ) -> Result<WorkflowSnapshot, ApiError> {
        let resp = self
            .client
            .post(self.url(pipeline_id, "/transition"))
            .json(request)
            .send()
            .await?;
        Ok(Self::decode::<WorkflowEnvelope>(resp).await?.workflow)
    }

    /// Submit an approval resolution; returns the full updated snapshot.
    pub async fn approve(
        &self,
        pipeline_id: &str,
        decision: &ApprovalDecision,
    ) -> Result<WorkflowSnapshot, ApiError> {
        let resp = self
            .client
            .post(self.url(pipeline_id, "/approve"))
            .json(decision)
            .send()
            .await?;
        Ok(Self::decode::<WorkflowEnvelope>(resp).await?.workflow)
    }

    /// Fetch the transition history.
    pub async fn history(&self, pipeline_id: &str) -> Result<WorkflowHistory, ApiError> {
        let resp = self
            .client
            .get(self.url(pipeline_id, "/history"))
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }
}
