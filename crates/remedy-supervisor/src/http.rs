//! HTTP adapters for the external collaborators.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use remedy_core::types::{Action, CorrelationContext, CorrelationId, Diagnosis, ObservedState, TargetRef};
use remedy_core::{ObserveError, ReasoningError, TargetError};

use crate::collaborator::{
    AnalysisRequest, AppliedAction, ObservedStateSource, ReasoningEngine, Recommendation,
    RecommendationRequest, TargetSystem,
};

/// Build the shared client. `timeout` caps every request end to end.
pub fn build_client(timeout: Option<Duration>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ── Reasoning ─────────────────────────────────────────────────────

pub struct HttpReasoningEngine {
    client: Client,
    base_url: String,
}

impl HttpReasoningEngine {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ReasoningError>
    where
        B: Serialize + Sync,
        T: for<'de> Deserialize<'de>,
    {
        let response = self
            .client
            .post(endpoint(&self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| ReasoningError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                ReasoningError::Unavailable(format!("{status}: {text}"))
            } else {
                ReasoningError::Internal(format!("{status}: {text}"))
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ReasoningEngine for HttpReasoningEngine {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Diagnosis, ReasoningError> {
        self.post("v1/analyze", request).await
    }

    async fn recommend(
        &self,
        request: &RecommendationRequest,
    ) -> Result<Recommendation, ReasoningError> {
        self.post("v1/recommend", request).await
    }
}

// ── Target system ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    correlation_id: CorrelationId,
    action: &'a Action,
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpTargetSystem {
    client: Client,
    base_url: String,
}

impl HttpTargetSystem {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

/// Map a non-success status to the target error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> TargetError {
    let detail = format!("{status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        TargetError::Transient(detail)
    } else if status == StatusCode::NOT_FOUND {
        TargetError::NotFound(detail)
    } else {
        TargetError::Rejected(detail)
    }
}

#[async_trait]
impl TargetSystem for HttpTargetSystem {
    async fn apply(
        &self,
        action: &Action,
        correlation: &CorrelationContext,
    ) -> Result<AppliedAction, TargetError> {
        let request = ExecuteRequest {
            correlation_id: correlation.correlation_id,
            action,
            dry_run: false,
        };
        let response = self
            .client
            .post(endpoint(&self.base_url, "v1/execute"))
            .json(&request)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| TargetError::Rejected(format!("unreadable response: {e}")))?;
        if !body.success {
            return Err(TargetError::Rejected(
                body.message
                    .unwrap_or_else(|| "target reported failure".to_string()),
            ));
        }
        Ok(AppliedAction {
            detail: body.detail,
        })
    }
}

// ── Observed state ────────────────────────────────────────────────

pub struct HttpObservedStateSource {
    client: Client,
    base_url: String,
}

impl HttpObservedStateSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

fn target_path(target: &TargetRef) -> String {
    format!(
        "v1/targets/{}/{}/{}",
        target.kind,
        target.namespace.as_deref().unwrap_or("_"),
        target.name
    )
}

#[async_trait]
impl ObservedStateSource for HttpObservedStateSource {
    async fn observe(&self, target: &TargetRef) -> Result<ObservedState, ObserveError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, &target_path(target)))
            .send()
            .await
            .map_err(|e| ObserveError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObserveError::Unreachable(format!(
                "{status} observing {target}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ObserveError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "no such deployment"),
            TargetError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            TargetError::Rejected(_)
        ));
    }

    #[test]
    fn target_paths() {
        let scoped = TargetRef::namespaced("Deployment", "shop", "checkout");
        assert_eq!(target_path(&scoped), "v1/targets/Deployment/shop/checkout");

        let cluster = TargetRef {
            kind: "Node".to_string(),
            name: "worker-3".to_string(),
            namespace: None,
        };
        assert_eq!(target_path(&cluster), "v1/targets/Node/_/worker-3");
    }

    #[test]
    fn endpoint_joins_cleanly() {
        assert_eq!(
            endpoint("http://localhost:8000/", "/v1/analyze"),
            "http://localhost:8000/v1/analyze"
        );
    }

    #[test]
    fn execute_request_shape() {
        let action = Action::new(
            "restart",
            TargetRef::namespaced("Deployment", "shop", "checkout"),
            remedy_core::types::ImpactLevel::Low,
        );
        let json = serde_json::to_value(ExecuteRequest {
            correlation_id: CorrelationId::new(),
            action: &action,
            dry_run: false,
        })
        .unwrap();
        assert_eq!(json["dry_run"], false);
        assert_eq!(json["action"]["action_type"], "restart");
    }
}
