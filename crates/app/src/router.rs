use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use domain_verify_core::types::{Alert, Challenge, VerificationMethod};
use domain_verify_core::Instructions;
use domain_verify_storage::Database;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::ingest::WebhookIngestor;
use crate::issuer::{ChallengeIssuer, IssueError, IssueRequest};
use crate::problem::ProblemResponse;
use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    issuer: ChallengeIssuer,
    ingestor: WebhookIngestor,
    webhook_secret: Option<Arc<[u8]>>,
    http_probe_scheme: Arc<str>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        issuer: ChallengeIssuer,
        ingestor: WebhookIngestor,
        webhook_secret: Option<Arc<[u8]>>,
        http_probe_scheme: Arc<str>,
    ) -> Self {
        Self {
            metrics,
            storage,
            issuer,
            ingestor,
            webhook_secret,
            http_probe_scheme,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn issuer(&self) -> &ChallengeIssuer {
        &self.issuer
    }

    pub fn ingestor(&self) -> &WebhookIngestor {
        &self.ingestor
    }

    pub fn webhook_secret(&self) -> Option<Arc<[u8]>> {
        self.webhook_secret.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/challenges", post(issue_challenge))
        .route("/challenges/:id", get(get_challenge))
        .route("/challenges/:id/alerts", get(list_alerts))
        .route("/webhooks/propagation", post(webhook::handle))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueBody {
    domain_mapping_id: String,
    method: String,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    provider_reference_id: Option<String>,
    /// Answer with the active challenge instead of a conflict.
    #[serde(default)]
    reuse_existing: bool,
}

/// Challenge plus what the owner must publish to satisfy it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeView {
    #[serde(flatten)]
    challenge: Challenge,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<Instructions>,
}

async fn issue_challenge(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let body: IssueBody = serde_json::from_slice(&body).map_err(|err| {
        ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_payload",
            format!("failed to parse payload: {err}"),
        )
    })?;
    let method = body.method.parse::<VerificationMethod>().map_err(|err| {
        ProblemResponse::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_method", err.to_string())
    })?;
    if body.domain_mapping_id.trim().is_empty() {
        return Err(ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_payload",
            "domainMappingId must not be empty",
        ));
    }

    let request = IssueRequest {
        domain_mapping_id: body.domain_mapping_id,
        method,
        provider: body.provider.filter(|value| !value.trim().is_empty()),
        provider_reference_id: body
            .provider_reference_id
            .filter(|value| !value.trim().is_empty()),
    };

    let (status, result) = if body.reuse_existing {
        (StatusCode::OK, state.issuer().issue_or_reuse(request).await)
    } else {
        (StatusCode::CREATED, state.issuer().issue(request).await)
    };

    match result {
        Ok(challenge) => {
            let view = render(&state, challenge).await;
            Ok((status, Json(view)).into_response())
        }
        Err(IssueError::NotFound) => Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "mapping_not_found",
            "domain mapping does not exist",
        )),
        Err(IssueError::Conflict(existing)) => {
            let view = render(&state, *existing).await;
            let problem = ProblemResponse::new(
                StatusCode::CONFLICT,
                "challenge_exists",
                "an active challenge already exists for this mapping and method",
            );
            Err(match serde_json::to_value(view) {
                Ok(value) => problem.with_challenge(value),
                Err(_) => problem,
            })
        }
        Err(IssueError::ProviderReferenceTaken) => Err(ProblemResponse::new(
            StatusCode::CONFLICT,
            "provider_reference_taken",
            "provider reference is already bound to another challenge",
        )),
        Err(err @ (IssueError::Registry(_) | IssueError::Storage(_))) => {
            error!(stage = "issuer", error = %err, "failed to issue challenge");
            Err(ProblemResponse::internal("failed to issue challenge"))
        }
    }
}

async fn get_challenge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChallengeView>, ProblemResponse> {
    let challenge = load_challenge(&state, &id).await?;
    Ok(Json(render(&state, challenge).await))
}

async fn list_alerts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Alert>>, ProblemResponse> {
    load_challenge(&state, &id).await?;
    let alerts = state
        .storage()
        .alerts()
        .list_for_challenge(&id)
        .await
        .map_err(|err| {
            error!(stage = "alerts", challenge_id = %id, error = %err, "failed to list alerts");
            ProblemResponse::internal("failed to list alerts")
        })?;
    Ok(Json(alerts))
}

async fn load_challenge(state: &AppState, id: &str) -> Result<Challenge, ProblemResponse> {
    state
        .storage()
        .challenges()
        .fetch(id)
        .await
        .map_err(|err| {
            error!(stage = "storage", challenge_id = %id, error = %err, "failed to load challenge");
            ProblemResponse::internal("failed to load challenge")
        })?
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::NOT_FOUND,
                "challenge_not_found",
                format!("challenge {id} does not exist"),
            )
        })
}

async fn render(state: &AppState, challenge: Challenge) -> ChallengeView {
    let instructions = match state
        .storage()
        .domain_mappings()
        .fetch(&challenge.domain_mapping_id)
        .await
    {
        Ok(Some(mapping)) => Some(
            challenge
                .target
                .describe_instructions(&mapping.domain, &state.http_probe_scheme),
        ),
        Ok(None) => None,
        Err(err) => {
            warn!(stage = "storage", challenge_id = %challenge.id, error = %err, "failed to load mapping for instructions");
            None
        }
    };
    ChallengeView {
        challenge,
        instructions,
    }
}
