use chrono::Duration as ChronoDuration;
use domain_verify_core::types::{PropagationState, ProviderEvent, Transition, TransitionRejected};
use domain_verify_core::RetryPolicy;
use domain_verify_storage::{ChallengeError, ChallengeRepository, CommitOutcome};
use metrics::counter;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::alerts::AlertEmitter;
use crate::Clock;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("no challenge matches the provider reference")]
    NotFound,
    #[error(transparent)]
    Storage(#[from] ChallengeError),
}

/// What happened to an accepted provider event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied(Transition),
    /// Same status as the previous event inside the dedupe window.
    Duplicate,
    /// The challenge is already VERIFIED or FAILED.
    Terminal,
    /// A concurrent writer committed first.
    Discarded,
}

impl IngestOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Duplicate => "duplicate",
            Self::Terminal => "terminal",
            Self::Discarded => "discarded",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropagationPayload {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    provider_reference_id: Option<String>,
    status: String,
    #[serde(default)]
    detail: Option<String>,
}

/// Parses a provider webhook body.
///
/// Malformed JSON and unknown statuses are validation errors; a missing or
/// blank reference cannot match any challenge and is reported as not found.
pub fn parse_event(body: &[u8]) -> Result<ProviderEvent, IngestError> {
    let payload: PropagationPayload = serde_json::from_slice(body)
        .map_err(|err| IngestError::Validation(format!("failed to parse payload: {err}")))?;
    let status = payload
        .status
        .parse::<PropagationState>()
        .map_err(|err| IngestError::Validation(err.to_string()))?;
    let provider_reference_id = payload
        .provider_reference_id
        .filter(|reference| !reference.trim().is_empty())
        .ok_or(IngestError::NotFound)?;

    Ok(ProviderEvent {
        provider: payload.provider,
        provider_reference_id,
        status,
        detail: payload.detail,
    })
}

/// Applies provider propagation events to the challenges they reference.
#[derive(Clone)]
pub struct WebhookIngestor {
    challenges: ChallengeRepository,
    alerts: AlertEmitter,
    policy: RetryPolicy,
    dedupe_window: ChronoDuration,
    clock: Clock,
}

impl WebhookIngestor {
    pub fn new(
        challenges: ChallengeRepository,
        alerts: AlertEmitter,
        policy: RetryPolicy,
        dedupe_window: ChronoDuration,
        clock: Clock,
    ) -> Self {
        Self {
            challenges,
            alerts,
            policy,
            dedupe_window,
            clock,
        }
    }

    /// Applies `event`. Webhooks never create challenges.
    pub async fn ingest(&self, event: &ProviderEvent) -> Result<IngestOutcome, IngestError> {
        let result = self.apply(event).await;
        let label = match &result {
            Ok(outcome) => outcome.metric_label(),
            Err(IngestError::Validation(_)) => "invalid",
            Err(IngestError::NotFound) => "not_found",
            Err(IngestError::Storage(_)) => "error",
        };
        counter!(
            "webhook_ingress_total",
            "status" => event.status.as_str(),
            "result" => label
        )
        .increment(1);
        result
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<IngestOutcome, IngestError> {
        let current = self
            .challenges
            .fetch_by_provider_reference(&event.provider_reference_id)
            .await?
            .ok_or(IngestError::NotFound)?;

        if event.provider.is_some() && event.provider != current.provider {
            debug!(
                stage = "ingress",
                challenge_id = %current.id,
                provider = ?event.provider,
                "provider does not own the referenced challenge"
            );
            return Err(IngestError::NotFound);
        }

        let now = (self.clock)();
        let mut updated = current.clone();
        let transition =
            match updated.apply_provider_event(event, now, &self.policy, self.dedupe_window) {
                Ok(transition) => transition,
                Err(TransitionRejected::Terminal(status)) => {
                    debug!(stage = "ingress", challenge_id = %current.id, status = status.as_str(), "event for terminal challenge ignored");
                    return Ok(IngestOutcome::Terminal);
                }
                Err(TransitionRejected::Duplicate) => {
                    debug!(stage = "ingress", challenge_id = %current.id, "duplicate provider event ignored");
                    return Ok(IngestOutcome::Duplicate);
                }
            };

        match self.challenges.commit(&updated, current.version).await? {
            CommitOutcome::Committed { .. } => {}
            CommitOutcome::Stale => {
                debug!(stage = "ingress", challenge_id = %current.id, "stale provider event discarded");
                return Ok(IngestOutcome::Discarded);
            }
        }

        info!(
            stage = "ingress",
            challenge_id = %updated.id,
            status = event.status.as_str(),
            propagation_state = updated.propagation_state.as_str(),
            attempt = updated.attempt_count,
            "provider event applied"
        );

        if let Err(err) = self.alerts.emit_for_transition(&updated, &transition).await {
            error!(stage = "alerts", challenge_id = %updated.id, error = %err, "failed to persist alert");
        }

        Ok(IngestOutcome::Applied(transition))
    }
}
