use std::{sync::Arc, time::Duration};

use domain_verify_core::ports::{AlertSink, SinkError};
use domain_verify_core::types::{
    Alert, AlertEvent, AlertPayload, Challenge, Severity, Transition,
};
use domain_verify_storage::{AlertError, AlertRepository, DeliveryResult};
use metrics::counter;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Clock;

/// Persists alerts and makes exactly one delivery attempt per alert.
#[derive(Clone)]
pub struct AlertEmitter {
    alerts: AlertRepository,
    sink: Arc<dyn AlertSink>,
    timeout: Duration,
    clock: Clock,
}

impl AlertEmitter {
    pub fn new(
        alerts: AlertRepository,
        sink: Arc<dyn AlertSink>,
        timeout: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            alerts,
            sink,
            timeout,
            clock,
        }
    }

    /// Records an alert and hands it to the sink.
    ///
    /// Only a failure to persist the alert row is returned as an error; the
    /// delivery outcome is stored on the row and reflected in the returned
    /// alert.
    pub async fn emit(
        &self,
        challenge: &Challenge,
        severity: Severity,
        event_type: AlertEvent,
        message: impl Into<String>,
        payload: Value,
    ) -> Result<Alert, AlertError> {
        let now = (self.clock)();
        let mut alert = Alert {
            id: Uuid::new_v4().to_string(),
            challenge_id: Some(challenge.id.clone()),
            mapping_id: challenge.domain_mapping_id.clone(),
            severity,
            event_type,
            message: message.into(),
            payload,
            delivered: false,
            delivery_status_code: None,
            delivery_error: None,
            delivery_attempted_at: None,
            created_at: now,
            updated_at: now,
        };

        self.alerts.insert(&alert).await?;
        counter!(
            "alerts_emitted_total",
            "severity" => severity.as_str(),
            "event" => event_type.as_str()
        )
        .increment(1);

        let result = self.deliver(&alert).await;
        counter!(
            "alert_delivery_total",
            "result" => if result.delivered { "delivered" } else { "failed" }
        )
        .increment(1);

        match self.alerts.record_delivery(&alert.id, &result).await {
            Ok(_) => {}
            Err(err) => warn!(
                stage = "alerts",
                alert_id = %alert.id,
                error = %err,
                "failed to record alert delivery"
            ),
        }

        info!(
            stage = "alerts",
            alert_id = %alert.id,
            challenge_id = %challenge.id,
            severity = severity.as_str(),
            event = event_type.as_str(),
            delivered = result.delivered,
            "alert emitted"
        );

        alert.delivered = result.delivered;
        alert.delivery_status_code = result.status_code;
        alert.delivery_error = result.error;
        alert.delivery_attempted_at = Some(result.attempted_at);
        alert.updated_at = result.attempted_at;
        Ok(alert)
    }

    /// Emits the alert a committed transition calls for, if any.
    pub async fn emit_for_transition(
        &self,
        challenge: &Challenge,
        transition: &Transition,
    ) -> Result<Option<Alert>, AlertError> {
        let Some((severity, event_type, message)) = describe(challenge, transition) else {
            return Ok(None);
        };
        let reason = challenge
            .last_error
            .clone()
            .unwrap_or_else(|| event_type.as_str().to_string());
        let payload = serde_json::to_value(AlertPayload::snapshot(challenge, reason))?;
        self.emit(challenge, severity, event_type, message, payload)
            .await
            .map(Some)
    }

    async fn deliver(&self, alert: &Alert) -> DeliveryResult {
        let outcome = timeout(self.timeout, self.sink.deliver(alert)).await;
        let attempted_at = (self.clock)();
        match outcome {
            Ok(Ok(receipt)) => DeliveryResult {
                delivered: receipt.is_success(),
                status_code: Some(receipt.status_code),
                error: (!receipt.is_success())
                    .then(|| format!("sink answered with status {}", receipt.status_code)),
                attempted_at,
            },
            Ok(Err(err)) => {
                if err != SinkError::NotConfigured {
                    warn!(stage = "alerts", alert_id = %alert.id, error = %err, "alert delivery failed");
                }
                DeliveryResult {
                    delivered: false,
                    status_code: None,
                    error: Some(err.to_string()),
                    attempted_at,
                }
            }
            Err(_) => {
                warn!(stage = "alerts", alert_id = %alert.id, "alert delivery timed out");
                DeliveryResult {
                    delivered: false,
                    status_code: None,
                    error: Some(format!("delivery timed out after {:?}", self.timeout)),
                    attempted_at,
                }
            }
        }
    }
}

fn describe(challenge: &Challenge, transition: &Transition) -> Option<(Severity, AlertEvent, String)> {
    match transition {
        Transition::Verified { recovered: true } => Some((
            Severity::Info,
            AlertEvent::Recovered,
            format!(
                "challenge {} verified after {} failed attempt(s)",
                challenge.id, challenge.attempt_count
            ),
        )),
        Transition::Exhausted => Some((
            Severity::Error,
            AlertEvent::Exhausted,
            format!(
                "challenge {} failed: {} {} attempts exhausted",
                challenge.id,
                challenge.max_attempts,
                challenge.method().metric_label()
            ),
        )),
        Transition::ProviderFailed { attempt, .. } => Some((
            Severity::Warn,
            AlertEvent::PropagationFailed,
            format!(
                "provider reported propagation failure for challenge {} (attempt {}/{})",
                challenge.id, attempt, challenge.max_attempts
            ),
        )),
        Transition::Verified { recovered: false }
        | Transition::Rescheduled { .. }
        | Transition::PropagationUpdated => None,
    }
}
