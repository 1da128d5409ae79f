use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::policy::RetryPolicy;
use crate::target::{Evidence, ProofTarget};

/// Current schema version for persisted proof and alert payload blobs.
pub const BLOB_SCHEMA_VERSION: u8 = 1;

/// Error returned when a persisted or submitted enum value is unknown.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// How control of the domain is demonstrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationMethod {
    #[serde(rename = "DNS_TXT")]
    DnsTxt,
    #[serde(rename = "HTTP")]
    Http,
}

impl VerificationMethod {
    /// Returns the canonical database representation for the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DnsTxt => "DNS_TXT",
            Self::Http => "HTTP",
        }
    }

    /// Returns the label used in metrics and logs.
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::DnsTxt => "dns_txt",
            Self::Http => "http",
        }
    }
}

impl FromStr for VerificationMethod {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DNS_TXT" => Ok(Self::DnsTxt),
            "HTTP" => Ok(Self::Http),
            other => Err(ParseEnumError::new("method", other)),
        }
    }
}

/// Lifecycle status of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeStatus {
    Issued,
    Verified,
    Failed,
}

impl ChallengeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issued => "ISSUED",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Issued)
    }
}

impl FromStr for ChallengeStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ISSUED" => Ok(Self::Issued),
            "VERIFIED" => Ok(Self::Verified),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("status", other)),
        }
    }
}

/// How far the published proof has propagated. Also the status vocabulary of provider webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropagationState {
    Pending,
    Propagating,
    Ready,
    Failed,
}

impl PropagationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Propagating => "PROPAGATING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for PropagationState {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "PROPAGATING" => Ok(Self::Propagating),
            "READY" => Ok(Self::Ready),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("propagation state", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            other => Err(ParseEnumError::new("severity", other)),
        }
    }
}

/// Event that triggered an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEvent {
    Exhausted,
    Recovered,
    PropagationFailed,
}

impl AlertEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Recovered => "recovered",
            Self::PropagationFailed => "propagation_failed",
        }
    }
}

impl FromStr for AlertEvent {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "exhausted" => Ok(Self::Exhausted),
            "recovered" => Ok(Self::Recovered),
            "propagation_failed" => Ok(Self::PropagationFailed),
            other => Err(ParseEnumError::new("event type", other)),
        }
    }
}

/// Association between a custom hostname and a tenant site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMapping {
    pub id: String,
    pub domain: String,
    pub site_id: String,
}

/// Versioned evidence blob stored on verified challenges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofEnvelope {
    pub v: u8,
    pub observed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub evidence: Evidence,
}

impl ProofEnvelope {
    pub fn new(evidence: Evidence, observed_at: DateTime<Utc>) -> Self {
        Self {
            v: BLOB_SCHEMA_VERSION,
            observed_at,
            evidence,
        }
    }
}

/// A proof request for one domain mapping and one method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub domain_mapping_id: String,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(flatten)]
    pub target: ProofTarget,
    pub provider: Option<String>,
    pub provider_reference_id: Option<String>,
    pub propagation_state: PropagationState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_event_status: Option<PropagationState>,
    pub proof: Option<ProofEnvelope>,
    pub last_error: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Provider-pushed propagation update, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub provider: Option<String>,
    pub provider_reference_id: String,
    pub status: PropagationState,
    pub detail: Option<String>,
}

/// Outcome of applying an event to an active challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The challenge is now VERIFIED. `recovered` is set when earlier attempts had failed.
    Verified { recovered: bool },
    /// A failed attempt was recorded and another probe is scheduled.
    Rescheduled {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The provider reported a failure; the challenge stays eligible for probing.
    ProviderFailed {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// The last attempt was used up; the challenge is FAILED.
    Exhausted,
    /// Only the propagation state moved.
    PropagationUpdated,
}

/// Reasons an event is not applied.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TransitionRejected {
    #[error("challenge is already {}", .0.as_str())]
    Terminal(ChallengeStatus),
    #[error("provider event repeats the last one inside the dedupe window")]
    Duplicate,
}

impl Challenge {
    pub fn method(&self) -> VerificationMethod {
        self.target.method()
    }

    pub fn expected_value(&self) -> &str {
        self.target.expected_value()
    }

    fn ensure_active(&self) -> Result<(), TransitionRejected> {
        if self.status.is_terminal() {
            return Err(TransitionRejected::Terminal(self.status));
        }
        Ok(())
    }

    /// Records a successful verification.
    pub fn mark_verified(
        &mut self,
        now: DateTime<Utc>,
        evidence: Evidence,
    ) -> Result<Transition, TransitionRejected> {
        self.ensure_active()?;
        let recovered = self.attempt_count > 0;
        self.status = ChallengeStatus::Verified;
        self.propagation_state = PropagationState::Ready;
        self.verified_at = Some(now);
        self.next_attempt_at = None;
        self.proof = Some(ProofEnvelope::new(evidence, now));
        self.last_error = None;
        self.updated_at = now;
        Ok(Transition::Verified { recovered })
    }

    /// Records a failed probe attempt and reschedules or exhausts the challenge.
    pub fn record_probe_failure(
        &mut self,
        now: DateTime<Utc>,
        reason: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<Transition, TransitionRejected> {
        self.ensure_active()?;
        self.last_attempt_at = Some(now);
        self.last_error = Some(reason.into());
        Ok(match self.consume_attempt(now, policy) {
            Some(next_attempt_at) => Transition::Rescheduled {
                attempt: self.attempt_count,
                next_attempt_at,
            },
            None => Transition::Exhausted,
        })
    }

    /// Applies a provider webhook event.
    ///
    /// A FAILED report consumes one attempt, the same as a failed probe.
    /// An event repeating `last_event_status` within `dedupe_window` of
    /// `last_event_at` is rejected as a duplicate without touching the row.
    pub fn apply_provider_event(
        &mut self,
        event: &ProviderEvent,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
        dedupe_window: Duration,
    ) -> Result<Transition, TransitionRejected> {
        self.ensure_active()?;
        if self.is_duplicate_event(event.status, now, dedupe_window) {
            return Err(TransitionRejected::Duplicate);
        }

        self.last_event_at = Some(now);
        self.last_event_status = Some(event.status);
        self.updated_at = now;

        match event.status {
            PropagationState::Ready => self.mark_verified(
                now,
                Evidence::Provider {
                    provider: event.provider.clone(),
                    detail: event.detail.clone(),
                },
            ),
            PropagationState::Failed => {
                self.propagation_state = PropagationState::Failed;
                self.last_error = Some(
                    event
                        .detail
                        .clone()
                        .unwrap_or_else(|| "provider reported propagation failure".to_string()),
                );
                Ok(match self.consume_attempt(now, policy) {
                    Some(next_attempt_at) => Transition::ProviderFailed {
                        attempt: self.attempt_count,
                        next_attempt_at,
                    },
                    None => Transition::Exhausted,
                })
            }
            state @ (PropagationState::Pending | PropagationState::Propagating) => {
                self.propagation_state = state;
                Ok(Transition::PropagationUpdated)
            }
        }
    }

    fn is_duplicate_event(
        &self,
        status: PropagationState,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        match (self.last_event_status, self.last_event_at) {
            (Some(last_status), Some(last_at)) => last_status == status && now - last_at < window,
            _ => false,
        }
    }

    /// Increments the attempt counter. Returns the next due time, or `None` once exhausted.
    fn consume_attempt(&mut self, now: DateTime<Utc>, policy: &RetryPolicy) -> Option<DateTime<Utc>> {
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        self.updated_at = now;
        if self.attempt_count >= self.max_attempts {
            self.status = ChallengeStatus::Failed;
            self.propagation_state = PropagationState::Failed;
            self.next_attempt_at = None;
            None
        } else {
            let next = policy.next_attempt_at(now, self.attempt_count);
            self.next_attempt_at = Some(next);
            Some(next)
        }
    }
}

/// Versioned diagnostic snapshot attached to alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub v: u8,
    pub challenge_id: String,
    pub domain_mapping_id: String,
    pub method: VerificationMethod,
    pub status: ChallengeStatus,
    pub propagation_state: PropagationState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub provider: Option<String>,
    pub provider_reference_id: Option<String>,
    pub reason: String,
}

impl AlertPayload {
    pub fn snapshot(challenge: &Challenge, reason: impl Into<String>) -> Self {
        Self {
            v: BLOB_SCHEMA_VERSION,
            challenge_id: challenge.id.clone(),
            domain_mapping_id: challenge.domain_mapping_id.clone(),
            method: challenge.method(),
            status: challenge.status,
            propagation_state: challenge.propagation_state,
            attempt_count: challenge.attempt_count,
            max_attempts: challenge.max_attempts,
            last_error: challenge.last_error.clone(),
            provider: challenge.provider.clone(),
            provider_reference_id: challenge.provider_reference_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Operational alert raised on verification events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub challenge_id: Option<String>,
    pub mapping_id: String,
    pub severity: Severity,
    pub event_type: AlertEvent,
    pub message: String,
    pub payload: Value,
    pub delivered: bool,
    pub delivery_status_code: Option<u16>,
    pub delivery_error: Option<String>,
    pub delivery_attempted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
