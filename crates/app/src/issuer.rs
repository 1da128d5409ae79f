use std::sync::Arc;

use domain_verify_core::ports::{DomainRegistry, RegistryError};
use domain_verify_core::target::{generate_token, ProofTarget};
use domain_verify_core::types::{Challenge, ChallengeStatus, PropagationState, VerificationMethod};
use domain_verify_storage::{ChallengeError, ChallengeRepository};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Clock;

/// Parameters accepted when requesting a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    pub domain_mapping_id: String,
    pub method: VerificationMethod,
    pub provider: Option<String>,
    pub provider_reference_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("domain mapping not found")]
    NotFound,
    #[error("an active challenge already exists for this mapping and method")]
    Conflict(Box<Challenge>),
    #[error("provider reference is already bound to another challenge")]
    ProviderReferenceTaken,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] ChallengeError),
}

/// Creates challenges. Issuing has no network side effects.
#[derive(Clone)]
pub struct ChallengeIssuer {
    registry: Arc<dyn DomainRegistry>,
    challenges: ChallengeRepository,
    max_attempts: u32,
    clock: Clock,
}

impl ChallengeIssuer {
    pub fn new(
        registry: Arc<dyn DomainRegistry>,
        challenges: ChallengeRepository,
        max_attempts: u32,
        clock: Clock,
    ) -> Self {
        Self {
            registry,
            challenges,
            max_attempts,
            clock,
        }
    }

    /// Issues a new challenge, or reports the active one as a conflict.
    pub async fn issue(&self, request: IssueRequest) -> Result<Challenge, IssueError> {
        let method = request.method;
        let mapping = self
            .registry
            .lookup(&request.domain_mapping_id)
            .await?
            .ok_or(IssueError::NotFound)
            .inspect_err(|_| record(method, "not_found"))?;

        if let Some(existing) = self.challenges.find_active(&mapping.id, method).await? {
            record(method, "conflict");
            return Err(IssueError::Conflict(Box::new(existing)));
        }

        let now = (self.clock)();
        let token = generate_token();
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            domain_mapping_id: mapping.id.clone(),
            status: ChallengeStatus::Issued,
            target: ProofTarget::derive(method, &mapping.domain, &token),
            token,
            provider: request.provider,
            provider_reference_id: request.provider_reference_id,
            propagation_state: PropagationState::Pending,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            next_attempt_at: Some(now),
            last_attempt_at: None,
            last_event_at: None,
            last_event_status: None,
            proof: None,
            last_error: None,
            verified_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        match self.challenges.insert(&challenge).await {
            Ok(()) => {
                record(method, "issued");
                info!(
                    stage = "issuer",
                    challenge_id = %challenge.id,
                    mapping_id = %mapping.id,
                    method = method.metric_label(),
                    "challenge issued"
                );
                Ok(challenge)
            }
            Err(ChallengeError::DuplicateActive) => {
                // Lost the insert race against a concurrent issuer.
                debug!(stage = "issuer", mapping_id = %mapping.id, "concurrent issue detected");
                record(method, "conflict");
                match self.challenges.find_active(&mapping.id, method).await? {
                    Some(winner) => Err(IssueError::Conflict(Box::new(winner))),
                    None => Err(IssueError::Storage(ChallengeError::DuplicateActive)),
                }
            }
            Err(ChallengeError::MissingMapping) => {
                record(method, "not_found");
                Err(IssueError::NotFound)
            }
            Err(ChallengeError::DuplicateProviderReference) => {
                record(method, "conflict");
                Err(IssueError::ProviderReferenceTaken)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the active challenge for the mapping and method, issuing one when none exists.
    pub async fn issue_or_reuse(&self, request: IssueRequest) -> Result<Challenge, IssueError> {
        match self.issue(request).await {
            Err(IssueError::Conflict(existing)) => Ok(*existing),
            other => other,
        }
    }
}

fn record(method: VerificationMethod, result: &'static str) {
    counter!(
        "challenges_issued_total",
        "method" => method.metric_label(),
        "result" => result
    )
    .increment(1);
}
