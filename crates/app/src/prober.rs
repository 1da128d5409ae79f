use std::{sync::Arc, time::Duration, time::Instant};

use chrono::Duration as ChronoDuration;
use domain_verify_core::ports::{DnsProbe, DomainRegistry, HttpProbe};
use domain_verify_core::types::{Challenge, Transition};
use domain_verify_core::{ProbeFailure, RetryPolicy};
use domain_verify_storage::{ChallengeRepository, CommitOutcome};
use metrics::{counter, histogram};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertEmitter;
use crate::Clock;

/// Settings shared by every probe run.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub policy: RetryPolicy,
    pub probe_timeout: Duration,
    /// How long a claimed challenge is hidden from other probers.
    pub lease: ChronoDuration,
    pub http_scheme: Arc<str>,
}

/// Result of one probe run against one challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Verified,
    Rescheduled,
    Exhausted,
    /// Nothing was committed: the claim or the final write lost a race, the
    /// mapping is gone, or storage failed.
    Discarded,
}

/// Checks whether a challenge's proof is visible and records the result.
#[derive(Clone)]
pub struct Prober {
    registry: Arc<dyn DomainRegistry>,
    challenges: ChallengeRepository,
    dns: Arc<dyn DnsProbe>,
    http: Arc<dyn HttpProbe>,
    alerts: AlertEmitter,
    settings: ProbeSettings,
    clock: Clock,
}

impl Prober {
    pub fn new(
        registry: Arc<dyn DomainRegistry>,
        challenges: ChallengeRepository,
        dns: Arc<dyn DnsProbe>,
        http: Arc<dyn HttpProbe>,
        alerts: AlertEmitter,
        settings: ProbeSettings,
        clock: Clock,
    ) -> Self {
        Self {
            registry,
            challenges,
            dns,
            http,
            alerts,
            settings,
            clock,
        }
    }

    /// Claims `candidate`, probes it once and commits the resulting transition.
    ///
    /// `candidate` is the row as selected by the scheduler; if anything else
    /// wrote to it since, the claim fails and the run is discarded.
    pub async fn probe_challenge(&self, candidate: &Challenge) -> ProbeOutcome {
        let now = (self.clock)();
        let claimed = match self
            .challenges
            .claim(
                &candidate.id,
                candidate.version,
                now + self.settings.lease,
                now,
            )
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(stage = "prober", challenge_id = %candidate.id, "claim lost to another writer");
                return ProbeOutcome::Discarded;
            }
            Err(err) => {
                error!(stage = "prober", challenge_id = %candidate.id, error = %err, "failed to claim challenge");
                return ProbeOutcome::Discarded;
            }
        };

        let mapping = match self.registry.lookup(&claimed.domain_mapping_id).await {
            Ok(Some(mapping)) => mapping,
            Ok(None) => {
                debug!(stage = "prober", challenge_id = %claimed.id, "domain mapping no longer exists");
                return ProbeOutcome::Discarded;
            }
            Err(err) => {
                warn!(stage = "prober", challenge_id = %claimed.id, error = %err, "registry lookup failed");
                return ProbeOutcome::Discarded;
            }
        };

        let method = claimed.method();
        let started = Instant::now();
        let result = timeout(
            self.settings.probe_timeout,
            claimed.target.probe(
                &mapping.domain,
                &self.settings.http_scheme,
                self.dns.as_ref(),
                self.http.as_ref(),
            ),
        )
        .await
        .unwrap_or_else(|_| Err(ProbeFailure::TimedOut(self.settings.probe_timeout)));
        histogram!("probe_latency_seconds", "method" => method.metric_label())
            .record(started.elapsed().as_secs_f64());

        let finished_at = (self.clock)();
        let mut updated = claimed.clone();
        let transition = match result {
            Ok(evidence) => {
                updated.last_attempt_at = Some(finished_at);
                updated.mark_verified(finished_at, evidence)
            }
            Err(failure) => {
                debug!(stage = "prober", challenge_id = %claimed.id, reason = %failure, "probe did not match");
                updated.record_probe_failure(finished_at, failure.to_string(), &self.settings.policy)
            }
        };
        let transition = match transition {
            Ok(transition) => transition,
            Err(rejected) => {
                debug!(stage = "prober", challenge_id = %claimed.id, reason = %rejected, "transition rejected");
                return ProbeOutcome::Discarded;
            }
        };

        match self.challenges.commit(&updated, claimed.version).await {
            Ok(CommitOutcome::Committed { .. }) => {}
            Ok(CommitOutcome::Stale) => {
                debug!(stage = "prober", challenge_id = %claimed.id, "stale commit discarded");
                return ProbeOutcome::Discarded;
            }
            Err(err) => {
                error!(stage = "prober", challenge_id = %claimed.id, error = %err, "failed to commit probe result");
                return ProbeOutcome::Discarded;
            }
        }

        let outcome = match transition {
            Transition::Verified { .. } => ProbeOutcome::Verified,
            Transition::Exhausted => ProbeOutcome::Exhausted,
            _ => ProbeOutcome::Rescheduled,
        };
        counter!(
            "probe_attempts_total",
            "method" => method.metric_label(),
            "result" => outcome.as_str()
        )
        .increment(1);
        info!(
            stage = "prober",
            challenge_id = %updated.id,
            method = method.metric_label(),
            attempt = updated.attempt_count,
            outcome = outcome.as_str(),
            "probe committed"
        );

        if let Err(err) = self.alerts.emit_for_transition(&updated, &transition).await {
            error!(stage = "alerts", challenge_id = %updated.id, error = %err, "failed to persist alert");
        }

        outcome
    }
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Rescheduled => "rescheduled",
            Self::Exhausted => "exhausted",
            Self::Discarded => "discarded",
        }
    }
}
