//! Fakes and fixtures shared by the service and router tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain_verify_core::ports::{
    AlertSink, DeliveryReceipt, DnsProbe, DomainRegistry, HttpObservation, HttpProbe, ProbeError,
    RegistryError, SinkError,
};
use domain_verify_core::types::{Alert, Challenge, DomainMapping, VerificationMethod};
use domain_verify_core::RetryPolicy;
use domain_verify_storage::Database;
use tempfile::TempDir;

use crate::alerts::AlertEmitter;
use crate::ingest::WebhookIngestor;
use crate::issuer::{ChallengeIssuer, IssueRequest};
use crate::prober::{ProbeSettings, Prober};
use crate::Clock;

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl Default for ManualClock {
    fn default() -> Self {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc);
        Self(Arc::new(Mutex::new(start)))
    }
}

impl ManualClock {
    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock poisoned")
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.0.lock().expect("clock poisoned");
        *now += by;
    }

    pub fn clock(&self) -> Clock {
        let inner = self.0.clone();
        Arc::new(move || *inner.lock().expect("clock poisoned"))
    }
}

#[derive(Clone)]
pub struct FakeDns {
    answer: Arc<Mutex<Result<Vec<String>, ProbeError>>>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl FakeDns {
    pub fn answering(values: Vec<String>) -> Self {
        Self {
            answer: Arc::new(Mutex::new(Ok(values))),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unused() -> Self {
        Self::answering(Vec::new())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, answer: Result<Vec<String>, ProbeError>) {
        *self.answer.lock().expect("dns poisoned") = answer;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsProbe for FakeDns {
    async fn query_txt(&self, _record_name: &str) -> Result<Vec<String>, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answer.lock().expect("dns poisoned").clone()
    }
}

#[derive(Clone)]
pub struct FakeHttp {
    response: Result<HttpObservation, ProbeError>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl FakeHttp {
    pub fn responding(status_code: u16, body: String) -> Self {
        Self {
            response: Ok(HttpObservation { status_code, body }),
            requested: Arc::default(),
        }
    }

    pub fn unused() -> Self {
        Self {
            response: Err(ProbeError::Transport("no http expected".into())),
            requested: Arc::default(),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().expect("http poisoned").clone()
    }
}

#[async_trait]
impl HttpProbe for FakeHttp {
    async fn fetch(&self, url: &str) -> Result<HttpObservation, ProbeError> {
        self.requested.lock().expect("http poisoned").push(url.to_string());
        self.response.clone()
    }
}

#[derive(Clone)]
enum SinkBehaviour {
    Status(u16),
    Hang,
}

/// Sink that records every alert it is handed.
#[derive(Clone)]
pub struct RecordingSink {
    behaviour: SinkBehaviour,
    delivered: Arc<Mutex<Vec<Alert>>>,
}

impl RecordingSink {
    pub fn accepting(status_code: u16) -> Self {
        Self {
            behaviour: SinkBehaviour::Status(status_code),
            delivered: Arc::default(),
        }
    }

    pub fn hanging() -> Self {
        Self {
            behaviour: SinkBehaviour::Hang,
            delivered: Arc::default(),
        }
    }

    pub fn delivered(&self) -> Vec<Alert> {
        self.delivered.lock().expect("sink poisoned").clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, alert: &Alert) -> Result<DeliveryReceipt, SinkError> {
        self.delivered.lock().expect("sink poisoned").push(alert.clone());
        match self.behaviour {
            SinkBehaviour::Status(status_code) => Ok(DeliveryReceipt { status_code }),
            SinkBehaviour::Hang => std::future::pending().await,
        }
    }
}

/// Registry that knows no mappings.
pub struct EmptyRegistry;

#[async_trait]
impl DomainRegistry for EmptyRegistry {
    async fn lookup(&self, _domain_mapping_id: &str) -> Result<Option<DomainMapping>, RegistryError> {
        Ok(None)
    }
}

pub struct TestContext {
    pub db: Database,
    pub clock: ManualClock,
    pub mapping: DomainMapping,
}

/// In-memory database with one mapping for `shop.example.com`.
pub async fn context() -> TestContext {
    context_at("sqlite::memory:?cache=shared").await
}

/// File-backed database, for tests that need real cross-connection contention.
pub async fn file_context() -> (TempDir, TestContext) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("verify.db").display());
    let ctx = context_at(&url).await;
    (dir, ctx)
}

async fn context_at(url: &str) -> TestContext {
    let db = Database::connect(url).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    let clock = ManualClock::default();
    let mapping = db
        .domain_mappings()
        .insert("shop.example.com", "site-1", clock.now())
        .await
        .expect("mapping");
    TestContext { db, clock, mapping }
}

impl TestContext {
    pub async fn insert_mapping(&self, domain: &str) -> DomainMapping {
        self.db
            .domain_mappings()
            .insert(domain, "site-2", self.clock.now())
            .await
            .expect("mapping")
    }

    pub fn issuer(&self, max_attempts: u32) -> ChallengeIssuer {
        ChallengeIssuer::new(
            Arc::new(self.db.domain_mappings()),
            self.db.challenges(),
            max_attempts,
            self.clock.clock(),
        )
    }

    pub fn emitter(&self, sink: Arc<dyn AlertSink>) -> AlertEmitter {
        AlertEmitter::new(self.db.alerts(), sink, Duration::from_secs(1), self.clock.clock())
    }

    pub fn prober(&self, dns: FakeDns, http: FakeHttp, sink: RecordingSink) -> Prober {
        Prober::new(
            Arc::new(self.db.domain_mappings()),
            self.db.challenges(),
            Arc::new(dns),
            Arc::new(http),
            self.emitter(Arc::new(sink)),
            ProbeSettings {
                policy: RetryPolicy::default(),
                probe_timeout: Duration::from_secs(1),
                lease: ChronoDuration::seconds(10),
                http_scheme: Arc::from("http"),
            },
            self.clock.clock(),
        )
    }

    pub fn ingestor(&self, sink: RecordingSink) -> WebhookIngestor {
        WebhookIngestor::new(
            self.db.challenges(),
            self.emitter(Arc::new(sink)),
            RetryPolicy::default(),
            ChronoDuration::seconds(300),
            self.clock.clock(),
        )
    }

    /// Issues a challenge on the default mapping. A provider reference also binds provider `acme-dns`.
    pub async fn issue(
        &self,
        method: VerificationMethod,
        max_attempts: u32,
        provider_reference_id: Option<&str>,
    ) -> Challenge {
        self.issuer(max_attempts)
            .issue(IssueRequest {
                domain_mapping_id: self.mapping.id.clone(),
                method,
                provider: provider_reference_id.map(|_| "acme-dns".to_string()),
                provider_reference_id: provider_reference_id.map(str::to_string),
            })
            .await
            .expect("issue")
    }

    pub async fn issue_dns(&self) -> Challenge {
        self.issue(VerificationMethod::DnsTxt, 5, None).await
    }

    pub async fn fetch(&self, id: &str) -> Challenge {
        self.db
            .challenges()
            .fetch(id)
            .await
            .expect("fetch")
            .expect("challenge exists")
    }
}
