//! Contracts for the collaborators the verification engine talks to.
//!
//! The engine never resolves DNS, fetches URLs or posts alerts itself; it goes
//! through these traits so the storage and probe crates (or test fakes) can
//! supply the behaviour.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Alert, DomainMapping};

/// Looks up canonical hostname to site associations.
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    async fn lookup(&self, domain_mapping_id: &str) -> Result<Option<DomainMapping>, RegistryError>;
}

/// Resolves TXT records for a record name.
#[async_trait]
pub trait DnsProbe: Send + Sync {
    async fn query_txt(&self, record_name: &str) -> Result<Vec<String>, ProbeError>;
}

/// Fetches a URL and reports the status code and body.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<HttpObservation, ProbeError>;
}

/// Outbound channel for operational alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<DeliveryReceipt, SinkError>;
}

/// Response observed by an HTTP probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpObservation {
    pub status_code: u16,
    pub body: String,
}

/// Status code returned by the alert sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status_code: u16,
}

impl DeliveryReceipt {
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Errors raised by DNS and HTTP probes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("resolver answered with status {0}")]
    Status(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by alert sinks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("alert sink is not configured")]
    NotConfigured,
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("registry lookup failed: {0}")]
pub struct RegistryError(pub String);
