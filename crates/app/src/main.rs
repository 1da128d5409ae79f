mod alerts;
mod ingest;
mod issuer;
mod problem;
mod prober;
mod router;
mod scheduler;
mod telemetry;
mod webhook;

#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use domain_verify_core::ports::{AlertSink, DnsProbe, DomainRegistry, HttpProbe};
use domain_verify_core::RetryPolicy;
use domain_verify_probe::{DisabledAlertSink, DohResolver, ReqwestHttpProbe, WebhookAlertSink};
use domain_verify_storage::Database;
use domain_verify_util::{load_env_file, AppConfig};
use tracing::{info, warn};

use crate::alerts::AlertEmitter;
use crate::ingest::WebhookIngestor;
use crate::issuer::ChallengeIssuer;
use crate::prober::{ProbeSettings, Prober};
use crate::scheduler::ProbeScheduler;

/// Injectable wall clock shared by the services.
pub(crate) type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const USER_AGENT: &str = concat!("domain-verify/", env!("CARGO_PKG_VERSION"));
const LEASE_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", "database ready");

    let clock: Clock = Arc::new(Utc::now);
    let policy = RetryPolicy::default();

    let probe_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.scheduler.probe_timeout)
        .build()?;
    let alert_client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.alert_timeout)
        .build()?;

    let registry: Arc<dyn DomainRegistry> = Arc::new(database.domain_mappings());
    let dns: Arc<dyn DnsProbe> = Arc::new(DohResolver::new(
        config.dns_resolver_url.clone(),
        probe_client.clone(),
    ));
    let http: Arc<dyn HttpProbe> = Arc::new(ReqwestHttpProbe::new(probe_client));
    let sink: Arc<dyn AlertSink> = match config.alert_webhook_url.clone() {
        Some(url) => Arc::new(WebhookAlertSink::new(url, alert_client)),
        None => {
            warn!(stage = "alerts", "ALERT_WEBHOOK_URL not set; alerts are recorded but not delivered");
            Arc::new(DisabledAlertSink)
        }
    };

    let alerts = AlertEmitter::new(database.alerts(), sink, config.alert_timeout, clock.clone());
    let issuer = ChallengeIssuer::new(
        registry.clone(),
        database.challenges(),
        config.max_attempts,
        clock.clone(),
    );
    let ingestor = WebhookIngestor::new(
        database.challenges(),
        alerts.clone(),
        policy,
        ChronoDuration::from_std(config.webhook_dedupe_window)?,
        clock.clone(),
    );

    let http_scheme: Arc<str> = Arc::from(config.http_probe_scheme.as_str());
    let lease = config.scheduler.probe_timeout + config.alert_timeout + LEASE_MARGIN;
    let prober = Prober::new(
        registry,
        database.challenges(),
        dns,
        http,
        alerts,
        ProbeSettings {
            policy,
            probe_timeout: config.scheduler.probe_timeout,
            lease: ChronoDuration::from_std(lease)?,
            http_scheme: http_scheme.clone(),
        },
        clock.clone(),
    );
    let scheduler = ProbeScheduler::new(
        database.challenges(),
        prober,
        config.scheduler.clone(),
        clock,
    )
    .spawn();

    let webhook_secret: Option<Arc<[u8]>> = config
        .provider_webhook_secret
        .as_deref()
        .map(|secret| Arc::from(secret.as_bytes()));
    if webhook_secret.is_none() {
        warn!(stage = "ingress", "PROVIDER_WEBHOOK_SECRET not set; webhook signatures are not checked");
    }

    let state = router::AppState::new(
        metrics,
        database,
        issuer,
        ingestor,
        webhook_secret,
        http_scheme,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    info!(stage = "app", "shutdown complete");
    served.map_err(|err| err.into())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(stage = "app", error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(stage = "app", "shutdown signal received");
}
