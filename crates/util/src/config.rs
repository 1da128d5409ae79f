use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use url::Url;

use super::{database_url, optional_var, server_bind_address};

const DEFAULT_DNS_RESOLVER_URL: &str = "https://cloudflare-dns.com/dns-query";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Cadence and limits of the probe scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub concurrency: usize,
    pub probe_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: 50,
            concurrency: 8,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    pub max_attempts: u32,
    pub webhook_dedupe_window: Duration,
    pub provider_webhook_secret: Option<String>,
    pub alert_webhook_url: Option<Url>,
    pub alert_timeout: Duration,
    pub dns_resolver_url: Url,
    pub http_probe_scheme: String,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let scheduler = SchedulerConfig {
            interval: Duration::from_secs(positive("SCHEDULER_INTERVAL_SECS", 15)?),
            batch_size: positive("SCHEDULER_BATCH_SIZE", 50)?,
            concurrency: positive("SCHEDULER_CONCURRENCY", 8)?,
            probe_timeout: Duration::from_secs(positive("PROBE_TIMEOUT_SECS", 5)?),
        };

        let alert_webhook_url = optional_var("ALERT_WEBHOOK_URL")
            .map(|value| parse_url("ALERT_WEBHOOK_URL", &value))
            .transpose()?;
        let dns_resolver_url = parse_url(
            "DNS_RESOLVER_URL",
            &optional_var("DNS_RESOLVER_URL").unwrap_or_else(|| DEFAULT_DNS_RESOLVER_URL.to_string()),
        )?;

        let http_probe_scheme = optional_var("HTTP_PROBE_SCHEME").unwrap_or_else(|| "http".to_string());
        if !matches!(http_probe_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                name: "HTTP_PROBE_SCHEME",
                value: http_probe_scheme,
            });
        }

        Ok(Self {
            bind_addr,
            environment,
            database_url: database_url(),
            scheduler,
            max_attempts: positive("CHALLENGE_MAX_ATTEMPTS", 5)?,
            webhook_dedupe_window: Duration::from_secs(positive("WEBHOOK_DEDUPE_WINDOW_SECS", 300)?),
            provider_webhook_secret: optional_var("PROVIDER_WEBHOOK_SECRET"),
            alert_webhook_url,
            alert_timeout: Duration::from_secs(positive("ALERT_TIMEOUT_SECS", 3)?),
            dns_resolver_url,
            http_probe_scheme,
        })
    }
}

fn positive<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = optional_var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidValue { name, value: raw }),
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
