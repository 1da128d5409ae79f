use std::{borrow::Cow, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use domain_verify_core::ports::{DomainRegistry, RegistryError};
use domain_verify_core::types::{
    Alert, AlertEvent, Challenge, ChallengeStatus, DomainMapping, ParseEnumError,
    PropagationState, ProofEnvelope, Severity, VerificationMethod,
};
use domain_verify_core::ProofTarget;

const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle on the domain mapping registry.
    pub fn domain_mappings(&self) -> DomainMappingRepository {
        DomainMappingRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for reading and transitioning challenges.
    pub fn challenges(&self) -> ChallengeRepository {
        ChallengeRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle on the alert log.
    pub fn alerts(&self) -> AlertRepository {
        AlertRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn constraint_code(err: &sqlx::Error) -> Option<Cow<'_, str>> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code(),
        _ => None,
    }
}

/// Repository over the `domain_mappings` table.
#[derive(Clone)]
pub struct DomainMappingRepository {
    pool: SqlitePool,
}

impl DomainMappingRepository {
    /// Registers a hostname for a site. The domain is stored lower-cased.
    pub async fn insert(
        &self,
        domain: &str,
        site_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<DomainMapping, MappingError> {
        let mapping = DomainMapping {
            id: Uuid::new_v4().to_string(),
            domain: domain_verify_core::target::normalize_domain(domain),
            site_id: site_id.to_string(),
        };

        sqlx::query("INSERT INTO domain_mappings (id, domain, site_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(&mapping.id)
            .bind(&mapping.domain)
            .bind(&mapping.site_id)
            .bind(to_rfc3339(created_at))
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if constraint_code(&err).as_deref() == Some(SQLITE_CONSTRAINT_UNIQUE) {
                    MappingError::DuplicateDomain
                } else {
                    MappingError::Database(err)
                }
            })?;

        Ok(mapping)
    }

    /// Loads a mapping by id.
    pub async fn fetch(&self, id: &str) -> Result<Option<DomainMapping>, MappingError> {
        let row = sqlx::query_as::<_, DomainMappingRow>(
            "SELECT id, domain, site_id FROM domain_mappings WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DomainMappingRow::into_domain))
    }

    /// Removes a mapping, cascading to its challenges. Returns `false` when nothing was deleted.
    pub async fn delete(&self, id: &str) -> Result<bool, MappingError> {
        let result = sqlx::query("DELETE FROM domain_mappings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DomainRegistry for DomainMappingRepository {
    async fn lookup(&self, domain_mapping_id: &str) -> Result<Option<DomainMapping>, RegistryError> {
        self.fetch(domain_mapping_id)
            .await
            .map_err(|err| RegistryError(err.to_string()))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DomainMappingRow {
    id: String,
    domain: String,
    site_id: String,
}

impl DomainMappingRow {
    fn into_domain(self) -> DomainMapping {
        DomainMapping {
            id: self.id,
            domain: self.domain,
            site_id: self.site_id,
        }
    }
}

/// Errors raised by the mapping registry.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("domain is already mapped")]
    DuplicateDomain,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const CHALLENGE_COLUMNS: &str = "id, domain_mapping_id, method, status, token, txt_record_name, \
     http_path, expected_value, provider, provider_reference_id, propagation_state, attempt_count, \
     max_attempts, next_attempt_at, last_attempt_at, last_event_at, last_event_status, proof_json, \
     last_error, verified_at, created_at, updated_at, version";

/// Repository for the `challenges` table.
///
/// Every write after insertion is conditional on the row's `version` and on
/// the challenge still being ISSUED, so concurrent writers cannot both commit
/// a transition and terminal rows are never modified.
#[derive(Clone)]
pub struct ChallengeRepository {
    pool: SqlitePool,
}

impl ChallengeRepository {
    /// Inserts a freshly issued challenge.
    pub async fn insert(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        let proof_json = encode_proof(challenge.proof.as_ref())?;
        sqlx::query(
            "INSERT INTO challenges \
             (id, domain_mapping_id, method, status, token, txt_record_name, http_path, expected_value, \
              provider, provider_reference_id, propagation_state, attempt_count, max_attempts, \
              next_attempt_at, last_attempt_at, last_event_at, last_event_status, proof_json, \
              last_error, verified_at, created_at, updated_at, version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&challenge.id)
        .bind(&challenge.domain_mapping_id)
        .bind(challenge.method().as_str())
        .bind(challenge.status.as_str())
        .bind(&challenge.token)
        .bind(challenge.target.txt_record_name())
        .bind(challenge.target.http_path())
        .bind(challenge.expected_value())
        .bind(&challenge.provider)
        .bind(&challenge.provider_reference_id)
        .bind(challenge.propagation_state.as_str())
        .bind(challenge.attempt_count as i64)
        .bind(challenge.max_attempts as i64)
        .bind(challenge.next_attempt_at.map(to_rfc3339))
        .bind(challenge.last_attempt_at.map(to_rfc3339))
        .bind(challenge.last_event_at.map(to_rfc3339))
        .bind(challenge.last_event_status.map(PropagationState::as_str))
        .bind(proof_json)
        .bind(&challenge.last_error)
        .bind(challenge.verified_at.map(to_rfc3339))
        .bind(to_rfc3339(challenge.created_at))
        .bind(to_rfc3339(challenge.updated_at))
        .bind(challenge.version as i64)
        .execute(&self.pool)
        .await
        .map_err(classify_insert_error)?;

        Ok(())
    }

    /// Loads a challenge by id.
    pub async fn fetch(&self, id: &str) -> Result<Option<Challenge>, ChallengeError> {
        let row = sqlx::query_as::<_, ChallengeRow>(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChallengeRow::into_domain).transpose()
    }

    /// Returns the ISSUED challenge for a mapping and method, if any.
    pub async fn find_active(
        &self,
        domain_mapping_id: &str,
        method: VerificationMethod,
    ) -> Result<Option<Challenge>, ChallengeError> {
        let row = sqlx::query_as::<_, ChallengeRow>(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges \
             WHERE domain_mapping_id = ? AND method = ? AND status = 'ISSUED'"
        ))
        .bind(domain_mapping_id)
        .bind(method.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChallengeRow::into_domain).transpose()
    }

    /// Looks up the challenge a provider refers to.
    ///
    /// A reference is only unique among ISSUED challenges; when it was reused
    /// after a terminal outcome the active challenge wins, otherwise the most
    /// recent one.
    pub async fn fetch_by_provider_reference(
        &self,
        provider_reference_id: &str,
    ) -> Result<Option<Challenge>, ChallengeError> {
        let row = sqlx::query_as::<_, ChallengeRow>(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges WHERE provider_reference_id = ? \
             ORDER BY status = 'ISSUED' DESC, created_at DESC, id DESC LIMIT 1"
        ))
        .bind(provider_reference_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChallengeRow::into_domain).transpose()
    }

    /// Lists challenges due for probing, oldest due time first, ties broken by id.
    pub async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Challenge>, ChallengeError> {
        let rows = sqlx::query_as::<_, ChallengeRow>(&format!(
            "SELECT {CHALLENGE_COLUMNS} FROM challenges \
             WHERE status = 'ISSUED' \
               AND propagation_state <> 'READY' \
               AND next_attempt_at IS NOT NULL \
               AND next_attempt_at <= ? \
               AND attempt_count < max_attempts \
             ORDER BY next_attempt_at ASC, id ASC \
             LIMIT ?"
        ))
        .bind(to_rfc3339(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChallengeRow::into_domain).collect()
    }

    /// Claims a challenge for probing by pushing its due time out to `lease_until`.
    ///
    /// Returns the claimed row, or `None` when another writer changed the row
    /// since `expected_version` was read.
    pub async fn claim(
        &self,
        id: &str,
        expected_version: u64,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Challenge>, ChallengeError> {
        let row = sqlx::query_as::<_, ChallengeRow>(&format!(
            "UPDATE challenges \
             SET next_attempt_at = ?, updated_at = ?, version = version + 1 \
             WHERE id = ? AND version = ? AND status = 'ISSUED' \
             RETURNING {CHALLENGE_COLUMNS}"
        ))
        .bind(to_rfc3339(lease_until))
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(expected_version as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ChallengeRow::into_domain).transpose()
    }

    /// Persists a transition computed from a row read at `expected_version`.
    pub async fn commit(
        &self,
        challenge: &Challenge,
        expected_version: u64,
    ) -> Result<CommitOutcome, ChallengeError> {
        let proof_json = encode_proof(challenge.proof.as_ref())?;
        let next_version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE challenges \
             SET status = ?, propagation_state = ?, attempt_count = ?, next_attempt_at = ?, \
                 last_attempt_at = ?, last_event_at = ?, last_event_status = ?, proof_json = ?, \
                 last_error = ?, verified_at = ?, updated_at = ?, version = ? \
             WHERE id = ? AND version = ? AND status = 'ISSUED'",
        )
        .bind(challenge.status.as_str())
        .bind(challenge.propagation_state.as_str())
        .bind(challenge.attempt_count as i64)
        .bind(challenge.next_attempt_at.map(to_rfc3339))
        .bind(challenge.last_attempt_at.map(to_rfc3339))
        .bind(challenge.last_event_at.map(to_rfc3339))
        .bind(challenge.last_event_status.map(PropagationState::as_str))
        .bind(proof_json)
        .bind(&challenge.last_error)
        .bind(challenge.verified_at.map(to_rfc3339))
        .bind(to_rfc3339(challenge.updated_at))
        .bind(next_version as i64)
        .bind(&challenge.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(CommitOutcome::Committed {
                version: next_version,
            })
        } else {
            Ok(CommitOutcome::Stale)
        }
    }
}

fn classify_insert_error(err: sqlx::Error) -> ChallengeError {
    let code = constraint_code(&err).map(Cow::into_owned);
    match code.as_deref() {
        Some(SQLITE_CONSTRAINT_UNIQUE) if err.to_string().contains("provider_reference_id") => {
            ChallengeError::DuplicateProviderReference
        }
        Some(SQLITE_CONSTRAINT_UNIQUE) => ChallengeError::DuplicateActive,
        Some(SQLITE_CONSTRAINT_FOREIGNKEY) => ChallengeError::MissingMapping,
        _ => ChallengeError::Database(err),
    }
}

/// Result of a conditional challenge write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: u64 },
    Stale,
}

impl CommitOutcome {
    pub fn is_committed(self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

/// Errors that can occur while reading or writing challenges.
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("an active challenge already exists for this mapping and method")]
    DuplicateActive,
    #[error("provider reference is already bound to another challenge")]
    DuplicateProviderReference,
    #[error("domain mapping does not exist")]
    MissingMapping,
    #[error("failed to decode challenge row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<ParseEnumError> for ChallengeError {
    fn from(err: ParseEnumError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for ChallengeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

fn encode_proof(proof: Option<&ProofEnvelope>) -> Result<Option<String>, ChallengeError> {
    proof
        .map(serde_json::to_string)
        .transpose()
        .map_err(ChallengeError::from)
}

#[derive(Debug, sqlx::FromRow)]
struct ChallengeRow {
    id: String,
    domain_mapping_id: String,
    method: String,
    status: String,
    token: String,
    txt_record_name: Option<String>,
    http_path: Option<String>,
    expected_value: String,
    provider: Option<String>,
    provider_reference_id: Option<String>,
    propagation_state: String,
    attempt_count: i64,
    max_attempts: i64,
    next_attempt_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    last_event_at: Option<DateTime<Utc>>,
    last_event_status: Option<String>,
    proof_json: Option<String>,
    last_error: Option<String>,
    verified_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl ChallengeRow {
    fn into_domain(self) -> Result<Challenge, ChallengeError> {
        let method: VerificationMethod = self.method.parse()?;
        let target = match method {
            VerificationMethod::DnsTxt => ProofTarget::DnsTxt {
                txt_record_name: self
                    .txt_record_name
                    .ok_or_else(|| ChallengeError::Decode("missing txt_record_name".into()))?,
                expected_value: self.expected_value,
            },
            VerificationMethod::Http => ProofTarget::Http {
                http_path: self
                    .http_path
                    .ok_or_else(|| ChallengeError::Decode("missing http_path".into()))?,
                expected_value: self.expected_value,
            },
        };
        let proof = self
            .proof_json
            .as_deref()
            .map(serde_json::from_str::<ProofEnvelope>)
            .transpose()?;
        let last_event_status = self
            .last_event_status
            .as_deref()
            .map(str::parse::<PropagationState>)
            .transpose()?;

        Ok(Challenge {
            id: self.id,
            domain_mapping_id: self.domain_mapping_id,
            status: self.status.parse::<ChallengeStatus>()?,
            token: self.token,
            target,
            provider: self.provider,
            provider_reference_id: self.provider_reference_id,
            propagation_state: self.propagation_state.parse()?,
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            next_attempt_at: self.next_attempt_at,
            last_attempt_at: self.last_attempt_at,
            last_event_at: self.last_event_at,
            last_event_status,
            proof,
            last_error: self.last_error,
            verified_at: self.verified_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version as u64,
        })
    }
}

const ALERT_COLUMNS: &str = "id, challenge_id, mapping_id, severity, event_type, message, \
     payload_json, delivered, delivery_status_code, delivery_error, delivery_attempted_at, \
     created_at, updated_at";

/// Repository for the append-mostly `alerts` table.
#[derive(Clone)]
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    /// Inserts an undelivered alert.
    pub async fn insert(&self, alert: &Alert) -> Result<(), AlertError> {
        let payload_json = serde_json::to_string(&alert.payload)?;
        sqlx::query(
            "INSERT INTO alerts \
             (id, challenge_id, mapping_id, severity, event_type, message, payload_json, delivered, \
              delivery_status_code, delivery_error, delivery_attempted_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, NULL, ?, ?)",
        )
        .bind(&alert.id)
        .bind(&alert.challenge_id)
        .bind(&alert.mapping_id)
        .bind(alert.severity.as_str())
        .bind(alert.event_type.as_str())
        .bind(&alert.message)
        .bind(payload_json)
        .bind(to_rfc3339(alert.created_at))
        .bind(to_rfc3339(alert.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records the single delivery attempt for an alert.
    ///
    /// Returns `false` when a delivery result was already stored.
    pub async fn record_delivery(
        &self,
        alert_id: &str,
        result: &DeliveryResult,
    ) -> Result<bool, AlertError> {
        let attempted_at = to_rfc3339(result.attempted_at);
        let outcome = sqlx::query(
            "UPDATE alerts \
             SET delivered = ?, delivery_status_code = ?, delivery_error = ?, \
                 delivery_attempted_at = ?, updated_at = ? \
             WHERE id = ? AND delivery_attempted_at IS NULL",
        )
        .bind(i64::from(result.delivered))
        .bind(result.status_code.map(i64::from))
        .bind(&result.error)
        .bind(&attempted_at)
        .bind(&attempted_at)
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    /// Loads an alert by id.
    pub async fn fetch(&self, alert_id: &str) -> Result<Option<Alert>, AlertError> {
        let row = sqlx::query_as::<_, AlertRow>(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?"
        ))
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AlertRow::into_domain).transpose()
    }

    /// Lists alerts raised for a challenge in creation order.
    pub async fn list_for_challenge(&self, challenge_id: &str) -> Result<Vec<Alert>, AlertError> {
        let rows = sqlx::query_as::<_, AlertRow>(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE challenge_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertRow::into_domain).collect()
    }
}

/// Outcome of the one delivery attempt made for an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub delivered: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Errors that can occur while reading or writing alerts.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("failed to decode alert row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<ParseEnumError> for AlertError {
    fn from(err: ParseEnumError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for AlertError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    id: String,
    challenge_id: Option<String>,
    mapping_id: String,
    severity: String,
    event_type: String,
    message: String,
    payload_json: String,
    delivered: i64,
    delivery_status_code: Option<i64>,
    delivery_error: Option<String>,
    delivery_attempted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AlertRow {
    fn into_domain(self) -> Result<Alert, AlertError> {
        Ok(Alert {
            id: self.id,
            challenge_id: self.challenge_id,
            mapping_id: self.mapping_id,
            severity: self.severity.parse::<Severity>()?,
            event_type: self.event_type.parse::<AlertEvent>()?,
            message: self.message,
            payload: serde_json::from_str(&self.payload_json)?,
            delivered: self.delivered != 0,
            delivery_status_code: self.delivery_status_code.map(|code| code as u16),
            delivery_error: self.delivery_error,
            delivery_attempted_at: self.delivery_attempted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    async fn setup_db() -> (Database, DomainMapping) {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        let mapping = db
            .domain_mappings()
            .insert("Shop.Example.com", "site-1", fixed_now())
            .await
            .expect("insert mapping");
        (db, mapping)
    }

    fn new_challenge(id: &str, mapping_id: &str, method: VerificationMethod) -> Challenge {
        let token = format!("token-{id}");
        Challenge {
            id: id.to_string(),
            domain_mapping_id: mapping_id.to_string(),
            status: ChallengeStatus::Issued,
            target: ProofTarget::derive(method, "shop.example.com", &token),
            token,
            provider: None,
            provider_reference_id: None,
            propagation_state: PropagationState::Pending,
            attempt_count: 0,
            max_attempts: 5,
            next_attempt_at: Some(fixed_now()),
            last_attempt_at: None,
            last_event_at: None,
            last_event_status: None,
            proof: None,
            last_error: None,
            verified_at: None,
            created_at: fixed_now(),
            updated_at: fixed_now(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('domain_mappings', 'challenges', 'alerts')",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 3);
    }

    #[tokio::test]
    async fn registry_lookup_returns_normalized_domain() {
        let (db, mapping) = setup_db().await;
        let found = db
            .domain_mappings()
            .lookup(&mapping.id)
            .await
            .expect("lookup")
            .expect("mapping present");
        assert_eq!(found.domain, "shop.example.com");
        assert_eq!(found.site_id, "site-1");

        let missing = db.domain_mappings().lookup("missing").await.expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn insert_round_trips_challenge() {
        let (db, mapping) = setup_db().await;
        let repo = db.challenges();
        let challenge = new_challenge("c-1", &mapping.id, VerificationMethod::Http);
        repo.insert(&challenge).await.expect("insert");

        let loaded = repo.fetch("c-1").await.expect("fetch").expect("present");
        assert_eq!(loaded, challenge);
    }

    #[tokio::test]
    async fn second_active_challenge_is_rejected() {
        let (db, mapping) = setup_db().await;
        let repo = db.challenges();
        repo.insert(&new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt))
            .await
            .expect("insert");

        let err = repo
            .insert(&new_challenge("c-2", &mapping.id, VerificationMethod::DnsTxt))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, ChallengeError::DuplicateActive));

        repo.insert(&new_challenge("c-3", &mapping.id, VerificationMethod::Http))
            .await
            .expect("other method is independent");
    }

    #[tokio::test]
    async fn provider_reference_is_reusable_after_terminal_outcome() {
        let (db, mapping) = setup_db().await;
        let repo = db.challenges();
        let mut first = new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt);
        first.provider = Some("acme-dns".into());
        first.provider_reference_id = Some("ref-1".into());
        repo.insert(&first).await.expect("insert");

        let mut taken = new_challenge("c-2", &mapping.id, VerificationMethod::Http);
        taken.provider_reference_id = Some("ref-1".into());
        let err = repo.insert(&taken).await.expect_err("reference in use");
        assert!(matches!(err, ChallengeError::DuplicateProviderReference));

        first.status = ChallengeStatus::Failed;
        first.propagation_state = PropagationState::Failed;
        first.next_attempt_at = None;
        assert!(repo.commit(&first, 0).await.expect("commit").is_committed());

        let mut retry = new_challenge("c-3", &mapping.id, VerificationMethod::DnsTxt);
        retry.provider = Some("acme-dns".into());
        retry.provider_reference_id = Some("ref-1".into());
        retry.created_at = fixed_now() + Duration::minutes(5);
        repo.insert(&retry).await.expect("reference free again");

        let found = repo
            .fetch_by_provider_reference("ref-1")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(found.id, "c-3");
    }

    #[tokio::test]
    async fn insert_errors_when_mapping_missing() {
        let (db, _) = setup_db().await;
        let err = db
            .challenges()
            .insert(&new_challenge("c-1", "missing", VerificationMethod::DnsTxt))
            .await
            .expect_err("fk");
        assert!(matches!(err, ChallengeError::MissingMapping));
    }

    #[tokio::test]
    async fn list_due_orders_by_due_time_then_id() {
        let (db, mapping) = setup_db().await;
        let other = db
            .domain_mappings()
            .insert("other.example.com", "site-2", fixed_now())
            .await
            .expect("mapping");
        let repo = db.challenges();

        let mut late = new_challenge("c-late", &mapping.id, VerificationMethod::DnsTxt);
        late.next_attempt_at = Some(fixed_now() + Duration::seconds(10));
        let mut tie_b = new_challenge("c-b", &mapping.id, VerificationMethod::Http);
        tie_b.next_attempt_at = Some(fixed_now() - Duration::seconds(5));
        let mut tie_a = new_challenge("c-a", &other.id, VerificationMethod::DnsTxt);
        tie_a.next_attempt_at = Some(fixed_now() - Duration::seconds(5));
        let mut ready = new_challenge("c-ready", &other.id, VerificationMethod::Http);
        ready.propagation_state = PropagationState::Ready;

        for challenge in [&late, &tie_b, &tie_a, &ready] {
            repo.insert(challenge).await.expect("insert");
        }

        let due = repo.list_due(fixed_now(), 10).await.expect("due");
        let ids: Vec<&str> = due.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c-a", "c-b"]);

        let limited = repo.list_due(fixed_now() + Duration::seconds(60), 2).await.expect("due");
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn commit_is_conditional_on_version() {
        let (db, mapping) = setup_db().await;
        let repo = db.challenges();
        let challenge = new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt);
        repo.insert(&challenge).await.expect("insert");

        let mut first = challenge.clone();
        first.propagation_state = PropagationState::Propagating;
        let mut second = challenge.clone();
        second.propagation_state = PropagationState::Failed;

        let outcome = repo.commit(&first, 0).await.expect("commit");
        assert_eq!(outcome, CommitOutcome::Committed { version: 1 });
        let outcome = repo.commit(&second, 0).await.expect("commit");
        assert_eq!(outcome, CommitOutcome::Stale);

        let stored = repo.fetch("c-1").await.expect("fetch").expect("present");
        assert_eq!(stored.propagation_state, PropagationState::Propagating);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn claim_bumps_version_and_leases() {
        let (db, mapping) = setup_db().await;
        let repo = db.challenges();
        repo.insert(&new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt))
            .await
            .expect("insert");

        let lease = fixed_now() + Duration::seconds(15);
        let claimed = repo
            .claim("c-1", 0, lease, fixed_now())
            .await
            .expect("claim")
            .expect("claimed");
        assert_eq!(claimed.version, 1);
        assert_eq!(claimed.next_attempt_at, Some(lease));

        let again = repo.claim("c-1", 0, lease, fixed_now()).await.expect("claim");
        assert!(again.is_none());
        assert!(repo.list_due(fixed_now(), 10).await.expect("due").is_empty());
    }

    #[tokio::test]
    async fn terminal_rows_are_never_rewritten() {
        let (db, mapping) = setup_db().await;
        let repo = db.challenges();
        let mut challenge = new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt);
        repo.insert(&challenge).await.expect("insert");

        challenge.status = ChallengeStatus::Verified;
        challenge.propagation_state = PropagationState::Ready;
        challenge.next_attempt_at = None;
        assert!(repo.commit(&challenge, 0).await.expect("commit").is_committed());

        challenge.status = ChallengeStatus::Failed;
        challenge.propagation_state = PropagationState::Failed;
        assert_eq!(repo.commit(&challenge, 1).await.expect("commit"), CommitOutcome::Stale);
        assert!(repo
            .claim("c-1", 1, fixed_now(), fixed_now())
            .await
            .expect("claim")
            .is_none());
    }

    #[tokio::test]
    async fn deleting_mapping_cascades_and_keeps_alerts() {
        let (db, mapping) = setup_db().await;
        db.challenges()
            .insert(&new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt))
            .await
            .expect("insert");
        let alert = sample_alert("a-1", "c-1", &mapping.id);
        db.alerts().insert(&alert).await.expect("alert");

        assert!(db.domain_mappings().delete(&mapping.id).await.expect("delete"));
        assert!(db.challenges().fetch("c-1").await.expect("fetch").is_none());

        let retained = db.alerts().fetch("a-1").await.expect("fetch").expect("kept");
        assert!(retained.challenge_id.is_none());
        assert_eq!(retained.mapping_id, mapping.id);
    }

    fn sample_alert(id: &str, challenge_id: &str, mapping_id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            challenge_id: Some(challenge_id.to_string()),
            mapping_id: mapping_id.to_string(),
            severity: Severity::Error,
            event_type: AlertEvent::Exhausted,
            message: "verification exhausted".to_string(),
            payload: json!({ "v": 1, "reason": "mismatch" }),
            delivered: false,
            delivery_status_code: None,
            delivery_error: None,
            delivery_attempted_at: None,
            created_at: fixed_now(),
            updated_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn delivery_result_is_recorded_once() {
        let (db, mapping) = setup_db().await;
        db.challenges()
            .insert(&new_challenge("c-1", &mapping.id, VerificationMethod::DnsTxt))
            .await
            .expect("insert");
        let repo = db.alerts();
        repo.insert(&sample_alert("a-1", "c-1", &mapping.id))
            .await
            .expect("insert");

        let failed = DeliveryResult {
            delivered: false,
            status_code: Some(502),
            error: Some("bad gateway".to_string()),
            attempted_at: fixed_now(),
        };
        assert!(repo.record_delivery("a-1", &failed).await.expect("record"));

        let success = DeliveryResult {
            delivered: true,
            status_code: Some(200),
            error: None,
            attempted_at: fixed_now(),
        };
        assert!(!repo.record_delivery("a-1", &success).await.expect("record"));

        let stored = repo.fetch("a-1").await.expect("fetch").expect("present");
        assert!(!stored.delivered);
        assert_eq!(stored.delivery_status_code, Some(502));
        assert_eq!(stored.delivery_error.as_deref(), Some("bad gateway"));
        assert_eq!(stored.payload["reason"], "mismatch");
    }
}
