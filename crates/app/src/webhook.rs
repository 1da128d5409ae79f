use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::ingest::{self, IngestError};
use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_TIMESTAMP: &str = "X-Provider-Timestamp";
const HEADER_SIGNATURE: &str = "X-Provider-Signature";
const MAX_SKEW_SECS: i64 = 600;

/// `POST /webhooks/propagation`
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ProblemResponse> {
    if let Some(secret) = state.webhook_secret() {
        authenticate(&state, &secret, &headers, &body)?;
    }

    let event = ingest::parse_event(&body).map_err(|err| {
        let result = match err {
            IngestError::NotFound => "not_found",
            _ => "invalid",
        };
        counter!("webhook_ingress_total", "status" => "unknown", "result" => result).increment(1);
        problem_for(err)
    })?;

    state.ingestor().ingest(&event).await.map_err(problem_for)?;
    Ok(StatusCode::NO_CONTENT)
}

fn authenticate(
    state: &AppState,
    secret: &Arc<[u8]>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), ProblemResponse> {
    let timestamp_raw = get_required_header(headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw)
        .map_err(|err| ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_timestamp", err))?;

    let now = state.now();
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_SKEW_SECS {
        warn!(
            stage = "ingress",
            %timestamp_raw,
            now = %now.to_rfc3339(),
            skew_seconds = skew,
            "timestamp outside ±10 minute window"
        );
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    verify_signature(secret, timestamp_raw, body, signature).map_err(|err| {
        counter!("webhook_ingress_total", "status" => "unknown", "result" => "invalid_signature")
            .increment(1);
        ProblemResponse::new(StatusCode::FORBIDDEN, "invalid_signature", err)
    })
}

fn problem_for(err: IngestError) -> ProblemResponse {
    match err {
        IngestError::Validation(detail) => {
            ProblemResponse::new(StatusCode::UNPROCESSABLE_ENTITY, "invalid_payload", detail)
        }
        IngestError::NotFound => ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "challenge_not_found",
            "no challenge matches the provider reference",
        ),
        IngestError::Storage(err) => {
            error!(stage = "ingress", error = %err, "failed to apply provider event");
            ProblemResponse::internal("failed to apply provider event")
        }
    }
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_header",
                format!("missing header {name}"),
            )
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn verify_signature(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
    mac.update(timestamp.as_bytes());
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
