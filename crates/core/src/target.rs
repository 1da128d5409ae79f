use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ports::{DnsProbe, HttpProbe, ProbeError};
use crate::types::VerificationMethod;

pub const TXT_RECORD_LABEL: &str = "_site-verification";
pub const TXT_VALUE_PREFIX: &str = "site-verification=";
pub const WELL_KNOWN_PREFIX: &str = "/.well-known/site-verification/";

const TOKEN_BYTES: usize = 16;
const HTTP_DIGEST_CHARS: usize = 32;
const OBSERVED_BODY_LIMIT: usize = 512;

/// Generates a challenge token from the operating system CSPRNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// What a challenge expects to observe, and where.
///
/// Serialized flat into the challenge representation, tagged by `method`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all_fields = "camelCase")]
pub enum ProofTarget {
    #[serde(rename = "DNS_TXT")]
    DnsTxt {
        txt_record_name: String,
        expected_value: String,
    },
    #[serde(rename = "HTTP")]
    Http {
        http_path: String,
        expected_value: String,
    },
}

impl ProofTarget {
    /// Derives the proof target for `domain` and `token`.
    pub fn derive(method: VerificationMethod, domain: &str, token: &str) -> Self {
        let domain = normalize_domain(domain);
        match method {
            VerificationMethod::DnsTxt => Self::DnsTxt {
                txt_record_name: format!("{TXT_RECORD_LABEL}.{domain}"),
                expected_value: format!("{TXT_VALUE_PREFIX}{token}"),
            },
            VerificationMethod::Http => {
                let digest = Sha256::digest(format!("{domain}:{token}").as_bytes());
                let mut thumb = hex::encode(digest);
                thumb.truncate(HTTP_DIGEST_CHARS);
                Self::Http {
                    http_path: format!("{WELL_KNOWN_PREFIX}{token}"),
                    expected_value: format!("{token}.{thumb}"),
                }
            }
        }
    }

    pub fn method(&self) -> VerificationMethod {
        match self {
            Self::DnsTxt { .. } => VerificationMethod::DnsTxt,
            Self::Http { .. } => VerificationMethod::Http,
        }
    }

    pub fn expected_value(&self) -> &str {
        match self {
            Self::DnsTxt { expected_value, .. } | Self::Http { expected_value, .. } => {
                expected_value
            }
        }
    }

    pub fn txt_record_name(&self) -> Option<&str> {
        match self {
            Self::DnsTxt {
                txt_record_name, ..
            } => Some(txt_record_name),
            Self::Http { .. } => None,
        }
    }

    pub fn http_path(&self) -> Option<&str> {
        match self {
            Self::Http { http_path, .. } => Some(http_path),
            Self::DnsTxt { .. } => None,
        }
    }

    /// Returns what the domain owner has to publish for this target.
    pub fn describe_instructions(&self, domain: &str, scheme: &str) -> Instructions {
        match self {
            Self::DnsTxt {
                txt_record_name,
                expected_value,
            } => Instructions::DnsTxt {
                record_name: txt_record_name.clone(),
                record_type: "TXT",
                value: expected_value.clone(),
            },
            Self::Http {
                http_path,
                expected_value,
            } => Instructions::Http {
                url: probe_url(scheme, domain, http_path),
                content: expected_value.clone(),
            },
        }
    }

    /// Probes the collaborator matching this target and checks the observation.
    ///
    /// DNS targets match when any TXT string equals the expected value
    /// exactly. HTTP targets match on a 2xx status whose body, with
    /// surrounding whitespace trimmed, equals the expected value exactly.
    pub async fn probe(
        &self,
        domain: &str,
        scheme: &str,
        dns: &dyn DnsProbe,
        http: &dyn HttpProbe,
    ) -> Result<Evidence, ProbeFailure> {
        match self {
            Self::DnsTxt {
                txt_record_name,
                expected_value,
            } => {
                let values = dns.query_txt(txt_record_name).await?;
                if values.iter().any(|value| value == expected_value) {
                    Ok(Evidence::DnsTxt {
                        record_name: txt_record_name.clone(),
                        values,
                    })
                } else {
                    Err(ProbeFailure::Mismatch { observed: values })
                }
            }
            Self::Http {
                http_path,
                expected_value,
            } => {
                let url = probe_url(scheme, domain, http_path);
                let observation = http.fetch(&url).await?;
                if !(200..300).contains(&observation.status_code) {
                    return Err(ProbeFailure::HttpStatus(observation.status_code));
                }
                let body = observation.body.trim();
                if body == expected_value {
                    Ok(Evidence::Http {
                        url,
                        status_code: observation.status_code,
                        body: truncate(body),
                    })
                } else {
                    Err(ProbeFailure::Mismatch {
                        observed: vec![truncate(body)],
                    })
                }
            }
        }
    }
}

/// Machine readable publishing instructions returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Instructions {
    DnsTxt {
        record_name: String,
        record_type: &'static str,
        value: String,
    },
    Http {
        url: String,
        content: String,
    },
}

/// Evidence captured when a challenge is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Evidence {
    DnsTxt {
        record_name: String,
        values: Vec<String>,
    },
    Http {
        url: String,
        status_code: u16,
        body: String,
    },
    Provider {
        provider: Option<String>,
        detail: Option<String>,
    },
}

/// Reasons a probe attempt did not verify the challenge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("expected value not observed (saw {observed:?})")]
    Mismatch { observed: Vec<String> },
    #[error("http probe answered with status {0}")]
    HttpStatus(u16),
    #[error("probe timed out after {0:?}")]
    TimedOut(std::time::Duration),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn probe_url(scheme: &str, domain: &str, path: &str) -> String {
    format!("{scheme}://{}{path}", normalize_domain(domain))
}

fn truncate(value: &str) -> String {
    if value.len() <= OBSERVED_BODY_LIMIT {
        return value.to_string();
    }
    let mut end = OBSERVED_BODY_LIMIT;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
