use async_trait::async_trait;
use reqwest::Client;

use domain_verify_core::ports::{HttpObservation, HttpProbe, ProbeError};

const BODY_LIMIT: usize = 64 * 1024;

/// Fetches challenge documents over plain `reqwest`.
#[derive(Clone)]
pub struct ReqwestHttpProbe {
    http: Client,
}

impl ReqwestHttpProbe {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpProbe for ReqwestHttpProbe {
    async fn fetch(&self, url: &str) -> Result<HttpObservation, ProbeError> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))?;

        let status_code = response.status().as_u16();
        // Stop reading once the limit is reached; the rest is never buffered.
        let mut bytes = Vec::new();
        while bytes.len() < BODY_LIMIT {
            let Some(chunk) = response
                .chunk()
                .await
                .map_err(|err| ProbeError::Transport(err.to_string()))?
            else {
                break;
            };
            let take = chunk.len().min(BODY_LIMIT - bytes.len());
            bytes.extend_from_slice(&chunk[..take]);
        }
        let body = String::from_utf8_lossy(&bytes).into_owned();

        Ok(HttpObservation { status_code, body })
    }
}
