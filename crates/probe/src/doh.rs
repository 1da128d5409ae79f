use async_trait::async_trait;
use reqwest::{header::ACCEPT, Client};
use serde::Deserialize;
use url::Url;

use domain_verify_core::ports::{DnsProbe, ProbeError};

const DNS_JSON: &str = "application/dns-json";
const RR_TYPE_TXT: u16 = 16;
const RCODE_NOERROR: u32 = 0;
const RCODE_NXDOMAIN: u32 = 3;

/// TXT lookups through a DNS-over-HTTPS resolver speaking the JSON API.
#[derive(Clone)]
pub struct DohResolver {
    http: Client,
    endpoint: Url,
}

impl DohResolver {
    pub fn new(endpoint: Url, http: Client) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl DnsProbe for DohResolver {
    async fn query_txt(&self, record_name: &str) -> Result<Vec<String>, ProbeError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("name", record_name)
            .append_pair("type", "TXT");

        let response = self
            .http
            .get(url)
            .header(ACCEPT, DNS_JSON)
            .send()
            .await
            .map_err(|err| ProbeError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let body: DohResponse = response
            .json()
            .await
            .map_err(|err| ProbeError::InvalidResponse(err.to_string()))?;

        match body.status {
            RCODE_NOERROR => Ok(body
                .answer
                .into_iter()
                .filter(|answer| answer.rr_type == RR_TYPE_TXT)
                .map(|answer| parse_txt_data(&answer.data))
                .collect()),
            RCODE_NXDOMAIN => Ok(Vec::new()),
            rcode => Err(ProbeError::InvalidResponse(format!(
                "resolver returned rcode {rcode}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rr_type: u16,
    data: String,
}

/// Joins the quoted character-strings of a TXT record into one value.
///
/// Resolvers present `"part one" "part two"` for records split into several
/// strings; unquoted data is returned as-is.
fn parse_txt_data(data: &str) -> String {
    let trimmed = data.trim();
    if !trimmed.starts_with('"') {
        return trimmed.to_string();
    }

    let mut value = String::with_capacity(trimmed.len());
    let mut chars = trimmed.chars();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match (quoted, c) {
            (false, '"') => quoted = true,
            (false, _) => {}
            (true, '"') => quoted = false,
            (true, '\\') => {
                if let Some(escaped) = chars.next() {
                    value.push(escaped);
                }
            }
            (true, other) => value.push(other),
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn resolver(server: &MockServer) -> DohResolver {
        DohResolver::new(
            Url::parse(&server.url("/dns-query")).expect("url"),
            Client::builder().build().expect("client"),
        )
    }

    #[test]
    fn joins_split_character_strings() {
        assert_eq!(parse_txt_data("\"site-verification=\" \"abc\""), "site-verification=abc");
        assert_eq!(parse_txt_data("\"say \\\"hi\\\"\""), "say \"hi\"");
        assert_eq!(parse_txt_data("plain"), "plain");
    }

    #[tokio::test]
    async fn returns_txt_values() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dns-query")
                    .query_param("name", "_site-verification.example.com")
                    .query_param("type", "TXT")
                    .header("accept", DNS_JSON);
                then.status(200).json_body(json!({
                    "Status": 0,
                    "Answer": [
                        { "name": "_site-verification.example.com", "type": 5, "TTL": 60, "data": "alias.example.net." },
                        { "name": "_site-verification.example.com", "type": 16, "TTL": 60, "data": "\"site-verification=abc\"" }
                    ]
                }));
            })
            .await;

        let values = resolver(&server)
            .query_txt("_site-verification.example.com")
            .await
            .expect("query");
        mock.assert_async().await;
        assert_eq!(values, vec!["site-verification=abc".to_string()]);
    }

    #[tokio::test]
    async fn nxdomain_is_empty() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/dns-query");
                then.status(200).json_body(json!({ "Status": 3 }));
            })
            .await;

        let values = resolver(&server)
            .query_txt("_site-verification.missing.example")
            .await
            .expect("query");
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn servfail_and_http_errors_are_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dns-query")
                    .query_param("name", "servfail.example");
                then.status(200).json_body(json!({ "Status": 2 }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/dns-query")
                    .query_param("name", "down.example");
                then.status(503);
            })
            .await;

        let resolver = resolver(&server);
        let err = resolver.query_txt("servfail.example").await.expect_err("servfail");
        assert!(matches!(err, ProbeError::InvalidResponse(_)));
        let err = resolver.query_txt("down.example").await.expect_err("503");
        assert_eq!(err, ProbeError::Status(503));
    }
}
