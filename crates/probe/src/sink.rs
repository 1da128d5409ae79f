use async_trait::async_trait;
use reqwest::Client;
use url::Url;

use domain_verify_core::ports::{AlertSink, DeliveryReceipt, SinkError};
use domain_verify_core::types::Alert;

/// Posts alerts as JSON to an operator webhook.
#[derive(Clone)]
pub struct WebhookAlertSink {
    http: Client,
    url: Url,
}

impl WebhookAlertSink {
    pub fn new(url: Url, http: Client) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, alert: &Alert) -> Result<DeliveryReceipt, SinkError> {
        let response = self
            .http
            .post(self.url.clone())
            .json(alert)
            .send()
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))?;

        let receipt = DeliveryReceipt {
            status_code: response.status().as_u16(),
        };
        if !receipt.is_success() {
            tracing::debug!(
                stage = "alerts",
                alert_id = %alert.id,
                status = receipt.status_code,
                "alert sink rejected delivery"
            );
        }
        Ok(receipt)
    }
}

/// Sink used when no alert webhook is configured; every delivery is recorded as failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAlertSink;

#[async_trait]
impl AlertSink for DisabledAlertSink {
    async fn deliver(&self, _alert: &Alert) -> Result<DeliveryReceipt, SinkError> {
        Err(SinkError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use domain_verify_core::types::{AlertEvent, Severity};
    use httpmock::prelude::*;
    use serde_json::json;

    fn alert() -> Alert {
        let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc);
        Alert {
            id: "a-1".into(),
            challenge_id: Some("c-1".into()),
            mapping_id: "m-1".into(),
            severity: Severity::Error,
            event_type: AlertEvent::Exhausted,
            message: "verification exhausted".into(),
            payload: json!({ "v": 1 }),
            delivered: false,
            delivery_status_code: None,
            delivery_error: None,
            delivery_attempted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn posts_alert_json() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hooks/alerts")
                    .json_body_partial(r#"{"id":"a-1","severity":"ERROR","eventType":"exhausted"}"#);
                then.status(202);
            })
            .await;

        let sink = WebhookAlertSink::new(
            Url::parse(&server.url("/hooks/alerts")).expect("url"),
            Client::builder().build().expect("client"),
        );
        let receipt = sink.deliver(&alert()).await.expect("deliver");
        mock.assert_async().await;
        assert_eq!(receipt.status_code, 202);
        assert!(receipt.is_success());
    }

    #[tokio::test]
    async fn error_status_is_returned_as_receipt() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hooks/alerts");
                then.status(500);
            })
            .await;

        let sink = WebhookAlertSink::new(
            Url::parse(&server.url("/hooks/alerts")).expect("url"),
            Client::builder().build().expect("client"),
        );
        let receipt = sink.deliver(&alert()).await.expect("deliver");
        assert!(!receipt.is_success());
    }

    #[tokio::test]
    async fn disabled_sink_never_delivers() {
        let err = DisabledAlertSink.deliver(&alert()).await.expect_err("disabled");
        assert_eq!(err, SinkError::NotConfigured);
    }
}
