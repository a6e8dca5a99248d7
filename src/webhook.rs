//! MicroMDM-compatible event webhook.
//!
//! Protocol handlers hand every accepted message to an [`EventSink`].
//! [`MicroWebhook`] serializes it as a MicroMDM webhook event and POSTs it to
//! the configured URL from a background task, so a slow or failing receiver
//! never delays or fails the device's request.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;

/// Enrollment (`Authenticate` check-in).
pub const TOPIC_AUTHENTICATE: &str = "mdm.Authenticate";
/// Push token update check-in.
pub const TOPIC_TOKEN_UPDATE: &str = "mdm.TokenUpdate";
/// Device unenrolled.
pub const TOPIC_CHECK_OUT: &str = "mdm.CheckOut";
/// Command report on the connect endpoint.
pub const TOPIC_CONNECT: &str = "mdm.Connect";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// `mdm.*` topic.
    pub topic: String,
    /// Unique per event.
    pub event_id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set for check-in topics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_event: Option<CheckinEvent>,
    /// Set for `mdm.Connect`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledge_event: Option<AcknowledgeEvent>,
}

/// Check-in message details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinEvent {
    /// Device UDID.
    pub udid: String,
    /// Enrollment identifier.
    pub enrollment_id: String,
    /// Request body as received, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub raw_payload: Vec<u8>,
}

/// Command result details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeEvent {
    /// Device UDID.
    pub udid: String,
    /// Enrollment identifier.
    pub enrollment_id: String,
    /// `Idle`, `Acknowledged`, `Error`, `NotNow`...
    pub status: String,
    /// Command being reported on; empty when idle.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_uuid: String,
    /// Request body as received, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub raw_payload: Vec<u8>,
}

impl Event {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            event_id: Uuid::new_v4(),
            created_at: Utc::now(),
            checkin_event: None,
            acknowledge_event: None,
        }
    }

    /// Check-in event for `topic`. The enrollment identifier doubles as the
    /// UDID for device enrollments.
    pub fn checkin(topic: &str, enrollment_id: &str, raw_payload: Vec<u8>) -> Self {
        Self {
            checkin_event: Some(CheckinEvent {
                udid: enrollment_id.to_owned(),
                enrollment_id: enrollment_id.to_owned(),
                raw_payload,
            }),
            ..Self::new(topic)
        }
    }

    /// `mdm.Connect` event.
    pub fn connect(
        enrollment_id: &str,
        status: impl Into<String>,
        command_uuid: impl Into<String>,
        raw_payload: Vec<u8>,
    ) -> Self {
        Self {
            acknowledge_event: Some(AcknowledgeEvent {
                udid: enrollment_id.to_owned(),
                enrollment_id: enrollment_id.to_owned(),
                status: status.into(),
                command_uuid: command_uuid.into(),
                raw_payload,
            }),
            ..Self::new(TOPIC_CONNECT)
        }
    }
}

/// Destination for protocol events. `emit` must not block.
pub trait EventSink: Send + Sync {
    /// Deliver `event` (or drop it).
    fn emit(&self, event: Event);
}

/// Discards events; used when no webhook URL is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, event: Event) {
        debug!(topic = %event.topic, "No webhook configured, dropping event");
    }
}

/// POSTs events as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct MicroWebhook {
    url: String,
    client: reqwest::Client,
}

impl MicroWebhook {
    /// Webhook posting to `url`.
    ///
    /// Fails when the HTTP client cannot be built (TLS backend setup).
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()?,
        })
    }

    /// Per-request timeout for deliveries.
    pub const fn timeout() -> Duration {
        WEBHOOK_TIMEOUT
    }

    /// Deliver one event and wait for the response.
    pub async fn post(&self, event: &Event) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl EventSink for MicroWebhook {
    fn emit(&self, event: Event) {
        let webhook = self.clone();
        tokio::spawn(async move {
            match webhook.post(&event).await {
                Ok(()) => debug!(topic = %event.topic, event_id = %event.event_id, "Webhook delivered"),
                Err(e) => warn!(topic = %event.topic, url = %webhook.url, error = %e, "Webhook delivery failed"),
            }
        });
    }
}

/// Sink selected by `config`.
pub fn event_sink(config: &WebhookConfig) -> crate::Result<Arc<dyn EventSink>> {
    match &config.url {
        Some(url) => {
            let webhook = MicroWebhook::new(url.clone())
                .map_err(|e| crate::Error::Config(format!("Cannot build webhook client: {e}")))?;
            Ok(Arc::new(webhook))
        }
        None => Ok(Arc::new(NoopSink)),
    }
}

mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn checkin_event_json_shape() {
        let event = Event::checkin(TOPIC_AUTHENTICATE, "UDID-1", b"<plist/>".to_vec());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["topic"], "mdm.Authenticate");
        assert_eq!(json["checkin_event"]["udid"], "UDID-1");
        assert_eq!(json["checkin_event"]["enrollment_id"], "UDID-1");
        assert_eq!(json["checkin_event"]["raw_payload"], STANDARD.encode(b"<plist/>"));
        assert!(json.get("acknowledge_event").is_none());
    }

    #[test]
    fn connect_event_carries_status_and_command() {
        let event = Event::connect("UDID-1", "Acknowledged", "cmd-1", Vec::new());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["topic"], "mdm.Connect");
        assert_eq!(json["acknowledge_event"]["status"], "Acknowledged");
        assert_eq!(json["acknowledge_event"]["command_uuid"], "cmd-1");
        assert!(json.get("checkin_event").is_none());
    }

    #[test]
    fn idle_connect_omits_command_uuid() {
        let event = Event::connect("UDID-1", "Idle", "", Vec::new());
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["acknowledge_event"].get("command_uuid").is_none());
    }

    #[test]
    fn event_deserializes_back() {
        let event = Event::checkin(TOPIC_TOKEN_UPDATE, "enr", vec![0, 1, 2, 255]);
        let parsed: Event = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn event_ids_are_unique() {
        let a = Event::checkin(TOPIC_CHECK_OUT, "enr", Vec::new());
        let b = Event::checkin(TOPIC_CHECK_OUT, "enr", Vec::new());
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn event_sink_builds_webhook_when_url_is_set() {
        let config = WebhookConfig {
            url: Some("http://127.0.0.1:9/hook".to_string()),
        };
        assert!(event_sink(&config).is_ok());
        assert!(event_sink(&WebhookConfig { url: None }).is_ok());
    }

    #[tokio::test]
    async fn slow_receiver_hits_the_client_timeout() {
        // GIVEN: a receiver that never answers within the delivery timeout
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(MicroWebhook::timeout() * 2).await;
        });

        // WHEN
        let webhook = MicroWebhook::new(format!("http://{addr}/hook")).unwrap();
        let event = Event::checkin(TOPIC_AUTHENTICATE, "enr", Vec::new());
        let err = tokio::time::timeout(
            MicroWebhook::timeout() + Duration::from_secs(5),
            webhook.post(&event),
        )
        .await
        .expect("client timeout did not fire")
        .unwrap_err();

        // THEN: the client gave up on its own
        assert!(err.is_timeout(), "got {err}");
    }

    #[tokio::test]
    async fn post_to_unreachable_url_is_an_error() {
        let webhook = MicroWebhook::new("http://127.0.0.1:1/webhook").unwrap();
        let event = Event::checkin(TOPIC_AUTHENTICATE, "enr", Vec::new());
        assert!(webhook.post(&event).await.is_err());
    }

    #[tokio::test]
    async fn post_delivers_json_to_receiver() {
        use axum::{Json, Router, routing::post};
        use tokio::sync::mpsc;

        // GIVEN: a receiver that forwards what it gets
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let app = Router::new().route(
            "/hook",
            post(move |Json(event): Json<Event>| {
                let tx = tx.clone();
                async move {
                    tx.send(event).unwrap();
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        // WHEN: an event is emitted
        let webhook = MicroWebhook::new(format!("http://{addr}/hook")).unwrap();
        let event = Event::checkin(TOPIC_AUTHENTICATE, "enr", b"body".to_vec());
        webhook.emit(event.clone());

        // THEN: the receiver gets the same event
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, event);
    }
}
