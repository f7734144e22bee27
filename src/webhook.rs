//! Event-filtered webhook fan-out.
//!
//! Each room may carry one webhook target. The relay posts
//! `{event, room, timestamp, …payload}` for the events the target
//! subscribed to; delivery is fire-and-forget with a 5 s total timeout and
//! no retry queue. Failures are logged once and swallowed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::ids::now_ms;

/// Total request timeout for a webhook POST.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 5;

/// The event names a webhook may subscribe to; `"all"` matches everything.
pub const WEBHOOK_EVENTS: &[&str] = &["all", "join", "leave", "chat", "file_change", "conflict"];

/// Per-room webhook target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    pub events: Vec<String>,
}

impl WebhookConfig {
    pub fn wants(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == "all" || e == event)
    }
}

/// Shared HTTP client for all webhook posts.
#[derive(Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSender {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .expect("webhook HTTP client");
        Self { client }
    }

    /// Post `event` for `room_code` if the config subscribes to it.
    ///
    /// `payload` must be a JSON object; its fields are merged beside the
    /// envelope fields. The POST runs on its own task so no caller ever
    /// blocks on webhook I/O.
    pub fn fire(&self, config: &WebhookConfig, event: &str, room_code: &str, payload: Value) {
        if !config.wants(event) {
            return;
        }
        let mut body = json!({
            "event": event,
            "room": room_code,
            "timestamp": now_ms(),
        });
        if let (Some(target), Some(extra)) = (body.as_object_mut(), payload.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        let client = self.client.clone();
        let url = config.url.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    log::debug!("webhook {event} to {url} answered {}", resp.status());
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("webhook {event} to {url} failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(events: &[&str]) -> WebhookConfig {
        WebhookConfig {
            url: "http://127.0.0.1:1/hook".into(),
            events: events.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_wants_specific_event() {
        let cfg = config(&["join", "chat"]);
        assert!(cfg.wants("join"));
        assert!(cfg.wants("chat"));
        assert!(!cfg.wants("leave"));
        assert!(!cfg.wants("file_change"));
    }

    #[test]
    fn test_wants_all() {
        let cfg = config(&["all"]);
        for event in WEBHOOK_EVENTS {
            assert!(cfg.wants(event));
        }
    }

    #[test]
    fn test_wants_nothing_when_empty() {
        let cfg = config(&[]);
        assert!(!cfg.wants("join"));
    }

    #[tokio::test]
    async fn test_fire_unsubscribed_is_noop() {
        let sender = WebhookSender::new();
        // The URL is unreachable; an unsubscribed event must not even spawn.
        sender.fire(&config(&["chat"]), "join", "HIVE-ABCDEF", json!({}));
    }

    #[tokio::test]
    async fn test_fire_swallows_delivery_errors() {
        let sender = WebhookSender::new();
        // Nothing listens on port 1; the spawned task must swallow the error.
        sender.fire(
            &config(&["all"]),
            "chat",
            "HIVE-ABCDEF",
            json!({"author": "Zeus", "content": "hi"}),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
