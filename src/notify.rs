// =============================================================================
// Notification sink — fire-and-forget webhook with per-title cooldown
// =============================================================================
//
// Payload shape is auto-detected from the webhook URL: Lark/Feishu gets an
// interactive card, Dingtalk a text message, anything else `{"text": ...}`.
// Repeated sends with the same title are suppressed for 60 s so a flapping
// condition cannot spam the channel.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::NotificationConfig;

/// Cooldown window per distinct title.
const TITLE_COOLDOWN: Duration = Duration::from_secs(60);
/// Best-effort send timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Card bodies longer than this are truncated.
const MAX_BODY_LEN: usize = 5000;

pub struct Notifier {
    config: NotificationConfig,
    client: reqwest::Client,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            config,
            client,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Send `message` under `title`. Disabled sinks and titles inside their
    /// cooldown window return silently; transport errors are logged, never
    /// propagated.
    pub async fn send(&self, title: &str, message: &str) {
        if !self.config.enabled || self.config.webhook_url.is_empty() {
            return;
        }

        {
            let mut cooldowns = self.cooldowns.lock();
            let now = Instant::now();
            if let Some(last) = cooldowns.get(title) {
                if now.duration_since(*last) < TITLE_COOLDOWN {
                    debug!(title, "notification suppressed by cooldown");
                    return;
                }
            }
            cooldowns.insert(title.to_string(), now);
        }

        let payload = build_payload(&self.config.webhook_url, title, message);

        match self
            .client
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
            .await
        {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "notification webhook returned non-success");
            }
            Ok(_) => debug!(title, "notification sent"),
            Err(e) => warn!(error = %e, "notification send failed"),
        }
    }
}

/// Shape the payload for the detected webhook flavour.
fn build_payload(webhook_url: &str, title: &str, message: &str) -> serde_json::Value {
    let body = if message.len() > MAX_BODY_LEN {
        // Truncate on a char boundary.
        let mut end = MAX_BODY_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &message[..end])
    } else {
        message.to_string()
    };

    if webhook_url.contains("feishu") || webhook_url.contains("lark") {
        json!({
            "msg_type": "interactive",
            "card": {
                "config": { "wide_screen_mode": true },
                "header": {
                    "title": { "tag": "plain_text", "content": title },
                    "template": header_color(title, &body)
                },
                "elements": [
                    { "tag": "div", "text": { "tag": "lark_md", "content": body } }
                ]
            }
        })
    } else if webhook_url.contains("dingtalk") {
        json!({
            "msgtype": "text",
            "text": { "content": format!("{title}\n{body}") }
        })
    } else {
        json!({ "text": format!("{title}\n{body}") })
    }
}

/// Card header colour keyed off the message tone.
fn header_color(title: &str, body: &str) -> &'static str {
    let all = format!("{title} {body}");
    if all.contains("FAILED") || all.contains("\u{274c}") {
        "red"
    } else if all.contains("WARN") || all.contains("\u{26a0}") {
        "yellow"
    } else if all.contains("BUY") || all.contains("\u{1f680}") {
        "green"
    } else if all.contains("SELL") || all.contains("\u{1f4c9}") {
        "red"
    } else {
        "blue"
    }
}
