//! Conversation notifications — per-domain webhook delivery with
//! duplicate suppression.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use braid_auth::SlackConfig;
use braid_core::mask::mask;

/// Bounded memory of the last user text seen per domain.
const SUPPRESSION_CAPACITY: usize = 1_000;
const DELIVERY_DEADLINE: Duration = Duration::from_secs(5);

/// Tiny LRU: lookups and inserts touch the recency order; overflow evicts
/// the coldest domain.
struct LastTextLru {
    map: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LastTextLru {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record `text` for `domain`; returns true when it differs from the
    /// previous entry.
    fn changed(&mut self, domain: &str, text: &str) -> bool {
        let unchanged = self.map.get(domain).is_some_and(|prev| prev == text);
        self.touch(domain);
        if !unchanged {
            self.map.insert(domain.to_string(), text.to_string());
        }
        !unchanged
    }

    fn touch(&mut self, domain: &str) {
        if let Some(pos) = self.order.iter().position(|d| d == domain) {
            self.order.remove(pos);
        }
        self.order.push_back(domain.to_string());
        while self.order.len() > self.capacity {
            if let Some(coldest) = self.order.pop_front() {
                self.map.remove(&coldest);
            }
        }
    }
}

pub struct Notifier {
    client: reqwest::Client,
    last_text: Mutex<LastTextLru>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            last_text: Mutex::new(LastTextLru::new(SUPPRESSION_CAPACITY)),
        }
    }

    /// Whether a notification should go out for this user text — false when
    /// the text is unchanged since the domain's previous request.
    pub fn should_notify(&self, domain: &str, user_text: &str) -> bool {
        self.last_text.lock().unwrap().changed(domain, user_text)
    }

    /// Best-effort webhook delivery. Failures are logged, never raised.
    pub async fn deliver(&self, domain: &str, slack: &SlackConfig, payload: Value) {
        if !slack.enabled {
            return;
        }
        let Some(url) = &slack.webhook_url else {
            return;
        };

        let result = tokio::time::timeout(
            DELIVERY_DEADLINE,
            self.client.post(url).json(&payload).send(),
        )
        .await;

        match result {
            Ok(Ok(resp)) if resp.status().is_success() => {
                debug!(domain, "notification delivered");
            }
            Ok(Ok(resp)) => {
                warn!(domain, status = resp.status().as_u16(), "notification rejected");
            }
            Ok(Err(e)) => warn!(domain, error = %e, "notification delivery failed"),
            Err(_) => warn!(domain, "notification delivery timed out"),
        }
    }
}

/// Assemble the outbound payload. All free text passes through the mask.
pub fn build_payload(
    slack: &SlackConfig,
    domain: &str,
    model: &str,
    user_text: &str,
    response_text: Option<&str>,
) -> Value {
    let mut text = format!(
        "*{domain}* ({model})\n> {}",
        mask(&truncate(user_text, 500))
    );
    if let Some(response) = response_text {
        text.push_str(&format!("\n{}", mask(&truncate(response, 1_000))));
    }

    let mut payload = serde_json::json!({ "text": text });
    if let Some(channel) = &slack.channel {
        payload["channel"] = Value::String(channel.clone());
    }
    if let Some(username) = &slack.username {
        payload["username"] = Value::String(username.clone());
    }
    if let Some(icon) = &slack.icon_emoji {
        payload["icon_emoji"] = Value::String(icon.clone());
    }
    payload
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}
