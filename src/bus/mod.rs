//! Event-bus seam. Relay-pool mechanics (retries, reconnection) live
//! behind this trait; the module only needs publish, filtered fetch, and
//! the ledger balance view derived from replaceable state events.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

use crate::nostr::{Event, KIND_REPLACEABLE_CONFIG};

/// Subscription filter in the bus's native JSON shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub t_tags: Option<Vec<String>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
}

impl Filter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        for (name, wanted) in [("p", &self.p_tags), ("t", &self.t_tags), ("d", &self.d_tags)] {
            if let Some(wanted) = wanted {
                let values = event.tag_values(name);
                if !wanted.iter().any(|w| values.contains(&w.as_str())) {
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Hand an event to the outbox. Safe for concurrent use; delivery is
    /// at-least-once downstream.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Fetch stored events matching the filter, oldest first.
    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>>;
}

/// Read the ledger's balance state for a pubkey: one replaceable event per
/// token, `d = balance:<token>:<pubkey>`, amount carried in the `amount`
/// tag. Missing events read as zero balance.
pub async fn balances(
    bus: &dyn EventBus,
    ledger_pubkey: &str,
    pubkey: &str,
    tokens: &[String],
) -> Result<HashMap<String, i64>> {
    let filter = Filter {
        kinds: Some(vec![KIND_REPLACEABLE_CONFIG]),
        authors: Some(vec![ledger_pubkey.to_string()]),
        d_tags: Some(
            tokens
                .iter()
                .map(|token| format!("balance:{token}:{pubkey}"))
                .collect(),
        ),
        ..Filter::default()
    };

    let mut out = HashMap::new();
    for event in bus.fetch(&filter).await? {
        let Some(d_tag) = event.tag_value("d") else {
            continue;
        };
        let Some(token) = d_tag
            .strip_prefix("balance:")
            .and_then(|rest| rest.strip_suffix(&format!(":{pubkey}")))
        else {
            continue;
        };
        let amount: i64 = event
            .tag_value("amount")
            .ok_or_else(|| anyhow!("balance event without amount tag"))?
            .parse()
            .context("unparseable balance amount")?;
        // Replaceable events: the newest one wins.
        out.insert(token.to_string(), amount);
    }
    Ok(out)
}

/// HTTP gateway implementation against the wallet API.
pub struct HttpEventBus {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEventBus {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .context("bus http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EventBus for HttpEventBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/nostr/publish", self.base_url))
            .json(event)
            .send()
            .await
            .context("publish request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("publish rejected with {}", response.status()));
        }
        Ok(())
    }

    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>> {
        let response = self
            .client
            .post(format!("{}/nostr/query", self.base_url))
            .json(filter)
            .send()
            .await
            .context("query request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("query rejected with {}", response.status()));
        }
        let mut events: Vec<Event> = response.json().await.context("query response body")?;
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}

/// In-memory bus for tests: records published events and serves fetches
/// from a seedable store.
#[cfg(test)]
pub struct MemoryBus {
    inner: std::sync::Mutex<MemoryBusInner>,
}

#[cfg(test)]
#[derive(Default)]
struct MemoryBusInner {
    published: Vec<Event>,
    stored: Vec<Event>,
}

#[cfg(test)]
impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(MemoryBusInner::default()),
        }
    }

    pub fn seed(&self, event: Event) {
        self.inner.lock().unwrap().stored.push(event);
    }

    pub fn published(&self) -> Vec<Event> {
        self.inner.lock().unwrap().published.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.published.push(event.clone());
        inner.stored.push(event.clone());
        Ok(())
    }

    async fn fetch(&self, filter: &Filter) -> Result<Vec<Event>> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<Event> = inner
            .stored
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }
}
