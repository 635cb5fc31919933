//! External identity provider client: rebinds a registered name to a new
//! pubkey during admin reset. Failures are non-fatal to the reset.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Move the identity bound to `old_pubkey` onto `new_pubkey`; returns
    /// the provider-registered name if one exists.
    async fn transfer(&self, old_pubkey: &str, new_pubkey: &str) -> Result<Option<String>>;

    /// Look up the name registered for a pubkey, if any.
    async fn resolve_name(&self, pubkey: &str) -> Result<Option<String>>;
}

pub struct HttpIdentityApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityApi {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("identity http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest<'a> {
    old_pubkey: &'a str,
    new_pubkey: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    name: Option<String>,
}

#[async_trait]
impl IdentityApi for HttpIdentityApi {
    async fn transfer(&self, old_pubkey: &str, new_pubkey: &str) -> Result<Option<String>> {
        let response = self
            .client
            .post(format!("{}/api/identity/transfer", self.base_url))
            .json(&TransferRequest {
                old_pubkey,
                new_pubkey,
            })
            .send()
            .await
            .context("identity transfer request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "identity transfer rejected with {}",
                response.status()
            ));
        }

        let body: TransferResponse = response.json().await.context("identity response body")?;
        Ok(body.name)
    }

    async fn resolve_name(&self, pubkey: &str) -> Result<Option<String>> {
        let response = self
            .client
            .get(format!("{}/api/identity/{pubkey}", self.base_url))
            .send()
            .await
            .context("identity lookup failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(anyhow!("identity lookup rejected with {}", response.status()));
        }

        let body: TransferResponse = response.json().await.context("identity response body")?;
        Ok(body.name)
    }
}

/// Test double: configurable outcome, records calls.
#[cfg(test)]
pub struct StubIdentityApi {
    pub name: Option<String>,
    pub fail: bool,
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl StubIdentityApi {
    pub fn returning(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
            fail: false,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            name: None,
            fail: true,
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl IdentityApi for StubIdentityApi {
    async fn transfer(&self, old_pubkey: &str, new_pubkey: &str) -> Result<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((old_pubkey.to_string(), new_pubkey.to_string()));
        if self.fail {
            return Err(anyhow!("provider unreachable"));
        }
        Ok(self.name.clone())
    }

    async fn resolve_name(&self, _pubkey: &str) -> Result<Option<String>> {
        if self.fail {
            return Err(anyhow!("provider unreachable"));
        }
        Ok(self.name.clone())
    }
}
