use anyhow::{anyhow, bail, Context as _, Result};
use clap::Parser;
use secp256k1::{Keypair, Secp256k1, SecretKey};

use crate::crypto::AesKey;

/// Lifetime of an admin-issued reset nonce.
pub const RESET_TOKEN_TTL_SECS: i64 = 180;

#[derive(Parser, Debug, Clone)]
#[command(name = "lawallet-card-server")]
#[command(about = "NTAG 424 tap-authentication and withdrawal-authorization server")]
#[command(version)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Public base URL for scan/pay callbacks (e.g. "https://cards.example.com")
    #[arg(long, env = "BASE_URL")]
    pub base_url: String,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://cards.db")]
    pub database_url: String,

    /// Module-wide AES-128 PICC decryption key (k1), 32 hex chars
    #[arg(long, env = "SERVER_AES_KEY_HEX")]
    pub server_aes_key_hex: String,

    /// Module signing key, 64 hex chars
    #[arg(long, env = "NOSTR_PRIVATE_KEY")]
    pub nostr_private_key: String,

    /// Module public key, 64 hex chars; must match the private key
    #[arg(long, env = "NOSTR_PUBLIC_KEY")]
    pub nostr_public_key: String,

    /// Authority allowed to initialize and associate tags
    #[arg(long, env = "CARD_WRITER_PUBKEY")]
    pub card_writer_pubkey: String,

    /// `:`-separated admin pubkeys
    #[arg(long, env = "ADMIN_PUBKEYS", default_value = "")]
    pub admin_pubkeys: String,

    /// Federation id gating the extended scan actions
    #[arg(long, env = "LAWALLET_FEDERATION_ID", default_value = "lawallet.ar")]
    pub federation_id: String,

    /// Event-bus HTTP gateway base URL
    #[arg(long, env = "LAWALLET_API_BASE_URL")]
    pub lawallet_api_base_url: String,

    /// Identity provider API base URL
    #[arg(long, env = "IDENTITY_PROVIDER_API_BASE")]
    pub identity_provider_api_base: String,

    /// Ledger pubkey receiving transfer events
    #[arg(long, env = "LEDGER_PUBLIC_KEY")]
    pub ledger_public_key: String,

    /// BTC gateway pubkey p-tagged on bolt11 withdrawals
    #[arg(long, env = "BTC_GATEWAY_PUBLIC_KEY")]
    pub btc_gateway_public_key: String,

    /// `:`-joined default limits, each `name;description;token;amount;delta`
    #[arg(long, env = "DEFAULT_LIMITS", default_value = "")]
    pub default_limits: String,

    /// `:`-separated default trusted merchant pubkeys
    #[arg(long, env = "DEFAULT_TRUSTED_MERCHANTS", default_value = "")]
    pub default_trusted_merchants: String,

    /// Seconds a scan token stays redeemable
    #[arg(long, env = "PAYMENT_REQUEST_EXPIRY_IN_SECONDS", default_value = "60")]
    pub payment_request_expiry_seconds: i64,
}

/// One default spending rule from `DEFAULT_LIMITS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSpec {
    pub name: String,
    pub description: String,
    pub token: String,
    pub amount: i64,
    pub delta: i64,
}

impl Config {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pay_callback_url(&self) -> String {
        format!("{}/card/pay", self.base_url)
    }

    pub fn lnurlp_callback_url(&self, holder_pubkey: &str) -> String {
        format!("{}/lnurlp/{}/callback", self.base_url, holder_pubkey)
    }

    pub fn aes_key(&self) -> Result<AesKey> {
        AesKey::from_hex(&self.server_aes_key_hex).context("SERVER_AES_KEY_HEX")
    }

    /// Parse the module keypair and check it matches the declared pubkey.
    pub fn keypair(&self) -> Result<Keypair> {
        let sk = SecretKey::from_slice(
            &hex::decode(&self.nostr_private_key).context("NOSTR_PRIVATE_KEY")?,
        )
        .context("NOSTR_PRIVATE_KEY")?;
        let keypair = Keypair::from_secret_key(&Secp256k1::new(), &sk);

        let (derived, _) = keypair.x_only_public_key();
        if derived.to_string() != self.nostr_public_key {
            bail!("NOSTR_PUBLIC_KEY does not match NOSTR_PRIVATE_KEY");
        }
        Ok(keypair)
    }

    pub fn admin_pubkey_list(&self) -> Vec<String> {
        split_colon_list(&self.admin_pubkeys)
    }

    pub fn default_trusted_merchant_list(&self) -> Vec<String> {
        split_colon_list(&self.default_trusted_merchants)
    }

    pub fn default_limit_list(&self) -> Result<Vec<LimitSpec>> {
        split_colon_list(&self.default_limits)
            .iter()
            .map(|entry| parse_limit_spec(entry))
            .collect()
    }
}

fn split_colon_list(s: &str) -> Vec<String> {
    s.split(':')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_limit_spec(entry: &str) -> Result<LimitSpec> {
    let fields: Vec<&str> = entry.split(';').collect();
    let [name, description, token, amount, delta] = fields[..] else {
        bail!("limit spec must have 5 `;`-separated fields: {entry}");
    };

    let amount: i64 = amount.parse().map_err(|_| anyhow!("bad limit amount in {entry}"))?;
    let delta: i64 = delta.parse().map_err(|_| anyhow!("bad limit delta in {entry}"))?;
    if amount < 0 || delta <= 0 {
        bail!("limit amount must be >= 0 and delta > 0: {entry}");
    }

    Ok(LimitSpec {
        name: name.to_string(),
        description: description.to_string(),
        token: token.to_string(),
        amount,
        delta,
    })
}
