use serde::{Deserialize, Serialize};

/// A card theme.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Design {
    pub uuid: String,
    pub name: String,
    pub description: String,
}

/// Cryptographic identity of a physical tag. `k1` is the module-wide
/// decryption key; the other four are per-card.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Ntag {
    pub cid: String,
    pub k0: String,
    pub k1: String,
    pub k2: String,
    pub k3: String,
    pub k4: String,
    pub ctr: i64,
    pub otc: Option<String>,
    pub design_uuid: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Holder {
    pub pubkey: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delegation {
    pub id: i64,
    pub delegator_pubkey: String,
    pub conditions: String,
    pub delegation_token: String,
    pub since: i64,
    pub until: i64,
}

/// Logical card bound 1:1 to a tag; `holder_pubkey` stays null until
/// activation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub ntag424_cid: String,
    pub holder_pubkey: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Limit {
    pub uuid: String,
    pub card_uuid: String,
    pub name: String,
    pub description: String,
    pub token: String,
    pub amount: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub card_uuid: String,
    pub token: String,
    pub amount: i64,
    pub status: String,
    pub payment_request_uuid: String,
    pub created_at: i64,
}

/// A single-use scan token; `response` holds the pre-rendered scan reply
/// without its `k1`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub uuid: String,
    pub card_uuid: String,
    pub response: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ResetToken {
    pub holder_pubkey: String,
    pub token: String,
    pub created_at: i64,
}
