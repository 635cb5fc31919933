//! Event-bus wire model: signed events, their canonical ids, and tag
//! helpers.

pub mod delegation;
pub mod preflight;

use anyhow::{anyhow, Result};
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Regular event kind used for transactions and config changes.
pub const KIND_REGULAR: u32 = 1112;
/// Ephemeral response kind for request/response over HTTP bodies.
pub const KIND_EPHEMERAL_RESPONSE: u32 = 21111;
/// Parameterized-replaceable kind for card-data / card-config documents.
pub const KIND_REPLACEABLE_CONFIG: u32 = 31111;

/// Signed event as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Canonical id preimage: `[0, pubkey, created_at, kind, tags, content]`.
fn event_digest(pubkey: &str, created_at: i64, kind: u32, tags: &[Vec<String>], content: &str) -> [u8; 32] {
    let preimage = json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(preimage.as_bytes()).into()
}

impl Event {
    /// Build and sign an event with the given keypair.
    pub fn sign(
        keypair: &Keypair,
        created_at: i64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let secp = Secp256k1::new();
        let (xonly, _) = keypair.x_only_public_key();
        let pubkey = xonly.to_string();

        let digest = event_digest(&pubkey, created_at, kind, &tags, &content);
        let sig = secp.sign_schnorr(&Message::from_digest(digest), keypair);

        Event {
            id: hex::encode(digest),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: sig.to_string(),
        }
    }

    /// Recompute the canonical id and check the Schnorr signature over it.
    pub fn verify_signature(&self) -> Result<()> {
        let digest = event_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(digest) != self.id {
            return Err(anyhow!("event id does not match content"));
        }

        let pubkey = XOnlyPublicKey::from_str(&self.pubkey)
            .map_err(|_| anyhow!("invalid event pubkey"))?;
        let sig = Signature::from_str(&self.sig).map_err(|_| anyhow!("invalid signature"))?;

        Secp256k1::verification_only()
            .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
            .map_err(|_| anyhow!("signature verification failed"))
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All values of tags named `name`, in tag order.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
            .collect()
    }

    /// The full `["delegation", delegator, conditions, token]` tag, if any.
    pub fn delegation_tag(&self) -> Option<(&str, &str, &str)> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("delegation"))
            .and_then(|t| match t.as_slice() {
                [_, delegator, conditions, token, ..] => {
                    Some((delegator.as_str(), conditions.as_str(), token.as_str()))
                }
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> Keypair {
        Keypair::new(&Secp256k1::new(), &mut rand::thread_rng())
    }

    #[test]
    fn signed_event_verifies() {
        let event = Event::sign(
            &keypair(),
            1700000000,
            KIND_REGULAR,
            vec![vec!["t".into(), "card-config-change".into()]],
            "{}".into(),
        );

        assert_eq!(event.id.len(), 64);
        assert_eq!(event.sig.len(), 128);
        event.verify_signature().unwrap();
    }

    #[test]
    fn tampered_content_fails() {
        let mut event = Event::sign(&keypair(), 1700000000, KIND_REGULAR, vec![], "{}".into());
        event.content = "{\"evil\":true}".into();
        assert!(event.verify_signature().is_err());
    }

    #[test]
    fn tampered_id_fails() {
        let mut event = Event::sign(&keypair(), 1700000000, KIND_REGULAR, vec![], "{}".into());
        event.id = "0".repeat(64);
        assert!(event.verify_signature().is_err());
    }

    #[test]
    fn foreign_signature_fails() {
        let event = Event::sign(&keypair(), 1700000000, KIND_REGULAR, vec![], "{}".into());
        let mut forged = Event::sign(&keypair(), 1700000000, KIND_REGULAR, vec![], "{}".into());
        forged.sig = event.sig;
        assert!(forged.verify_signature().is_err());
    }

    #[test]
    fn tag_lookup() {
        let event = Event::sign(
            &keypair(),
            1700000000,
            KIND_REGULAR,
            vec![
                vec!["p".into(), "aa".into()],
                vec!["p".into(), "bb".into()],
                vec!["t".into(), "internal-transaction-start".into()],
                vec![
                    "delegation".into(),
                    "cc".into(),
                    "kind=1112".into(),
                    "dd".into(),
                ],
            ],
            String::new(),
        );

        assert_eq!(event.tag_value("t"), Some("internal-transaction-start"));
        assert_eq!(event.tag_values("p"), vec!["aa", "bb"]);
        assert_eq!(event.delegation_tag(), Some(("cc", "kind=1112", "dd")));
        assert_eq!(event.tag_value("e"), None);
    }
}
