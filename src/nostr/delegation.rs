//! NIP-26 delegation conditions and token verification.

use anyhow::{anyhow, bail, Result};
use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::str::FromStr;

/// Parsed `kind=N&created_at>S&created_at<U` conditions. Clause order is
/// free, but each clause must appear exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conditions {
    pub kind: u32,
    pub since: i64,
    pub until: i64,
}

impl Conditions {
    pub fn parse(conditions: &str) -> Result<Self> {
        let mut kind: Option<u32> = None;
        let mut since: Option<i64> = None;
        let mut until: Option<i64> = None;

        for clause in conditions.split('&') {
            if let Some(value) = clause.strip_prefix("kind=") {
                if kind.replace(parse_positive(value)? as u32).is_some() {
                    bail!("duplicate kind clause");
                }
            } else if let Some(value) = clause.strip_prefix("created_at>") {
                if since.replace(parse_positive(value)?).is_some() {
                    bail!("duplicate created_at> clause");
                }
            } else if let Some(value) = clause.strip_prefix("created_at<") {
                if until.replace(parse_positive(value)?).is_some() {
                    bail!("duplicate created_at< clause");
                }
            } else {
                bail!("unknown delegation clause: {clause}");
            }
        }

        let (kind, since, until) = match (kind, since, until) {
            (Some(k), Some(s), Some(u)) => (k, s, u),
            _ => bail!("delegation conditions must carry kind, created_at> and created_at<"),
        };
        if since >= until {
            bail!("delegation window is empty");
        }

        Ok(Conditions { kind, since, until })
    }

    pub fn is_current(&self, now: i64) -> bool {
        self.since < now && now < self.until
    }
}

fn parse_positive(s: &str) -> Result<i64> {
    let value: i64 = s.parse().map_err(|_| anyhow!("non-numeric condition value"))?;
    if value <= 0 {
        bail!("condition value must be positive");
    }
    Ok(value)
}

/// The string a delegation token signs.
pub fn delegation_string(delegatee: &str, conditions: &str) -> String {
    format!("nostr:delegation:{delegatee}:{conditions}")
}

/// Verify a delegation token: a Schnorr signature by `delegator` over the
/// hashed delegation string for `delegatee`.
pub fn verify_token(delegatee: &str, delegator: &str, conditions: &str, token: &str) -> Result<()> {
    let delegator = XOnlyPublicKey::from_str(delegator)
        .map_err(|_| anyhow!("invalid delegator pubkey"))?;
    let sig = Signature::from_str(token).map_err(|_| anyhow!("invalid delegation token"))?;

    let digest: [u8; 32] =
        Sha256::digest(delegation_string(delegatee, conditions).as_bytes()).into();

    Secp256k1::verification_only()
        .verify_schnorr(&sig, &Message::from_digest(digest), &delegator)
        .map_err(|_| anyhow!("delegation token verification failed"))
}

/// Produce a delegation token, used by tests and provisioning tools.
pub fn sign_token(
    delegator: &secp256k1::Keypair,
    delegatee: &str,
    conditions: &str,
) -> Signature {
    let digest: [u8; 32] =
        Sha256::digest(delegation_string(delegatee, conditions).as_bytes()).into();
    Secp256k1::new().sign_schnorr(&Message::from_digest(digest), delegator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Keypair;

    const CONDITIONS: &str = "kind=1112&created_at<1700762400&created_at>1698080400";

    #[test]
    fn parses_clauses_in_any_order() {
        let parsed = Conditions::parse(CONDITIONS).unwrap();
        assert_eq!(parsed.kind, 1112);
        assert_eq!(parsed.since, 1698080400);
        assert_eq!(parsed.until, 1700762400);

        let reordered =
            Conditions::parse("created_at>1698080400&kind=1112&created_at<1700762400").unwrap();
        assert_eq!(reordered, parsed);
    }

    #[test]
    fn rejects_malformed_conditions() {
        for bad in [
            "kind=1112",
            "kind=1112&created_at>10&created_at<20&kind=1",
            "kind=abc&created_at>10&created_at<20",
            "kind=1112&created_at>20&created_at<10",
            "kind=1112&created_at>0&created_at<20",
            "kind=1112&created_at>10&created_at<20&weird=1",
        ] {
            assert!(Conditions::parse(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn window_check() {
        let conditions = Conditions::parse(CONDITIONS).unwrap();
        assert!(conditions.is_current(1699000000));
        assert!(!conditions.is_current(1698080399));
        assert!(!conditions.is_current(1700762401));
    }

    #[test]
    fn token_round_trip() {
        let secp = Secp256k1::new();
        let holder = Keypair::new(&secp, &mut rand::thread_rng());
        let (holder_pub, _) = holder.x_only_public_key();
        let holder_hex = holder_pub.to_string();

        let token = sign_token(&holder, &holder_hex, CONDITIONS).to_string();
        verify_token(&holder_hex, &holder_hex, CONDITIONS, &token).unwrap();

        // A different delegatee string invalidates the token.
        assert!(verify_token(&"0".repeat(64), &holder_hex, CONDITIONS, &token).is_err());
    }
}
