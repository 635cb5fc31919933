//! Signed-event preflight applied to every inbound event, whether it
//! arrived as an HTTP body or through the subscription loop.

use super::delegation::{self, Conditions};
use super::Event;
use thiserror::Error;

/// Maximum accepted event age in seconds.
pub const MAX_EVENT_AGE_SECS: i64 = 180;

#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("malformed event: {0}")]
    Malformed(&'static str),
    #[error("invalid event signature")]
    Signature,
    #[error("invalid delegation")]
    Delegation,
    #[error("event is too old")]
    Expired,
    #[error("unexpected event author")]
    WrongAuthor,
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Validate an inbound event and return its effective form: on a valid
/// delegation tag the author is rewritten to the delegator.
pub fn validate(
    event: &Event,
    now: i64,
    expected_pubkey: Option<&str>,
) -> Result<Event, PreflightError> {
    if !is_hex(&event.id, 64) {
        return Err(PreflightError::Malformed("id"));
    }
    if !is_hex(&event.pubkey, 64) {
        return Err(PreflightError::Malformed("pubkey"));
    }
    if !is_hex(&event.sig, 128) {
        return Err(PreflightError::Malformed("sig"));
    }
    if event.created_at <= 0 {
        return Err(PreflightError::Malformed("created_at"));
    }

    event
        .verify_signature()
        .map_err(|_| PreflightError::Signature)?;

    let mut effective = event.clone();
    if let Some((delegator, conditions, token)) = event.delegation_tag() {
        let parsed = Conditions::parse(conditions).map_err(|_| PreflightError::Delegation)?;
        if parsed.kind != event.kind || !parsed.is_current(event.created_at) {
            return Err(PreflightError::Delegation);
        }
        delegation::verify_token(&event.pubkey, delegator, conditions, token)
            .map_err(|_| PreflightError::Delegation)?;
        effective.pubkey = delegator.to_string();
    }

    if event.created_at + MAX_EVENT_AGE_SECS < now {
        return Err(PreflightError::Expired);
    }

    if let Some(expected) = expected_pubkey {
        if effective.pubkey != expected {
            return Err(PreflightError::WrongAuthor);
        }
    }

    Ok(effective)
}
