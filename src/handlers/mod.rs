pub mod card;
pub mod config;
pub mod ntag424;
pub mod pay;
pub mod reset;
pub mod scan;

use crate::app_state::AppState;
use crate::error::ServiceResult;
use crate::nostr::{preflight, Event};

/// Tap parameters carried on `/ntag424` and `/card/scan`.
#[derive(Debug, serde::Deserialize)]
pub struct TapParams {
    pub p: String,
    pub c: String,
}

/// Run the signed-event preflight on an HTTP body and return the effective
/// event (author rewritten on a valid delegation tag).
pub fn preflighted(
    state: &AppState,
    event: &Event,
    expected_pubkey: Option<&str>,
) -> ServiceResult<Event> {
    Ok(preflight::validate(event, state.now(), expected_pubkey)?)
}
