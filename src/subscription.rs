//! Inbound subscription loop: consumes config-change events from the bus,
//! resuming from a persisted high-watermark.

use anyhow::Result;
use std::time::Duration;

use crate::app_state::AppState;
use crate::bus::Filter;
use crate::cardconfig::{self, TOPIC_CARD_CONFIG_CHANGE};
use crate::db::registry;
use crate::nostr::{preflight, KIND_REGULAR};

pub const SUBSCRIPTION: &str = "card-config-change";

/// Fetch window slack below the watermark: twice the maximum event age,
/// absorbing clock skew and out-of-order delivery.
pub const TOLERANCE_SECS: i64 = 2 * preflight::MAX_EVENT_AGE_SECS;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Long-lived consumer task.
pub async fn run(state: AppState) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = poll_once(&state).await {
            tracing::warn!(error = %err, "subscription poll failed");
        }
    }
}

/// One poll cycle: fetch from watermark − tolerance, preflight, dispatch,
/// advance. Handlers are idempotent, so the overlap window is harmless.
pub async fn poll_once(state: &AppState) -> Result<()> {
    let watermark = registry::watermark(&state.pool, SUBSCRIPTION)
        .await?
        .unwrap_or(0);

    let filter = Filter {
        kinds: Some(vec![KIND_REGULAR]),
        p_tags: Some(vec![state.keys.pubkey.clone()]),
        t_tags: Some(vec![TOPIC_CARD_CONFIG_CHANGE.to_string()]),
        since: Some((watermark - TOLERANCE_SECS).max(0)),
        ..Filter::default()
    };

    for event in state.bus.fetch(&filter).await? {
        if event.created_at <= watermark {
            // Already handled before the last restart.
            continue;
        }

        match preflight::validate(&event, state.now(), None) {
            Ok(effective) => {
                let outcome = match event.tag_value("t") {
                    Some(TOPIC_CARD_CONFIG_CHANGE) => {
                        cardconfig::apply_config_change(state, &effective).await
                    }
                    other => {
                        tracing::debug!(topic = ?other, "ignoring unhandled topic");
                        Ok(())
                    }
                };
                if let Err(err) = outcome {
                    tracing::warn!(event = %event.id, error = %err, "config change rejected");
                }
            }
            Err(err) => {
                tracing::debug!(event = %event.id, error = %err, "dropping invalid event");
            }
        }

        registry::advance_watermark(&state.pool, SUBSCRIPTION, event.created_at).await?;
    }

    Ok(())
}
