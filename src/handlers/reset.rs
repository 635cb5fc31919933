//! Admin-driven card reset: an admin tap plus a target tap mint a
//! short-lived nonce; the new holder claims it to take over the target's
//! cards. Everything after the nonce is deleted is best-effort and
//! reported per step.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::card::{validated_delegation, DelegationBody};
use super::pay::{self, TOPIC_TRANSACTION_START};
use super::preflighted;
use crate::app_state::AppState;
use crate::bus;
use crate::config::RESET_TOKEN_TTL_SECS;
use crate::db::registry::{self, NewDelegation};
use crate::error::{ServiceError, ServiceResult};
use crate::nostr::{Event, KIND_REGULAR};
use crate::suuid::uuid2suuid;
use crate::verifier;

pub const TOPIC_IDENTITY_TRANSFER_OK: &str = "identity-transfer-ok";

#[derive(Debug, Deserialize)]
pub struct PcPair {
    pub p: String,
    pub c: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequestBody {
    pub admin: PcPair,
    pub target: PcPair,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequestResponse {
    pub status: String,
    pub nonce: String,
}

/// Resolve a tap to its card holder, masking every verifier detail.
async fn holder_of_tap(state: &AppState, pair: &PcPair) -> ServiceResult<String> {
    let verified = verifier::verify(&state.pool, &state.keys.aes_k1, &pair.p, &pair.c)
        .await
        .map_err(|err| {
            tracing::debug!(error = %err, "reset tap rejected");
            ServiceError::Malformed("Failed to retrieve card data".to_string())
        })?;

    let card = registry::card_by_cid(&state.pool, &verified.ntag.cid)
        .await?
        .ok_or_else(|| ServiceError::Malformed("Failed to retrieve card data".to_string()))?;
    card.holder_pubkey
        .ok_or_else(|| ServiceError::Malformed("Failed to retrieve card data".to_string()))
}

/// POST /card/reset/request
pub async fn reset_request(
    State(state): State<AppState>,
    Json(body): Json<ResetRequestBody>,
) -> ServiceResult<Json<ResetRequestResponse>> {
    let admins = state.config.admin_pubkey_list();

    let admin_holder = holder_of_tap(&state, &body.admin).await?;
    if !admins.contains(&admin_holder) {
        return Err(ServiceError::Malformed(
            "admin authorization failed".to_string(),
        ));
    }

    let target_holder = holder_of_tap(&state, &body.target).await?;
    if target_holder == admin_holder || admins.contains(&target_holder) {
        return Err(ServiceError::Malformed(
            "target card cannot be reset".to_string(),
        ));
    }

    let nonce = uuid2suuid(&Uuid::new_v4());
    registry::upsert_reset_token(&state.pool, &target_holder, &nonce, state.now()).await?;

    Ok(Json(ResetRequestResponse {
        status: "OK".to_string(),
        nonce,
    }))
}

#[derive(Debug, Deserialize)]
struct ClaimContent {
    otc: String,
    delegation: DelegationBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetClaimResponse {
    pub funds_transfer: bool,
    pub identity_event: bool,
    pub identity_provider: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// POST /card/reset/claim
pub async fn reset_claim(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<(StatusCode, Json<ResetClaimResponse>)> {
    let event = preflighted(&state, &body, None)?;

    let content: ClaimContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Unprocessable(format!("bad claim content: {err}")))?;
    let new_holder = event.pubkey.clone();

    let conditions = validated_delegation(&new_holder, &content.delegation)?;

    let now = state.now();
    let token = registry::reset_token_by_token(&state.pool, &content.otc)
        .await?
        .ok_or_else(|| ServiceError::Unprocessable("unknown reset code".to_string()))?;
    if now - token.created_at > RESET_TOKEN_TTL_SECS {
        return Err(ServiceError::Unprocessable("reset code expired".to_string()));
    }
    let old_holder = token.holder_pubkey.clone();

    // Point of no return: the nonce dies before any mutation, so a crashed
    // claim cannot be replayed.
    registry::delete_reset_token(&state.pool, &old_holder).await?;

    let mut tx = state.pool.begin().await?;
    registry::upsert_holder(
        &mut *tx,
        &new_holder,
        &NewDelegation {
            conditions: &content.delegation.conditions,
            token: &content.delegation.token,
            since: conditions.since,
            until: conditions.until,
        },
        &state.config.default_trusted_merchant_list(),
    )
    .await?;
    registry::clone_trusted_merchants(&mut *tx, &old_holder, &new_holder).await?;
    registry::reassign_cards(&mut *tx, &old_holder, &new_holder).await?;
    tx.commit().await?;

    let funds_transfer = transfer_remaining_funds(&state, &old_holder, &new_holder).await;
    let identity_event = publish_identity_transfer(&state, &old_holder, &new_holder).await;
    let (identity_provider, name) = match state.identity.transfer(&old_holder, &new_holder).await {
        Ok(name) => (true, name),
        Err(err) => {
            tracing::warn!(error = %err, "identity provider transfer failed");
            (false, None)
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(ResetClaimResponse {
            funds_transfer,
            identity_event,
            identity_provider,
            name,
        }),
    ))
}

/// Move the old holder's remaining balance under their old delegation.
/// A zero balance counts as done; a missing delegation cannot be recovered.
async fn transfer_remaining_funds(state: &AppState, old_holder: &str, new_holder: &str) -> bool {
    let delegation = match registry::current_delegation(&state.pool, old_holder, state.now()).await
    {
        Ok(Some(delegation)) => delegation,
        Ok(None) => {
            tracing::warn!(holder = %old_holder, "no delegation for funds transfer");
            return false;
        }
        Err(err) => {
            tracing::warn!(error = %err, "delegation lookup failed");
            return false;
        }
    };

    let balance = match bus::balances(
        state.bus.as_ref(),
        &state.config.ledger_public_key,
        old_holder,
        &["BTC".to_string()],
    )
    .await
    {
        Ok(balances) => balances.get("BTC").copied().unwrap_or(0),
        Err(err) => {
            tracing::warn!(error = %err, "balance lookup failed");
            return false;
        }
    };
    if balance <= 0 {
        return true;
    }

    let tokens = BTreeMap::from([("BTC".to_string(), balance)]);
    let event = pay::transaction_event(state, &delegation, new_holder, &tokens, None);
    match state.bus.publish(&event).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "funds transfer emission failed");
            false
        }
    }
}

async fn publish_identity_transfer(state: &AppState, old_holder: &str, new_holder: &str) -> bool {
    let event = state.sign_event(
        KIND_REGULAR,
        vec![
            vec!["p".to_string(), new_holder.to_string()],
            vec!["t".to_string(), TOPIC_IDENTITY_TRANSFER_OK.to_string()],
        ],
        serde_json::json!({ "oldPubkey": old_holder, "newPubkey": new_holder }).to_string(),
    );

    match state.bus.publish(&event).await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "identity transfer emission failed");
            false
        }
    }
}
