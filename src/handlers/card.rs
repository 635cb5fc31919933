//! Holder-facing card lifecycle: activation and transfer, dispatched from
//! `POST /card` by the request's `t` tag.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::preflighted;
use crate::app_state::AppState;
use crate::cardconfig;
use crate::crypto::nip04;
use crate::db::registry::{self, NewDelegation};
use crate::error::{ServiceError, ServiceResult};
use crate::nostr::delegation::{self, Conditions};
use crate::nostr::{Event, KIND_EPHEMERAL_RESPONSE};

pub const TAG_ACTIVATION_REQUEST: &str = "card-activation-request";
pub const TAG_TRANSFER_ACCEPTANCE: &str = "card-transfer-acceptance";
pub const TAG_TRANSFER_DONATION: &str = "card-transfer-donation";

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationBody {
    pub conditions: String,
    pub token: String,
}

/// Parse the conditions and check the NIP-26 token under the holder key.
pub fn validated_delegation(
    holder_pubkey: &str,
    body: &DelegationBody,
) -> ServiceResult<Conditions> {
    let conditions = Conditions::parse(&body.conditions)
        .map_err(|err| ServiceError::Unprocessable(format!("bad delegation conditions: {err}")))?;

    delegation::verify_token(holder_pubkey, holder_pubkey, &body.conditions, &body.token)
        .map_err(|_| ServiceError::Unprocessable("invalid delegation token".to_string()))?;

    Ok(conditions)
}

/// POST /card — activation or transfer, selected by the request tag.
pub async fn card_request(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<Response> {
    let event = preflighted(&state, &body, None)?;

    match event.tag_value("t") {
        Some(TAG_ACTIVATION_REQUEST) => activate(&state, &event).await,
        Some(TAG_TRANSFER_ACCEPTANCE) => transfer(&state, &event).await,
        other => Err(ServiceError::Unprocessable(format!(
            "unsupported card request tag: {other:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct ActivationContent {
    otc: String,
    delegation: DelegationBody,
}

async fn activate(state: &AppState, event: &Event) -> ServiceResult<Response> {
    let content: ActivationContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Unprocessable(format!("bad activation content: {err}")))?;
    let holder_pubkey = event.pubkey.clone();

    let conditions = validated_delegation(&holder_pubkey, &content.delegation)?;

    let Some(ntag) = registry::find_available_ntag_by_otc(&state.pool, &content.otc).await? else {
        // A replay of the same signed activation gets the already-created
        // card back rather than a second one.
        if let Some(ntag) = registry::ntag_by_otc(&state.pool, &content.otc).await? {
            if let Some(card) = registry::card_by_cid(&state.pool, &ntag.cid).await? {
                if card.holder_pubkey.as_deref() == Some(holder_pubkey.as_str()) {
                    return Ok(activation_response(state, event, &card).into_response());
                }
            }
        }
        return Err(ServiceError::NotFound("no card for this code".to_string()));
    };

    let design = registry::design_by_uuid(&state.pool, &ntag.design_uuid)
        .await?
        .ok_or_else(|| ServiceError::Unprocessable("tag design vanished".to_string()))?;

    let default_limits = state
        .config
        .default_limit_list()
        .map_err(ServiceError::Internal)?;

    let mut tx = state.pool.begin().await?;
    registry::upsert_holder(
        &mut *tx,
        &holder_pubkey,
        &NewDelegation {
            conditions: &content.delegation.conditions,
            token: &content.delegation.token,
            since: conditions.since,
            until: conditions.until,
        },
        &state.config.default_trusted_merchant_list(),
    )
    .await?;
    let card = registry::create_card(
        &mut *tx,
        &ntag.cid,
        &holder_pubkey,
        &design.name,
        &design.description,
        &default_limits,
    )
    .await?;
    tx.commit().await?;

    // Config documents are re-derivable; a publish hiccup must not undo the
    // activation.
    if let Err(err) = cardconfig::publish_holder_documents(state, &holder_pubkey).await {
        tracing::warn!(error = %err, holder = %holder_pubkey, "activation publish failed");
    }

    Ok(activation_response(state, event, &card).into_response())
}

fn activation_response(
    state: &AppState,
    request: &Event,
    card: &crate::db::models::Card,
) -> (StatusCode, Json<Event>) {
    let response = state.sign_event(
        KIND_EPHEMERAL_RESPONSE,
        vec![
            vec!["t".to_string(), "card-activation-response".to_string()],
            vec!["p".to_string(), request.pubkey.clone()],
            vec!["e".to_string(), request.id.clone()],
        ],
        serde_json::to_string(card).unwrap_or_default(),
    );
    (StatusCode::CREATED, Json(response))
}

#[derive(Debug, Deserialize)]
struct TransferContent {
    delegation: DelegationBody,
    #[serde(rename = "donationEvent")]
    donation_event: Event,
}

async fn transfer(state: &AppState, event: &Event) -> ServiceResult<Response> {
    let content: TransferContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Unprocessable(format!("bad transfer content: {err}")))?;
    let new_holder = event.pubkey.clone();

    let conditions = validated_delegation(&new_holder, &content.delegation)?;

    let donation = &content.donation_event;
    donation
        .verify_signature()
        .map_err(|_| ServiceError::Unprocessable("invalid donation signature".to_string()))?;
    if donation.tag_value("t") != Some(TAG_TRANSFER_DONATION) {
        return Err(ServiceError::Unprocessable(
            "donation event has the wrong tag".to_string(),
        ));
    }

    // The acceptance names the donor as its second p tag; it must be the
    // donation's author.
    let p_tags = event.tag_values("p");
    let donor = p_tags
        .get(1)
        .copied()
        .ok_or_else(|| ServiceError::Unprocessable("acceptance lacks a donor p tag".to_string()))?;
    if donor != donation.pubkey {
        return Err(ServiceError::Unprocessable(
            "donor does not match the donation author".to_string(),
        ));
    }

    let plaintext = nip04::decrypt_inbound(
        &state.keys.keypair.secret_key(),
        &state.keys.pubkey,
        donor,
        &donation.content,
    )
    .map_err(|_| ServiceError::Unprocessable("undecryptable donation".to_string()))?;
    // The donated card uuid travels bare or JSON-quoted.
    let card_uuid = serde_json::from_str::<String>(&plaintext).unwrap_or(plaintext);

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
    registry::transfer_card(&mut *tx, &card_uuid, donor, &new_holder).await?;
    tx.commit().await?;

    if let Err(err) = cardconfig::publish_holder_documents(state, &new_holder).await {
        tracing::warn!(error = %err, holder = %new_holder, "transfer publish failed");
    }

    let response = state.sign_event(
        KIND_EPHEMERAL_RESPONSE,
        vec![
            vec!["t".to_string(), "card-transfer-response".to_string()],
            vec!["p".to_string(), new_holder.clone()],
            vec!["e".to_string(), event.id.clone()],
        ],
        serde_json::json!({ "cardUuid": card_uuid }).to_string(),
    );
    Ok((StatusCode::OK, Json(response)).into_response())
}
