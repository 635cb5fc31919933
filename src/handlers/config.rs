//! Holder-requested publication of the encrypted configuration documents.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use super::preflighted;
use crate::app_state::AppState;
use crate::cardconfig;
use crate::error::{ServiceError, ServiceResult};
use crate::nostr::Event;

/// POST /card/data/request — build, publish and return the holder's
/// card-data event.
pub async fn card_data_request(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<Json<Event>> {
    let event = preflighted(&state, &body, None)?;

    let card_data = cardconfig::build_card_data_event(&state, &event.pubkey)
        .await
        .map_err(ServiceError::Internal)?;
    state
        .bus
        .publish(&card_data)
        .await
        .map_err(ServiceError::Internal)?;

    Ok(Json(card_data))
}

/// POST /card/config/request — return the holder's current card-config
/// payload without publishing it.
pub async fn card_config_request(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<Json<Event>> {
    let event = preflighted(&state, &body, None)?;

    let card_config = cardconfig::build_card_config_event(&state, &event.pubkey, None)
        .await
        .map_err(ServiceError::Internal)?;

    Ok(Json(card_config))
}

/// POST /card/publish-data — republish both documents for the holder.
pub async fn publish_data(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<Json<serde_json::Value>> {
    let event = preflighted(&state, &body, None)?;

    cardconfig::publish_holder_documents(&state, &event.pubkey)
        .await
        .map_err(ServiceError::Internal)?;

    Ok(Json(json!({ "status": "OK" })))
}
