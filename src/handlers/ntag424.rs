//! Writer-authority endpoints: initialize, associate and delete physical
//! tags.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{preflighted, TapParams};
use crate::app_state::AppState;
use crate::db::registry::{self, DesignRef};
use crate::error::{ServiceError, ServiceResult};
use crate::nostr::{Event, KIND_EPHEMERAL_RESPONSE};
use crate::verifier;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DesignRefBody {
    ByUuid { uuid: String },
    ByName { name: String },
}

impl From<DesignRefBody> for DesignRef {
    fn from(body: DesignRefBody) -> Self {
        match body {
            DesignRefBody::ByUuid { uuid } => DesignRef::Uuid(uuid),
            DesignRefBody::ByName { name } => DesignRef::Name(name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InitializeContent {
    cid: String,
    ctr: i64,
    design: DesignRefBody,
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// POST /ntag424 — create a tag record and hand its keys back to the
/// writer for programming. Idempotent per cid.
pub async fn initialize(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<(StatusCode, Json<Event>)> {
    let event = preflighted(&state, &body, Some(state.config.card_writer_pubkey.as_str()))?;

    let content: InitializeContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Unprocessable(format!("bad initialize content: {err}")))?;

    if !is_lower_hex(&content.cid, 14) {
        return Err(ServiceError::Unprocessable(
            "cid must be 14 lowercase hex characters".to_string(),
        ));
    }
    if !(0..1 << 24).contains(&content.ctr) {
        return Err(ServiceError::Unprocessable(
            "ctr must fit 24 bits".to_string(),
        ));
    }

    let (ntag, _created) = registry::create_ntag(
        &state.pool,
        &content.cid,
        content.ctr,
        &content.design.into(),
        &state.keys.aes_k1,
    )
    .await?;

    let response = state.sign_event(
        KIND_EPHEMERAL_RESPONSE,
        vec![
            vec!["t".to_string(), "ntag424-initialize-response".to_string()],
            vec!["p".to_string(), event.pubkey.clone()],
            vec!["e".to_string(), event.id.clone()],
        ],
        serde_json::to_string(&ntag).map_err(anyhow::Error::from)?,
    );

    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
struct AssociateContent {
    otc: String,
}

/// PATCH /ntag424?p&c — bind a one-time association code to a verified tap.
pub async fn associate(
    State(state): State<AppState>,
    Query(params): Query<TapParams>,
    Json(body): Json<Event>,
) -> ServiceResult<StatusCode> {
    let event = preflighted(&state, &body, Some(state.config.card_writer_pubkey.as_str()))?;

    let content: AssociateContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Unprocessable(format!("bad associate content: {err}")))?;
    if content.otc.is_empty() {
        return Err(ServiceError::Unprocessable("otc must not be empty".to_string()));
    }

    let verified = verifier::verify(&state.pool, &state.keys.aes_k1, &params.p, &params.c)
        .await
        .map_err(|err| {
            tracing::debug!(error = %err, "associate tap rejected");
            ServiceError::card_data_unavailable()
        })?;

    registry::set_otc(&state.pool, &verified.ntag.cid, &content.otc).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DeleteContent {
    cid: String,
}

/// DELETE /ntag424 — admin removal of a tag record.
pub async fn delete(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<Json<serde_json::Value>> {
    let event = preflighted(&state, &body, Some(state.config.card_writer_pubkey.as_str()))?;

    let content: DeleteContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Unprocessable(format!("bad delete content: {err}")))?;

    registry::delete_ntag(&state.pool, &content.cid).await?;

    Ok(Json(json!({ "status": "OK" })))
}
