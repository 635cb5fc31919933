//! Scan dispatch: LUD-03 withdraw preflight plus the federation-gated
//! extended actions.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::TapParams;
use crate::app_state::AppState;
use crate::db::models::{Card, Holder};
use crate::db::registry;
use crate::error::{ServiceError, ServiceResult};
use crate::limits;
use crate::nostr::KIND_EPHEMERAL_RESPONSE;
use crate::payment_requests;
use crate::verifier;

pub const TAG_WITHDRAW: &str = "withdrawRequest";
pub const TAG_EXTENDED_WITHDRAW: &str = "laWallet:withdrawRequest";
pub const DEFAULT_DESCRIPTION: &str = "LaWallet";

pub const HEADER_ACTION: &str = "X-LaWallet-Action";
pub const HEADER_PARAM: &str = "X-LaWallet-Param";

/// Scan reply, stored on the payment request without its `k1` and replayed
/// at pay time for the per-request ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReply {
    pub tag: String,
    pub callback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k1: Option<String>,
    pub default_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_withdrawable: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_withdrawable: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<BTreeMap<String, TokenWindow>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenWindow {
    pub min_withdrawable: i64,
    pub max_withdrawable: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanAction {
    Standard,
    Extended,
    IdentityQuery,
    Info,
    PayRequest,
}

fn is_action_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

/// Comma-separated `k=v` pairs from `X-LaWallet-Param`.
fn header_params(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get(HEADER_PARAM)
        .and_then(|value| value.to_str().ok())
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (key, value) = pair.split_once('=')?;
                    Some((key.trim().to_string(), value.trim().to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Pick the action: extended handlers only run for our federation.
fn select_action(
    state: &AppState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> ServiceResult<ScanAction> {
    let Some(action) = headers.get(HEADER_ACTION) else {
        return Ok(ScanAction::Standard);
    };
    let action = action
        .to_str()
        .map_err(|_| ServiceError::Malformed("unreadable action header".to_string()))?;
    if !is_action_identifier(action) {
        return Err(ServiceError::Malformed(
            "action must match [A-Za-z0-9.-]+".to_string(),
        ));
    }

    if params.get("federationId") != Some(&state.config.federation_id) {
        return Ok(ScanAction::Standard);
    }

    match action {
        "extendedScan" => Ok(ScanAction::Extended),
        "identityQuery" => Ok(ScanAction::IdentityQuery),
        "info" => Ok(ScanAction::Info),
        "payRequest" => Ok(ScanAction::PayRequest),
        other => Err(ServiceError::Malformed(format!(
            "unknown scan action {other}"
        ))),
    }
}

/// GET /card/scan?p&c
pub async fn scan(
    State(state): State<AppState>,
    Query(tap): Query<TapParams>,
    headers: HeaderMap,
) -> ServiceResult<Response> {
    let params = header_params(&headers);
    let action = select_action(&state, &headers, &params)?;

    if action == ScanAction::Info {
        return info(&state, &tap).await;
    }

    let verified = verifier::verify(&state.pool, &state.keys.aes_k1, &tap.p, &tap.c)
        .await
        .map_err(|err| {
            tracing::debug!(error = %err, "scan tap rejected");
            ServiceError::card_data_unavailable()
        })?;

    let card = registry::card_by_cid(&state.pool, &verified.ntag.cid)
        .await?
        .ok_or_else(ServiceError::card_data_unavailable)?;

    match action {
        ScanAction::Standard => standard_scan(&state, &card).await,
        ScanAction::Extended => extended_scan(&state, &card, &params).await,
        ScanAction::IdentityQuery => identity_query(&state, &card),
        ScanAction::PayRequest => pay_request(&state, &card),
        ScanAction::Info => unreachable!("handled above"),
    }
}

fn ready_holder(card: &Card) -> ServiceResult<String> {
    match (&card.holder_pubkey, card.enabled) {
        (Some(holder), true) => Ok(holder.clone()),
        _ => Err(ServiceError::Exhausted("card is not enabled".to_string())),
    }
}

async fn standard_scan(state: &AppState, card: &Card) -> ServiceResult<Response> {
    ready_holder(card)?;
    let now = state.now();

    let mut conn = state.pool.acquire().await?;
    let rem = limits::remaining(&mut *conn, &card.uuid, &["BTC".to_string()], now).await?;

    let mut reply = ScanReply {
        tag: TAG_WITHDRAW.to_string(),
        callback: state.config.pay_callback_url(),
        k1: None,
        default_description: DEFAULT_DESCRIPTION.to_string(),
        min_withdrawable: Some(0),
        max_withdrawable: Some(rem.get("BTC").copied().unwrap_or(0)),
        tokens: None,
    };

    let stored = serde_json::to_string(&reply).map_err(anyhow::Error::from)?;
    reply.k1 = Some(payment_requests::issue(&mut *conn, &card.uuid, &stored, now).await?);

    Ok(Json(reply).into_response())
}

async fn extended_scan(
    state: &AppState,
    card: &Card,
    params: &HashMap<String, String>,
) -> ServiceResult<Response> {
    ready_holder(card)?;
    let now = state.now();

    let tokens: Vec<String> = params
        .get("tokens")
        .map(|raw| {
            raw.split(':')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .filter(|list: &Vec<String>| !list.is_empty())
        .unwrap_or_else(|| vec!["BTC".to_string()]);

    let mut conn = state.pool.acquire().await?;
    let rem = limits::remaining(&mut *conn, &card.uuid, &tokens, now).await?;

    let windows: BTreeMap<String, TokenWindow> = tokens
        .iter()
        .map(|token| {
            (
                token.clone(),
                TokenWindow {
                    min_withdrawable: 0,
                    max_withdrawable: rem.get(token).copied().unwrap_or(0),
                },
            )
        })
        .collect();

    let mut reply = ScanReply {
        tag: TAG_EXTENDED_WITHDRAW.to_string(),
        callback: state.config.pay_callback_url(),
        k1: None,
        default_description: DEFAULT_DESCRIPTION.to_string(),
        min_withdrawable: None,
        max_withdrawable: None,
        tokens: Some(windows),
    };

    let stored = serde_json::to_string(&reply).map_err(anyhow::Error::from)?;
    reply.k1 = Some(payment_requests::issue(&mut *conn, &card.uuid, &stored, now).await?);

    Ok(Json(reply).into_response())
}

fn identity_query(state: &AppState, card: &Card) -> ServiceResult<Response> {
    let holder = card
        .holder_pubkey
        .clone()
        .ok_or_else(|| ServiceError::NotFound("card has no holder".to_string()))?;

    let response = state.sign_event(
        KIND_EPHEMERAL_RESPONSE,
        vec![vec!["t".to_string(), "identity-query-response".to_string()]],
        holder,
    );
    Ok(Json(response).into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LnurlpReply {
    tag: String,
    callback: String,
    min_sendable: i64,
    max_sendable: i64,
    metadata: String,
}

fn pay_request(state: &AppState, card: &Card) -> ServiceResult<Response> {
    let holder = ready_holder(card)?;

    let metadata = serde_json::json!([["text/plain", DEFAULT_DESCRIPTION]]).to_string();
    Ok(Json(LnurlpReply {
        tag: "payRequest".to_string(),
        callback: state.config.lnurlp_callback_url(&holder),
        min_sendable: 1_000,
        max_sendable: 100_000_000_000,
        metadata,
    })
    .into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NtagSnapshot {
    cid: String,
    ctr: i64,
    design_uuid: String,
    associated: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DelegationSnapshot {
    since: i64,
    until: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoReply {
    initialized: bool,
    associated: bool,
    activated: bool,
    has_delegation: bool,
    has_identity: bool,
    ntag424: Option<NtagSnapshot>,
    card: Option<Card>,
    holder: Option<Holder>,
    delegation: Option<DelegationSnapshot>,
}

/// Diagnostics: read-only, and the only path allowed to say which layer of
/// the tap verification failed.
async fn info(state: &AppState, tap: &TapParams) -> ServiceResult<Response> {
    let verified = match verifier::inspect(&state.pool, &state.keys.aes_k1, &tap.p, &tap.c).await {
        Ok(verified) => verified,
        Err(verifier::VerifyError::NotFound) => {
            return Ok(Json(InfoReply {
                initialized: false,
                associated: false,
                activated: false,
                has_delegation: false,
                has_identity: false,
                ntag424: None,
                card: None,
                holder: None,
                delegation: None,
            })
            .into_response());
        }
        Err(verifier::VerifyError::Store(err)) => return Err(err.into()),
        Err(err) => return Err(ServiceError::Malformed(err.to_string())),
    };

    let ntag = verified.ntag;
    let card = registry::card_by_cid(&state.pool, &ntag.cid).await?;

    let holder_pubkey = card.as_ref().and_then(|c| c.holder_pubkey.clone());
    let (holder, delegation) = match &holder_pubkey {
        Some(pubkey) => (
            registry::holder_by_pubkey(&state.pool, pubkey).await?,
            registry::current_delegation(&state.pool, pubkey, state.now()).await?,
        ),
        None => (None, None),
    };

    let has_identity = match &holder_pubkey {
        Some(pubkey) => state
            .identity
            .resolve_name(pubkey)
            .await
            .unwrap_or_default()
            .is_some(),
        None => false,
    };

    Ok(Json(InfoReply {
        initialized: true,
        associated: ntag.otc.is_some(),
        activated: holder_pubkey.is_some(),
        has_delegation: delegation.is_some(),
        has_identity,
        ntag424: Some(NtagSnapshot {
            cid: ntag.cid.clone(),
            ctr: ntag.ctr,
            design_uuid: ntag.design_uuid.clone(),
            associated: ntag.otc.is_some(),
        }),
        card,
        holder,
        delegation: delegation.map(|d| DelegationSnapshot {
            since: d.since,
            until: d.until,
        }),
    })
    .into_response())
}


#[cfg(test)]
mod tests {
    use super::testing::tap_for;
    use super::*;
    use crate::app_state::testing::harness;
    use crate::handlers::card::testing::activate_card;
    use crate::suuid::suuid2uuid;
    use axum::http::HeaderValue;
    use http_body_util::BodyExt;
    use secp256k1::{Keypair, Secp256k1};

    const CID: &str = "f0da0000000010";

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn extended_headers(h: &crate::app_state::testing::TestHarness, tokens: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACTION, HeaderValue::from_static("extendedScan"));
        headers.insert(
            HEADER_PARAM,
            HeaderValue::from_str(&format!(
                "federationId={}, tokens={tokens}",
                h.state.config.federation_id
            ))
            .unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn standard_scan_issues_a_k1() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;

        // Give the card a limit so BTC shows up.
        let mut conn = h.state.pool.acquire().await.unwrap();
        registry::replace_limits(
            &mut *conn,
            &card_uuid,
            &[crate::config::LimitSpec {
                name: "daily".into(),
                description: String::new(),
                token: "BTC".into(),
                amount: 1_000_000,
                delta: 86_400,
            }],
        )
        .await
        .unwrap();
        drop(conn);

        let tap = tap_for(&h, CID, 1).await;
        let response = scan(State(h.state.clone()), Query(tap), HeaderMap::new())
            .await
            .unwrap();
        let json = body_json(response).await;

        assert_eq!(json["tag"], "withdrawRequest");
        assert_eq!(json["defaultDescription"], "LaWallet");
        assert_eq!(json["minWithdrawable"], 0);
        assert_eq!(json["maxWithdrawable"], 1_000_000);
        assert_eq!(json["callback"], "https://cards.test/card/pay");

        let k1 = json["k1"].as_str().unwrap();
        assert_eq!(k1.len(), 22);
        let uuid = suuid2uuid(k1).unwrap();
        let stored = registry::payment_request_by_uuid(&h.state.pool, &uuid.to_string())
            .await
            .unwrap()
            .unwrap();
        // The stored reply has no k1.
        assert!(!stored.response.contains("\"k1\""));
    }

    #[tokio::test]
    async fn scan_masks_all_verifier_failures() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        activate_card(&h, &holder, "weirdcode").await;

        // Consume counter 5, then replay 3.
        let tap = tap_for(&h, CID, 5).await;
        scan(State(h.state.clone()), Query(tap), HeaderMap::new())
            .await
            .unwrap();

        let tap = tap_for(&h, CID, 3).await;
        let err = scan(State(h.state.clone()), Query(tap), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to retrieve card data");
    }

    #[tokio::test]
    async fn disabled_cards_do_not_scan() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;

        let mut conn = h.state.pool.acquire().await.unwrap();
        registry::update_card_profile(&mut *conn, &card_uuid, None, None, Some(false))
            .await
            .unwrap();
        drop(conn);

        let tap = tap_for(&h, CID, 1).await;
        let err = scan(State(h.state.clone()), Query(tap), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn extended_scan_reports_requested_tokens() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;

        let mut conn = h.state.pool.acquire().await.unwrap();
        registry::replace_limits(
            &mut *conn,
            &card_uuid,
            &[crate::config::LimitSpec {
                name: "daily".into(),
                description: String::new(),
                token: "BTC".into(),
                amount: 500_000,
                delta: 86_400,
            }],
        )
        .await
        .unwrap();
        drop(conn);

        let tap = tap_for(&h, CID, 1).await;
        let response = scan(
            State(h.state.clone()),
            Query(tap),
            extended_headers(&h, "BTC:USD"),
        )
        .await
        .unwrap();
        let json = body_json(response).await;

        assert_eq!(json["tag"], "laWallet:withdrawRequest");
        assert_eq!(json["tokens"]["BTC"]["maxWithdrawable"], 500_000);
        // Requested but unlimited tokens read as exhausted.
        assert_eq!(json["tokens"]["USD"]["maxWithdrawable"], 0);
    }

    #[tokio::test]
    async fn wrong_federation_falls_back_to_standard() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        activate_card(&h, &holder, "weirdcode").await;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACTION, HeaderValue::from_static("extendedScan"));
        headers.insert(
            HEADER_PARAM,
            HeaderValue::from_static("federationId=someone-else"),
        );

        let tap = tap_for(&h, CID, 1).await;
        let response = scan(State(h.state.clone()), Query(tap), headers).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["tag"], "withdrawRequest");
    }

    #[tokio::test]
    async fn identity_query_returns_signed_holder_pubkey() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        activate_card(&h, &holder, "weirdcode").await;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACTION, HeaderValue::from_static("identityQuery"));
        headers.insert(
            HEADER_PARAM,
            HeaderValue::from_str(&format!("federationId={}", h.state.config.federation_id))
                .unwrap(),
        );

        let tap = tap_for(&h, CID, 1).await;
        let response = scan(State(h.state.clone()), Query(tap), headers).await.unwrap();
        let json = body_json(response).await;

        assert_eq!(json["content"], holder_hex);
        assert_eq!(json["pubkey"], h.state.keys.pubkey);
    }

    #[tokio::test]
    async fn info_reports_lifecycle_without_consuming_the_counter() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        activate_card(&h, &holder, "weirdcode").await;

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACTION, HeaderValue::from_static("info"));
        headers.insert(
            HEADER_PARAM,
            HeaderValue::from_str(&format!("federationId={}", h.state.config.federation_id))
                .unwrap(),
        );

        let tap = tap_for(&h, CID, 1).await;
        let response = scan(
            State(h.state.clone()),
            Query(TapParams {
                p: tap.p.clone(),
                c: tap.c.clone(),
            }),
            headers,
        )
        .await
        .unwrap();
        let json = body_json(response).await;

        assert_eq!(json["initialized"], true);
        assert_eq!(json["associated"], true);
        assert_eq!(json["activated"], true);
        assert_eq!(json["hasDelegation"], true);
        assert_eq!(json["hasIdentity"], true);
        // No key material in the snapshot.
        assert!(json["ntag424"].get("k2").is_none());

        // Counter untouched: a standard scan with the same tap still works.
        let response = scan(State(h.state.clone()), Query(tap), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["tag"], "withdrawRequest");
    }
}
