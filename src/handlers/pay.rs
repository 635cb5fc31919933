//! Withdrawal callbacks: standard LNURL-withdraw with a bolt11 invoice and
//! the extended multi-token flow. Consumption, limit recheck and payment
//! insertion share one transaction; the transfer event is emitted after
//! commit.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;

use super::preflighted;
use super::scan::{ScanReply, TAG_EXTENDED_WITHDRAW, TAG_WITHDRAW};
use crate::app_state::AppState;
use crate::bus;
use crate::db::models::{Card, Delegation};
use crate::db::registry;
use crate::error::{ServiceError, ServiceResult};
use crate::lightning::Invoice;
use crate::limits;
use crate::nostr::{Event, KIND_REGULAR};
use crate::payment_requests;

pub const TOPIC_TRANSACTION_START: &str = "internal-transaction-start";

#[derive(Debug, Deserialize)]
pub struct WithdrawParams {
    k1: String,
    pr: String,
}

fn consume_error(err: payment_requests::ConsumeError) -> ServiceError {
    match err {
        payment_requests::ConsumeError::Store(err) => err.into(),
        other => ServiceError::Exhausted(format!("invalid transaction: {other}")),
    }
}

async fn card_for_request(
    tx: &mut sqlx::SqliteConnection,
    card_uuid: &str,
) -> ServiceResult<Card> {
    let card = sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE uuid = ?")
        .bind(card_uuid)
        .fetch_optional(tx)
        .await?
        .ok_or_else(ServiceError::card_data_unavailable)?;

    if !card.enabled {
        return Err(ServiceError::Exhausted("card is not enabled".to_string()));
    }
    Ok(card)
}

fn holder_of(card: &Card) -> ServiceResult<String> {
    card.holder_pubkey
        .clone()
        .ok_or_else(|| ServiceError::Exhausted("card has no holder".to_string()))
}

/// The signed ledger instruction: kind 1112, p-tagged to the ledger and a
/// second party, carrying the holder's delegation.
pub(crate) fn transaction_event(
    state: &AppState,
    delegation: &Delegation,
    second_p: &str,
    tokens: &BTreeMap<String, i64>,
    bolt11: Option<&str>,
) -> Event {
    let mut tags = vec![
        vec!["p".to_string(), state.config.ledger_public_key.clone()],
        vec!["p".to_string(), second_p.to_string()],
        vec!["t".to_string(), TOPIC_TRANSACTION_START.to_string()],
        vec![
            "delegation".to_string(),
            delegation.delegator_pubkey.clone(),
            delegation.conditions.clone(),
            delegation.delegation_token.clone(),
        ],
    ];
    if let Some(pr) = bolt11 {
        tags.push(vec!["bolt11".to_string(), pr.to_string()]);
    }

    state.sign_event(
        KIND_REGULAR,
        tags,
        json!({ "tokens": tokens }).to_string(),
    )
}

async fn publish_or_log(state: &AppState, event: &Event) {
    // The Payment row is the durable intent; emission is retried by the
    // reconciler if it fails here.
    if let Err(err) = state.bus.publish(event).await {
        tracing::error!(error = %err, event = %event.id, "transfer event emission failed");
    }
}

/// GET /card/pay?k1&pr — LUD-03 callback.
pub async fn withdraw_callback(
    State(state): State<AppState>,
    Query(params): Query<WithdrawParams>,
) -> ServiceResult<Json<serde_json::Value>> {
    let invoice = Invoice::from_str(&params.pr)
        .map_err(|_| ServiceError::Malformed("invalid bolt11 invoice".to_string()))?;
    let msats = invoice
        .amount_msats()
        .map_err(|_| ServiceError::Malformed("invoice carries no amount".to_string()))?
        as i64;

    let now = state.now();
    if invoice.is_expired_at(now) {
        return Err(ServiceError::Exhausted("invoice is expired".to_string()));
    }

    let mut tx = state.pool.begin().await?;

    let request = payment_requests::consume(
        &mut *tx,
        &params.k1,
        state.config.payment_request_expiry_seconds,
        now,
    )
    .await
    .map_err(consume_error)?;

    let reply: ScanReply = serde_json::from_str(&request.response)
        .map_err(|err| ServiceError::Internal(anyhow::Error::from(err)))?;
    if reply.tag != TAG_WITHDRAW {
        return Err(ServiceError::Exhausted(
            "invalid transaction: wrong withdraw flow".to_string(),
        ));
    }

    if msats > reply.max_withdrawable.unwrap_or(0) {
        return Err(ServiceError::Exhausted(
            "amount exceeds the authorized maximum".to_string(),
        ));
    }

    let card = card_for_request(&mut *tx, &request.card_uuid).await?;
    let holder = holder_of(&card)?;

    let btc = vec!["BTC".to_string()];
    let rem = limits::remaining(&mut *tx, &card.uuid, &btc, now).await?;
    if msats > rem.get("BTC").copied().unwrap_or(0) {
        return Err(ServiceError::Exhausted("spending limit exceeded".to_string()));
    }

    let balances = bus::balances(state.bus.as_ref(), &state.config.ledger_public_key, &holder, &btc)
        .await
        .map_err(ServiceError::Internal)?;
    if msats > balances.get("BTC").copied().unwrap_or(0) {
        return Err(ServiceError::Exhausted("insufficient balance".to_string()));
    }

    let delegation = registry::current_delegation(&mut *tx, &holder, now)
        .await?
        .ok_or_else(|| ServiceError::Exhausted("holder has no active delegation".to_string()))?;

    registry::insert_payment(&mut *tx, &card.uuid, "BTC", msats, &request.uuid, now).await?;
    tx.commit().await?;

    let tokens = BTreeMap::from([("BTC".to_string(), msats)]);
    let event = transaction_event(
        &state,
        &delegation,
        &state.config.btc_gateway_public_key,
        &tokens,
        Some(params.pr.as_str()),
    );
    publish_or_log(&state, &event).await;

    Ok(Json(json!({ "status": "OK" })))
}

#[derive(Debug, Deserialize)]
struct ExtendedPayContent {
    k1: String,
    pubkey: String,
    tokens: BTreeMap<String, i64>,
}

/// Accept a recipient as 64-char hex or bech32 `npub1…`.
fn decode_recipient(raw: &str) -> ServiceResult<String> {
    if raw.len() == 64 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(raw.to_lowercase());
    }

    let (hrp, data) = bech32::decode(raw)
        .map_err(|_| ServiceError::Malformed("unparseable recipient pubkey".to_string()))?;
    if hrp.as_str() != "npub" || data.len() != 32 {
        return Err(ServiceError::Malformed(
            "recipient must be hex or npub".to_string(),
        ));
    }
    Ok(hex::encode(data))
}

/// POST /card/pay — extended multi-token withdraw, body is a signed event.
pub async fn extended_withdraw(
    State(state): State<AppState>,
    Json(body): Json<Event>,
) -> ServiceResult<Json<serde_json::Value>> {
    let event = preflighted(&state, &body, None)?;

    let content: ExtendedPayContent = serde_json::from_str(&event.content)
        .map_err(|err| ServiceError::Malformed(format!("bad pay content: {err}")))?;

    if content.tokens.is_empty() {
        return Err(ServiceError::Malformed("no tokens requested".to_string()));
    }
    if content.tokens.values().any(|amount| *amount <= 0) {
        return Err(ServiceError::Malformed(
            "token amounts must be positive".to_string(),
        ));
    }
    let recipient = decode_recipient(&content.pubkey)?;

    let now = state.now();
    let mut tx = state.pool.begin().await?;

    let request = payment_requests::consume(
        &mut *tx,
        &content.k1,
        state.config.payment_request_expiry_seconds,
        now,
    )
    .await
    .map_err(consume_error)?;

    let reply: ScanReply = serde_json::from_str(&request.response)
        .map_err(|err| ServiceError::Internal(anyhow::Error::from(err)))?;
    if reply.tag != TAG_EXTENDED_WITHDRAW {
        return Err(ServiceError::Exhausted(
            "invalid transaction: wrong withdraw flow".to_string(),
        ));
    }
    let windows = reply.tokens.unwrap_or_default();

    let card = card_for_request(&mut *tx, &request.card_uuid).await?;
    let holder = holder_of(&card)?;

    let requested: Vec<String> = content.tokens.keys().cloned().collect();
    let rem = limits::remaining(&mut *tx, &card.uuid, &requested, now).await?;
    let balances = bus::balances(
        state.bus.as_ref(),
        &state.config.ledger_public_key,
        &holder,
        &requested,
    )
    .await
    .map_err(ServiceError::Internal)?;

    for (token, amount) in &content.tokens {
        let window = windows.get(token).ok_or_else(|| {
            ServiceError::Exhausted(format!("token {token} was not offered at scan"))
        })?;
        if *amount > window.max_withdrawable {
            return Err(ServiceError::Exhausted(format!(
                "{token} amount exceeds the authorized maximum"
            )));
        }
        if *amount > rem.get(token).copied().unwrap_or(0) {
            return Err(ServiceError::Exhausted(format!(
                "{token} spending limit exceeded"
            )));
        }
        if *amount > balances.get(token).copied().unwrap_or(0) {
            return Err(ServiceError::Exhausted(format!(
                "insufficient {token} balance"
            )));
        }
    }

    let delegation = registry::current_delegation(&mut *tx, &holder, now)
        .await?
        .ok_or_else(|| ServiceError::Exhausted("holder has no active delegation".to_string()))?;

    for (token, amount) in &content.tokens {
        registry::insert_payment(&mut *tx, &card.uuid, token, *amount, &request.uuid, now).await?;
    }
    tx.commit().await?;

    let event = transaction_event(&state, &delegation, &recipient, &content.tokens, None);
    publish_or_log(&state, &event).await;

    Ok(Json(json!({ "status": "OK" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::testing::{harness, TestHarness};
    use crate::config::LimitSpec;
    use crate::handlers::card::testing::activate_card;
    use crate::handlers::scan::testing::tap_for;
    use crate::handlers::scan::{scan, HEADER_ACTION, HEADER_PARAM};
    use crate::handlers::TapParams;
    use crate::nostr::KIND_REPLACEABLE_CONFIG;
    use axum::http::{HeaderMap, HeaderValue};
    use bitcoin::hashes::{sha256, Hash};
    use bitcoin::secp256k1::{Secp256k1 as BtcSecp, SecretKey as BtcSecretKey};
    use http_body_util::BodyExt;
    use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
    use secp256k1::{Keypair, Secp256k1};

    const CID: &str = "f0da0000000010";

    fn test_invoice(msats: u64) -> String {
        let secp = BtcSecp::new();
        let sk = BtcSecretKey::from_slice(&[0x42; 32]).unwrap();

        InvoiceBuilder::new(Currency::Bitcoin)
            .description("test withdraw".into())
            .payment_hash(sha256::Hash::hash(&[0u8; 32]))
            .payment_secret(PaymentSecret([1; 32]))
            .amount_milli_satoshis(msats)
            .current_timestamp()
            .min_final_cltv_expiry_delta(18)
            .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &sk))
            .unwrap()
            .to_string()
    }

    fn seed_balance(h: &TestHarness, holder_hex: &str, token: &str, amount: i64) {
        h.bus.seed(Event::sign(
            &h.ledger,
            chrono::Utc::now().timestamp(),
            KIND_REPLACEABLE_CONFIG,
            vec![
                vec!["d".into(), format!("balance:{token}:{holder_hex}")],
                vec!["amount".into(), amount.to_string()],
            ],
            String::new(),
        ));
    }

    async fn set_btc_limit(h: &TestHarness, card_uuid: &str, amount: i64, delta: i64) {
        let mut conn = h.state.pool.acquire().await.unwrap();
        registry::replace_limits(
            &mut *conn,
            card_uuid,
            &[LimitSpec {
                name: "window".into(),
                description: String::new(),
                token: "BTC".into(),
                amount,
                delta,
            }],
        )
        .await
        .unwrap();
    }

    async fn scan_k1(h: &TestHarness, ctr: u32, headers: HeaderMap) -> String {
        let tap = tap_for(h, CID, ctr).await;
        let response = scan(
            axum::extract::State(h.state.clone()),
            axum::extract::Query(TapParams { p: tap.p, c: tap.c }),
            headers,
        )
        .await
        .unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["k1"].as_str().unwrap().to_string()
    }

    fn extended_headers(h: &TestHarness) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ACTION, HeaderValue::from_static("extendedScan"));
        headers.insert(
            HEADER_PARAM,
            HeaderValue::from_str(&format!(
                "federationId={}, tokens=BTC",
                h.state.config.federation_id
            ))
            .unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn standard_withdraw_publishes_a_transfer_event() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;
        set_btc_limit(&h, &card_uuid, 1_000_000, 86_400).await;
        seed_balance(&h, &holder_hex, "BTC", 5_000_000);

        let k1 = scan_k1(&h, 1, HeaderMap::new()).await;
        let pr = test_invoice(1_000);

        let Json(response) = withdraw_callback(
            State(h.state.clone()),
            Query(WithdrawParams {
                k1: k1.clone(),
                pr: pr.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "OK");

        let published = h.bus.published();
        let transfer = published
            .iter()
            .find(|e| e.tag_value("t") == Some(TOPIC_TRANSACTION_START))
            .unwrap();
        assert_eq!(transfer.kind, KIND_REGULAR);
        assert_eq!(transfer.tag_value("bolt11"), Some(pr.as_str()));
        assert_eq!(
            transfer.tag_values("p"),
            vec![
                h.state.config.ledger_public_key.as_str(),
                h.state.config.btc_gateway_public_key.as_str()
            ]
        );
        let (delegator, _, _) = transfer.delegation_tag().unwrap();
        assert_eq!(delegator, holder_hex);
        let content: serde_json::Value = serde_json::from_str(&transfer.content).unwrap();
        assert_eq!(content["tokens"]["BTC"], 1_000);
    }

    #[tokio::test]
    async fn a_k1_is_consumed_exactly_once() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;
        set_btc_limit(&h, &card_uuid, 1_000_000, 86_400).await;
        seed_balance(&h, &holder_hex, "BTC", 5_000_000);

        let k1 = scan_k1(&h, 1, HeaderMap::new()).await;

        withdraw_callback(
            State(h.state.clone()),
            Query(WithdrawParams {
                k1: k1.clone(),
                pr: test_invoice(1_000),
            }),
        )
        .await
        .unwrap();

        let err = withdraw_callback(
            State(h.state.clone()),
            Query(WithdrawParams {
                k1,
                pr: test_invoice(1_000),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("invalid transaction"));
    }

    #[tokio::test]
    async fn limits_cap_the_withdrawal() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;
        set_btc_limit(&h, &card_uuid, 1_000_000, 60).await;
        seed_balance(&h, &holder_hex, "BTC", 5_000_000);

        // A prior payment inside the window eats all but 1000 msat.
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO payment_requests (uuid, card_uuid, response, created_at)
             VALUES ('prior', ?, '{}', ?)",
        )
        .bind(&card_uuid)
        .bind(now)
        .execute(&h.state.pool)
        .await
        .unwrap();
        let mut conn = h.state.pool.acquire().await.unwrap();
        registry::insert_payment(&mut *conn, &card_uuid, "BTC", 999_000, "prior", now)
            .await
            .unwrap();
        drop(conn);

        let k1 = scan_k1(&h, 1, HeaderMap::new()).await;
        let stored = registry::payment_request_by_uuid(
            &h.state.pool,
            &crate::suuid::suuid2uuid(&k1).unwrap().to_string(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(stored.response.contains("\"maxWithdrawable\":1000"));

        let err = withdraw_callback(
            State(h.state.clone()),
            Query(WithdrawParams {
                k1,
                pr: test_invoice(2_000),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ledger_balance_caps_the_withdrawal() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;
        set_btc_limit(&h, &card_uuid, 1_000_000, 86_400).await;
        seed_balance(&h, &holder_hex, "BTC", 500);

        let k1 = scan_k1(&h, 1, HeaderMap::new()).await;
        let err = withdraw_callback(
            State(h.state.clone()),
            Query(WithdrawParams {
                k1,
                pr: test_invoice(1_000),
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("insufficient balance"));
    }

    #[tokio::test]
    async fn extended_withdraw_pays_a_recipient() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;
        set_btc_limit(&h, &card_uuid, 1_000_000, 86_400).await;
        seed_balance(&h, &holder_hex, "BTC", 5_000_000);

        let k1 = scan_k1(&h, 1, extended_headers(&h)).await;

        let merchant = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let recipient_hex = "f".repeat(64);
        let request = Event::sign(
            &merchant,
            chrono::Utc::now().timestamp(),
            KIND_REGULAR,
            vec![],
            json!({ "k1": k1, "pubkey": recipient_hex, "tokens": { "BTC": 2_500 } }).to_string(),
        );

        let Json(response) = extended_withdraw(State(h.state.clone()), Json(request))
            .await
            .unwrap();
        assert_eq!(response["status"], "OK");

        let published = h.bus.published();
        let transfer = published
            .iter()
            .find(|e| e.tag_value("t") == Some(TOPIC_TRANSACTION_START))
            .unwrap();
        assert_eq!(transfer.tag_value("bolt11"), None);
        assert_eq!(
            transfer.tag_values("p"),
            vec![h.state.config.ledger_public_key.as_str(), recipient_hex.as_str()]
        );
    }

    #[tokio::test]
    async fn extended_withdraw_rejects_a_standard_k1() {
        let h = harness().await;
        let holder = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let holder_hex = holder.x_only_public_key().0.to_string();
        let card_uuid = activate_card(&h, &holder, "weirdcode").await;
        set_btc_limit(&h, &card_uuid, 1_000_000, 86_400).await;
        seed_balance(&h, &holder_hex, "BTC", 5_000_000);

        // k1 from the standard scan path.
        let k1 = scan_k1(&h, 1, HeaderMap::new()).await;

        let merchant = Keypair::new(&Secp256k1::new(), &mut rand::thread_rng());
        let request = Event::sign(
            &merchant,
            chrono::Utc::now().timestamp(),
            KIND_REGULAR,
            vec![],
            json!({ "k1": k1, "pubkey": "f".repeat(64), "tokens": { "BTC": 1_000 } }).to_string(),
        );

        let err = extended_withdraw(State(h.state.clone()), Json(request))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("wrong withdraw flow"));
    }

    #[test]
    fn recipient_decoding_accepts_hex_and_npub() {
        let hex64 = "a".repeat(64);
        assert_eq!(decode_recipient(&hex64).unwrap(), hex64);

        let bytes = [0xabu8; 32];
        let npub =
            bech32::encode::<bech32::Bech32>(bech32::Hrp::parse("npub").unwrap(), &bytes).unwrap();
        assert_eq!(decode_recipient(&npub).unwrap(), hex::encode(bytes));

        assert!(decode_recipient("nope").is_err());
    }
}
