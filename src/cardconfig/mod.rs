//! Encrypted configuration channel: card-data and card-config documents
//! exchanged with the holder as multi-recipient NIP-04 events, and the
//! transactional apply of inbound config changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::app_state::AppState;
use crate::config::LimitSpec;
use crate::crypto::nip04;
use crate::db::registry;
use crate::error::{ServiceError, ServiceResult};
use crate::nostr::{Event, KIND_REPLACEABLE_CONFIG};

pub const TOPIC_CARD_DATA: &str = "card-data";
pub const TOPIC_CARD_CONFIG: &str = "card-config";
pub const TOPIC_CARD_CONFIG_CHANGE: &str = "card-config-change";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignInfo {
    pub uuid: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CardDataEntry {
    pub design: DesignInfo,
}

/// card-data document: design info per card uuid, module -> holder.
pub type CardDataDoc = BTreeMap<String, CardDataEntry>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MerchantRef {
    pub pubkey: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LimitDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub token: String,
    pub amount: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CardConfigEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CardStatus>,
    #[serde(default)]
    pub limits: Vec<LimitDef>,
}

/// card-config document: holder-editable configuration, flowing both ways.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CardConfigDoc {
    #[serde(rename = "trusted-merchants", default)]
    pub trusted_merchants: Vec<MerchantRef>,
    #[serde(default)]
    pub cards: BTreeMap<String, CardConfigEntry>,
}

impl LimitDef {
    fn as_spec(&self) -> Result<LimitSpec, ServiceError> {
        if self.amount < 0 || self.delta <= 0 {
            return Err(ServiceError::Malformed(format!(
                "limit {} has an invalid amount or window",
                self.name
            )));
        }
        Ok(LimitSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            token: self.token.clone(),
            amount: self.amount,
            delta: self.delta,
        })
    }
}

/// Encrypt a document to the module and the holder and wrap it as a
/// parameterized-replaceable event keyed `<holder>:<topic>`.
fn sealed_event(
    state: &AppState,
    holder_pubkey: &str,
    topic: &str,
    plaintext: &str,
    extra_tags: Vec<Vec<String>>,
) -> Result<Event> {
    let recipients = vec![state.keys.pubkey.clone(), holder_pubkey.to_string()];
    let content = nip04::encrypt_many(&state.keys.keypair.secret_key(), plaintext, &recipients)?;

    let mut tags = vec![
        vec!["t".to_string(), topic.to_string()],
        vec!["d".to_string(), format!("{holder_pubkey}:{topic}")],
        vec!["p".to_string(), holder_pubkey.to_string()],
    ];
    tags.extend(extra_tags);

    Ok(state.sign_event(KIND_REPLACEABLE_CONFIG, tags, content))
}

/// Assemble the holder's card-data document from the registry.
pub async fn card_data_doc(state: &AppState, holder_pubkey: &str) -> Result<CardDataDoc> {
    let cards = registry::cards_by_holder(&state.pool, holder_pubkey).await?;

    let mut doc = CardDataDoc::new();
    for card in cards {
        let ntag = registry::ntag_by_cid(&state.pool, &card.ntag424_cid)
            .await?
            .context("card without tag")?;
        let design = registry::design_by_uuid(&state.pool, &ntag.design_uuid)
            .await?
            .context("tag without design")?;
        doc.insert(
            card.uuid,
            CardDataEntry {
                design: DesignInfo {
                    uuid: design.uuid,
                    name: design.name,
                    description: design.description,
                },
            },
        );
    }
    Ok(doc)
}

/// Assemble the holder's current card-config document from the registry.
pub async fn card_config_doc(state: &AppState, holder_pubkey: &str) -> Result<CardConfigDoc> {
    let merchants = registry::trusted_merchants(&state.pool, holder_pubkey).await?;
    let cards = registry::cards_by_holder(&state.pool, holder_pubkey).await?;

    let mut doc = CardConfigDoc {
        trusted_merchants: merchants
            .into_iter()
            .map(|pubkey| MerchantRef { pubkey })
            .collect(),
        cards: BTreeMap::new(),
    };

    for card in cards {
        let limits = registry::limits_for_card(&state.pool, &card.uuid).await?;
        doc.cards.insert(
            card.uuid.clone(),
            CardConfigEntry {
                name: Some(card.name),
                description: Some(card.description),
                status: Some(if card.enabled {
                    CardStatus::Enabled
                } else {
                    CardStatus::Disabled
                }),
                limits: limits
                    .into_iter()
                    .map(|limit| LimitDef {
                        name: limit.name,
                        description: limit.description,
                        token: limit.token,
                        amount: limit.amount,
                        delta: limit.delta,
                    })
                    .collect(),
            },
        );
    }
    Ok(doc)
}

/// Build the signed card-data event for a holder.
pub async fn build_card_data_event(state: &AppState, holder_pubkey: &str) -> Result<Event> {
    let doc = card_data_doc(state, holder_pubkey).await?;
    sealed_event(
        state,
        holder_pubkey,
        TOPIC_CARD_DATA,
        &serde_json::to_string(&doc)?,
        Vec::new(),
    )
}

/// Build the signed card-config event for a holder, optionally e-tagged to
/// the request that triggered it.
pub async fn build_card_config_event(
    state: &AppState,
    holder_pubkey: &str,
    in_reply_to: Option<&str>,
) -> Result<Event> {
    let doc = card_config_doc(state, holder_pubkey).await?;
    let extra_tags = in_reply_to
        .map(|id| vec![vec!["e".to_string(), id.to_string()]])
        .unwrap_or_default();
    sealed_event(
        state,
        holder_pubkey,
        TOPIC_CARD_CONFIG,
        &serde_json::to_string(&doc)?,
        extra_tags,
    )
}

/// Publish both configuration documents for a holder.
pub async fn publish_holder_documents(state: &AppState, holder_pubkey: &str) -> Result<()> {
    let card_data = build_card_data_event(state, holder_pubkey).await?;
    state.bus.publish(&card_data).await?;
    let card_config = build_card_config_event(state, holder_pubkey, None).await?;
    state.bus.publish(&card_config).await?;
    Ok(())
}

/// Apply an inbound, preflighted card-config-change event: decrypt, parse
/// strictly, reconcile in one transaction, then publish the confirming
/// card-config.
pub async fn apply_config_change(state: &AppState, event: &Event) -> ServiceResult<()> {
    let holder_pubkey = event.pubkey.clone();

    let plaintext = nip04::decrypt_inbound(
        &state.keys.keypair.secret_key(),
        &state.keys.pubkey,
        &holder_pubkey,
        &event.content,
    )
    .map_err(|_| ServiceError::Unprocessable("undecryptable config change".to_string()))?;

    let doc: CardConfigDoc = serde_json::from_str(&plaintext)
        .map_err(|err| ServiceError::Malformed(format!("bad config document: {err}")))?;

    let limit_specs: BTreeMap<&String, Vec<LimitSpec>> = doc
        .cards
        .iter()
        .map(|(uuid, entry)| {
            let specs = entry
                .limits
                .iter()
                .map(LimitDef::as_spec)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((uuid, specs))
        })
        .collect::<ServiceResult<_>>()?;

    // Unknown merchants are dropped, not rejected.
    let known: HashSet<String> = registry::known_merchants(&state.pool).await?.into_iter().collect();
    let merchants: Vec<String> = doc
        .trusted_merchants
        .iter()
        .map(|m| m.pubkey.clone())
        .filter(|pubkey| known.contains(pubkey))
        .collect();

    let mut tx = state.pool.begin().await.map_err(ServiceError::from)?;

    registry::replace_trusted_merchants(&mut *tx, &holder_pubkey, &merchants).await?;

    for (card_uuid, entry) in &doc.cards {
        let Some(card) = sqlx::query_as::<_, crate::db::models::Card>(
            "SELECT * FROM cards WHERE uuid = ? AND holder_pubkey = ?",
        )
        .bind(card_uuid)
        .bind(&holder_pubkey)
        .fetch_optional(&mut *tx)
        .await?
        else {
            // Not this holder's card: skip silently.
            continue;
        };

        registry::replace_limits(&mut *tx, &card.uuid, &limit_specs[card_uuid]).await?;
        registry::update_card_profile(
            &mut *tx,
            &card.uuid,
            entry.name.as_deref(),
            entry.description.as_deref(),
            entry.status.map(|status| status == CardStatus::Enabled),
        )
        .await?;
    }

    tx.commit().await.map_err(ServiceError::from)?;

    let confirmation = build_card_config_event(state, &holder_pubkey, Some(event.id.as_str())).await?;
    state.bus.publish(&confirmation).await?;
    Ok(())
}
