//! Card registry: all entity mutation goes through here, transactionally.

use anyhow::Result;
use sqlx::{Pool, Sqlite, SqliteConnection};
use uuid::Uuid;

use super::models::{Card, Delegation, Design, Holder, Limit, Ntag, PaymentRequest, ResetToken};
use crate::config::LimitSpec;
use crate::crypto::AesKey;
use crate::error::{ServiceError, ServiceResult};

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Reference to a design by name or uuid, as carried in initialize requests.
#[derive(Debug, Clone)]
pub enum DesignRef {
    Name(String),
    Uuid(String),
}

pub async fn design_by_ref(
    conn: &mut SqliteConnection,
    design: &DesignRef,
) -> Result<Option<Design>, sqlx::Error> {
    match design {
        DesignRef::Name(name) => {
            sqlx::query_as::<_, Design>("SELECT * FROM designs WHERE name = ?")
                .bind(name)
                .fetch_optional(conn)
                .await
        }
        DesignRef::Uuid(uuid) => {
            sqlx::query_as::<_, Design>("SELECT * FROM designs WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(conn)
                .await
        }
    }
}

pub async fn design_by_uuid(
    pool: &Pool<Sqlite>,
    uuid: &str,
) -> Result<Option<Design>, sqlx::Error> {
    sqlx::query_as::<_, Design>("SELECT * FROM designs WHERE uuid = ?")
        .bind(uuid)
        .fetch_optional(pool)
        .await
}

/// Find a design by name or create it.
pub async fn ensure_design(
    conn: &mut SqliteConnection,
    name: &str,
    description: &str,
) -> Result<Design, sqlx::Error> {
    if let Some(design) = design_by_ref(conn, &DesignRef::Name(name.to_string())).await? {
        return Ok(design);
    }

    let design = Design {
        uuid: Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: description.to_string(),
    };
    sqlx::query("INSERT INTO designs (uuid, name, description) VALUES (?, ?, ?)")
        .bind(&design.uuid)
        .bind(&design.name)
        .bind(&design.description)
        .execute(conn)
        .await?;
    Ok(design)
}

pub async fn ntag_by_cid(pool: &Pool<Sqlite>, cid: &str) -> Result<Option<Ntag>, sqlx::Error> {
    sqlx::query_as::<_, Ntag>("SELECT * FROM ntags WHERE cid = ?")
        .bind(cid)
        .fetch_optional(pool)
        .await
}

/// Lookup by the verifier's `(cid, k1)` key.
pub async fn ntag_by_cid_and_k1(
    pool: &Pool<Sqlite>,
    cid: &str,
    k1: &str,
) -> Result<Option<Ntag>, sqlx::Error> {
    sqlx::query_as::<_, Ntag>("SELECT * FROM ntags WHERE cid = ? AND k1 = ?")
        .bind(cid)
        .bind(k1)
        .fetch_optional(pool)
        .await
}

/// Create an NTAG with freshly generated per-card keys. Returns the existing
/// record untouched when the cid is already known (idempotent
/// re-programming); fails when the design reference does not resolve.
pub async fn create_ntag(
    pool: &Pool<Sqlite>,
    cid: &str,
    ctr: i64,
    design: &DesignRef,
    module_k1: &AesKey,
) -> ServiceResult<(Ntag, bool)> {
    let mut tx = pool.begin().await?;

    if let Some(existing) = sqlx::query_as::<_, Ntag>("SELECT * FROM ntags WHERE cid = ?")
        .bind(cid)
        .fetch_optional(&mut *tx)
        .await?
    {
        tx.commit().await?;
        return Ok((existing, false));
    }

    let design = design_by_ref(&mut *tx, design)
        .await?
        .ok_or_else(|| ServiceError::Unprocessable("design not found".to_string()))?;

    let ntag = Ntag {
        cid: cid.to_string(),
        k0: AesKey::generate().to_string(),
        k1: module_k1.to_string(),
        k2: AesKey::generate().to_string(),
        k3: AesKey::generate().to_string(),
        k4: AesKey::generate().to_string(),
        ctr,
        otc: None,
        design_uuid: design.uuid,
        created_at: unix_now(),
    };

    sqlx::query(
        "INSERT INTO ntags (cid, k0, k1, k2, k3, k4, ctr, otc, design_uuid, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
    )
    .bind(&ntag.cid)
    .bind(&ntag.k0)
    .bind(&ntag.k1)
    .bind(&ntag.k2)
    .bind(&ntag.k3)
    .bind(&ntag.k4)
    .bind(ntag.ctr)
    .bind(&ntag.design_uuid)
    .bind(ntag.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((ntag, true))
}

/// Bind a one-time association code to a tag. Idempotent for the same code;
/// conflicting rebinds are rejected with the previous binding in the reason.
pub async fn set_otc(pool: &Pool<Sqlite>, cid: &str, otc: &str) -> ServiceResult<()> {
    let mut tx = pool.begin().await?;

    let ntag = sqlx::query_as::<_, Ntag>("SELECT * FROM ntags WHERE cid = ?")
        .bind(cid)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound("ntag not found".to_string()))?;

    match ntag.otc.as_deref() {
        Some(existing) if existing == otc => {
            tx.commit().await?;
            return Ok(());
        }
        Some(existing) => {
            return Err(ServiceError::Conflict(format!(
                "tag already associated with code {existing}, refusing {otc}"
            )));
        }
        None => {}
    }

    if let Some(owner) = sqlx::query_as::<_, Ntag>("SELECT * FROM ntags WHERE otc = ?")
        .bind(otc)
        .fetch_optional(&mut *tx)
        .await?
    {
        return Err(ServiceError::Conflict(format!(
            "code already bound to tag {}, refusing {}",
            owner.cid, cid
        )));
    }

    sqlx::query("UPDATE ntags SET otc = ? WHERE cid = ?")
        .bind(otc)
        .bind(cid)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

/// A tag reachable by `otc` that no card has claimed yet.
pub async fn find_available_ntag_by_otc(
    pool: &Pool<Sqlite>,
    otc: &str,
) -> Result<Option<Ntag>, sqlx::Error> {
    sqlx::query_as::<_, Ntag>(
        "SELECT n.* FROM ntags n
         LEFT JOIN cards c ON c.ntag424_cid = n.cid
         WHERE n.otc = ? AND c.uuid IS NULL",
    )
    .bind(otc)
    .fetch_optional(pool)
    .await
}

/// Any tag bound to `otc`, claimed or not.
pub async fn ntag_by_otc(pool: &Pool<Sqlite>, otc: &str) -> Result<Option<Ntag>, sqlx::Error> {
    sqlx::query_as::<_, Ntag>("SELECT * FROM ntags WHERE otc = ?")
        .bind(otc)
        .fetch_optional(pool)
        .await
}

pub async fn delete_ntag(pool: &Pool<Sqlite>, cid: &str) -> ServiceResult<()> {
    let result = sqlx::query("DELETE FROM ntags WHERE cid = ?")
        .bind(cid)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound("ntag not found".to_string()));
    }
    Ok(())
}

/// Advance the tap counter iff strictly greater than the stored value.
/// Zero rows affected means a concurrent tap won, or a replay.
pub async fn advance_counter(
    conn: &mut SqliteConnection,
    cid: &str,
    new_ctr: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE ntags SET ctr = ? WHERE cid = ? AND ctr < ?")
        .bind(new_ctr)
        .bind(cid)
        .bind(new_ctr)
        .execute(conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Create the holder if absent; attach the delegation if new; connect the
/// merchant set.
pub async fn upsert_holder(
    conn: &mut SqliteConnection,
    pubkey: &str,
    delegation: &NewDelegation<'_>,
    trusted_merchants: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO holders (pubkey, created_at) VALUES (?, ?)")
        .bind(pubkey)
        .bind(unix_now())
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO delegations
         (delegator_pubkey, conditions, delegation_token, since, until)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(pubkey)
    .bind(delegation.conditions)
    .bind(delegation.token)
    .bind(delegation.since)
    .bind(delegation.until)
    .execute(&mut *conn)
    .await?;

    for merchant in trusted_merchants {
        sqlx::query(
            "INSERT OR IGNORE INTO trusted_merchants (holder_pubkey, merchant_pubkey)
             VALUES (?, ?)",
        )
        .bind(pubkey)
        .bind(merchant)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Delegation fields as validated by the caller.
#[derive(Debug, Clone, Copy)]
pub struct NewDelegation<'a> {
    pub conditions: &'a str,
    pub token: &'a str,
    pub since: i64,
    pub until: i64,
}

/// Create the logical card for a tag, enabled, with its default limits.
pub async fn create_card(
    conn: &mut SqliteConnection,
    ntag_cid: &str,
    holder_pubkey: &str,
    name: &str,
    description: &str,
    default_limits: &[LimitSpec],
) -> ServiceResult<Card> {
    let card = Card {
        uuid: Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: description.to_string(),
        enabled: true,
        ntag424_cid: ntag_cid.to_string(),
        holder_pubkey: Some(holder_pubkey.to_string()),
        created_at: unix_now(),
    };

    sqlx::query(
        "INSERT INTO cards (uuid, name, description, enabled, ntag424_cid, holder_pubkey, created_at)
         VALUES (?, ?, ?, 1, ?, ?, ?)",
    )
    .bind(&card.uuid)
    .bind(&card.name)
    .bind(&card.description)
    .bind(&card.ntag424_cid)
    .bind(card.holder_pubkey.as_deref())
    .bind(card.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            ServiceError::Conflict("tag already carries a card".to_string())
        }
        other => other.into(),
    })?;

    for spec in default_limits {
        sqlx::query(
            "INSERT INTO limits (uuid, card_uuid, name, description, token, amount, delta)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&card.uuid)
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(&spec.token)
        .bind(spec.amount)
        .bind(spec.delta)
        .execute(&mut *conn)
        .await?;
    }

    Ok(card)
}

/// Move a card between holders; disables it until the new holder re-enables.
pub async fn transfer_card(
    conn: &mut SqliteConnection,
    uuid: &str,
    from_pubkey: &str,
    to_pubkey: &str,
) -> ServiceResult<()> {
    let result = sqlx::query(
        "UPDATE cards SET enabled = 0, holder_pubkey = ?
         WHERE uuid = ? AND holder_pubkey = ?",
    )
    .bind(to_pubkey)
    .bind(uuid)
    .bind(from_pubkey)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound(
            "card not found for this holder".to_string(),
        ));
    }
    Ok(())
}

pub async fn card_by_uuid(pool: &Pool<Sqlite>, uuid: &str) -> Result<Option<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE uuid = ?")
        .bind(uuid)
        .fetch_optional(pool)
        .await
}

pub async fn card_by_cid(pool: &Pool<Sqlite>, cid: &str) -> Result<Option<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE ntag424_cid = ?")
        .bind(cid)
        .fetch_optional(pool)
        .await
}

pub async fn cards_by_holder(
    pool: &Pool<Sqlite>,
    holder_pubkey: &str,
) -> Result<Vec<Card>, sqlx::Error> {
    sqlx::query_as::<_, Card>(
        "SELECT * FROM cards WHERE holder_pubkey = ? ORDER BY created_at, uuid",
    )
    .bind(holder_pubkey)
    .fetch_all(pool)
    .await
}

pub async fn limits_for_card(
    pool: &Pool<Sqlite>,
    card_uuid: &str,
) -> Result<Vec<Limit>, sqlx::Error> {
    sqlx::query_as::<_, Limit>("SELECT * FROM limits WHERE card_uuid = ? ORDER BY uuid")
        .bind(card_uuid)
        .fetch_all(pool)
        .await
}

/// The holder's delegation valid at `now`, newest window first. Generic
/// over the executor so pay flows can read it inside their transaction.
pub async fn current_delegation<'e, E>(
    executor: E,
    holder_pubkey: &str,
    now: i64,
) -> Result<Option<Delegation>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Delegation>(
        "SELECT * FROM delegations
         WHERE delegator_pubkey = ? AND since < ? AND until > ?
         ORDER BY until DESC LIMIT 1",
    )
    .bind(holder_pubkey)
    .bind(now)
    .bind(now)
    .fetch_optional(executor)
    .await
}

pub async fn holder_by_pubkey(
    pool: &Pool<Sqlite>,
    pubkey: &str,
) -> Result<Option<Holder>, sqlx::Error> {
    sqlx::query_as::<_, Holder>("SELECT * FROM holders WHERE pubkey = ?")
        .bind(pubkey)
        .fetch_optional(pool)
        .await
}

pub async fn trusted_merchants(
    pool: &Pool<Sqlite>,
    holder_pubkey: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT merchant_pubkey FROM trusted_merchants
         WHERE holder_pubkey = ? ORDER BY merchant_pubkey",
    )
    .bind(holder_pubkey)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(pk,)| pk).collect())
}

pub async fn seed_merchants(pool: &Pool<Sqlite>, pubkeys: &[String]) -> Result<(), sqlx::Error> {
    for pubkey in pubkeys {
        sqlx::query("INSERT OR IGNORE INTO merchants (pubkey) VALUES (?)")
            .bind(pubkey)
            .execute(pool)
            .await?;
    }
    Ok(())
}

pub async fn known_merchants(pool: &Pool<Sqlite>) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT pubkey FROM merchants").fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(pk,)| pk).collect())
}

/// Swap the holder's merchant set for the given one.
pub async fn replace_trusted_merchants(
    conn: &mut SqliteConnection,
    holder_pubkey: &str,
    merchants: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM trusted_merchants WHERE holder_pubkey = ?")
        .bind(holder_pubkey)
        .execute(&mut *conn)
        .await?;

    for merchant in merchants {
        sqlx::query(
            "INSERT OR IGNORE INTO trusted_merchants (holder_pubkey, merchant_pubkey)
             VALUES (?, ?)",
        )
        .bind(holder_pubkey)
        .bind(merchant)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Swap a card's spending rules for the given ones.
pub async fn replace_limits(
    conn: &mut SqliteConnection,
    card_uuid: &str,
    limits: &[LimitSpec],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM limits WHERE card_uuid = ?")
        .bind(card_uuid)
        .execute(&mut *conn)
        .await?;

    for spec in limits {
        sqlx::query(
            "INSERT INTO limits (uuid, card_uuid, name, description, token, amount, delta)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(card_uuid)
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(&spec.token)
        .bind(spec.amount)
        .bind(spec.delta)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Patch the mutable card profile fields; `None` leaves a field untouched.
pub async fn update_card_profile(
    conn: &mut SqliteConnection,
    card_uuid: &str,
    name: Option<&str>,
    description: Option<&str>,
    enabled: Option<bool>,
) -> Result<(), sqlx::Error> {
    if let Some(name) = name {
        sqlx::query("UPDATE cards SET name = ? WHERE uuid = ?")
            .bind(name)
            .bind(card_uuid)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(description) = description {
        sqlx::query("UPDATE cards SET description = ? WHERE uuid = ?")
            .bind(description)
            .bind(card_uuid)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(enabled) = enabled {
        sqlx::query("UPDATE cards SET enabled = ? WHERE uuid = ?")
            .bind(enabled)
            .bind(card_uuid)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn insert_payment(
    conn: &mut SqliteConnection,
    card_uuid: &str,
    token: &str,
    amount: i64,
    payment_request_uuid: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO payments (card_uuid, token, amount, status, payment_request_uuid, created_at)
         VALUES (?, ?, ?, 'confirmed', ?, ?)",
    )
    .bind(card_uuid)
    .bind(token)
    .bind(amount)
    .bind(payment_request_uuid)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn upsert_reset_token(
    pool: &Pool<Sqlite>,
    holder_pubkey: &str,
    token: &str,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO reset_tokens (holder_pubkey, token, created_at) VALUES (?, ?, ?)
         ON CONFLICT(holder_pubkey) DO UPDATE SET token = excluded.token,
                                                  created_at = excluded.created_at",
    )
    .bind(holder_pubkey)
    .bind(token)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn reset_token_by_token(
    pool: &Pool<Sqlite>,
    token: &str,
) -> Result<Option<ResetToken>, sqlx::Error> {
    sqlx::query_as::<_, ResetToken>("SELECT * FROM reset_tokens WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await
}

pub async fn delete_reset_token(
    pool: &Pool<Sqlite>,
    holder_pubkey: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM reset_tokens WHERE holder_pubkey = ?")
        .bind(holder_pubkey)
        .execute(pool)
        .await?;
    Ok(())
}

/// Reassign every card of `from` to `to`.
pub async fn reassign_cards(
    conn: &mut SqliteConnection,
    from_pubkey: &str,
    to_pubkey: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE cards SET holder_pubkey = ? WHERE holder_pubkey = ?")
        .bind(to_pubkey)
        .bind(from_pubkey)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// Copy the old holder's merchant set under the new holder.
pub async fn clone_trusted_merchants(
    conn: &mut SqliteConnection,
    from_pubkey: &str,
    to_pubkey: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO trusted_merchants (holder_pubkey, merchant_pubkey)
         SELECT ?, merchant_pubkey FROM trusted_merchants WHERE holder_pubkey = ?",
    )
    .bind(to_pubkey)
    .bind(from_pubkey)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn watermark(pool: &Pool<Sqlite>, subscription: &str) -> Result<Option<i64>, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT last_created_at FROM watermarks WHERE subscription = ?")
            .bind(subscription)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(ts,)| ts))
}

/// Advance the watermark, never moving it backwards.
pub async fn advance_watermark(
    pool: &Pool<Sqlite>,
    subscription: &str,
    created_at: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO watermarks (subscription, last_created_at) VALUES (?, ?)
         ON CONFLICT(subscription) DO UPDATE SET last_created_at =
             MAX(last_created_at, excluded.last_created_at)",
    )
    .bind(subscription)
    .bind(created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop scan tokens past expiry that never produced a payment, and reset
/// nonces past their TTL.
pub async fn collect_garbage(
    pool: &Pool<Sqlite>,
    payment_request_expiry: i64,
    reset_token_ttl: i64,
) -> Result<(), sqlx::Error> {
    let now = unix_now();

    sqlx::query(
        "DELETE FROM payment_requests
         WHERE created_at < ?
           AND uuid NOT IN (SELECT payment_request_uuid FROM payments)",
    )
    .bind(now - payment_request_expiry)
    .execute(pool)
    .await?;

    sqlx::query("DELETE FROM reset_tokens WHERE created_at < ?")
        .bind(now - reset_token_ttl)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn payment_request_by_uuid(
    pool: &Pool<Sqlite>,
    uuid: &str,
) -> Result<Option<PaymentRequest>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRequest>("SELECT * FROM payment_requests WHERE uuid = ?")
        .bind(uuid)
        .fetch_optional(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    async fn seeded_design(pool: &Pool<Sqlite>) -> Design {
        let mut conn = pool.acquire().await.unwrap();
        ensure_design(&mut *conn, "To the moon", "rocket art").await.unwrap()
    }

    #[tokio::test]
    async fn create_ntag_is_idempotent_per_cid() {
        let pool = test_pool().await;
        seeded_design(&pool).await;
        let k1 = AesKey::generate();

        let (first, created) = create_ntag(
            &pool,
            "f0da0000000010",
            0,
            &DesignRef::Name("To the moon".into()),
            &k1,
        )
        .await
        .unwrap();
        assert!(created);
        assert_eq!(first.k1, k1.to_string());

        let (second, created) = create_ntag(
            &pool,
            "f0da0000000010",
            0,
            &DesignRef::Name("To the moon".into()),
            &k1,
        )
        .await
        .unwrap();
        assert!(!created);
        assert_eq!(second.k0, first.k0);
    }

    #[tokio::test]
    async fn create_ntag_requires_design() {
        let pool = test_pool().await;
        let err = create_ntag(
            &pool,
            "f0da0000000010",
            0,
            &DesignRef::Name("missing".into()),
            &AesKey::generate(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServiceError::Unprocessable(_)));
    }

    #[tokio::test]
    async fn set_otc_idempotency_and_conflicts() {
        let pool = test_pool().await;
        seeded_design(&pool).await;
        let k1 = AesKey::generate();
        let design = DesignRef::Name("To the moon".into());

        create_ntag(&pool, "aa00000000000001", 0, &design, &k1).await.unwrap();
        create_ntag(&pool, "aa00000000000002", 0, &design, &k1).await.unwrap();

        set_otc(&pool, "aa00000000000001", "weirdcode").await.unwrap();
        // Same code again is fine.
        set_otc(&pool, "aa00000000000001", "weirdcode").await.unwrap();
        // Different code for the same tag is not.
        assert!(matches!(
            set_otc(&pool, "aa00000000000001", "othercode").await,
            Err(ServiceError::Conflict(_))
        ));
        // Same code for a different tag is not.
        assert!(matches!(
            set_otc(&pool, "aa00000000000002", "weirdcode").await,
            Err(ServiceError::Conflict(_))
        ));
        // Unknown tag.
        assert!(matches!(
            set_otc(&pool, "ff00000000000000", "x").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn counter_only_moves_forward() {
        let pool = test_pool().await;
        seeded_design(&pool).await;
        create_ntag(
            &pool,
            "aa00000000000001",
            0,
            &DesignRef::Name("To the moon".into()),
            &AesKey::generate(),
        )
        .await
        .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(advance_counter(&mut *conn, "aa00000000000001", 5).await.unwrap());
        assert!(!advance_counter(&mut *conn, "aa00000000000001", 5).await.unwrap());
        assert!(!advance_counter(&mut *conn, "aa00000000000001", 3).await.unwrap());
        assert!(advance_counter(&mut *conn, "aa00000000000001", 6).await.unwrap());
    }

    #[tokio::test]
    async fn otc_is_consumed_by_card_creation() {
        let pool = test_pool().await;
        seeded_design(&pool).await;
        create_ntag(
            &pool,
            "aa00000000000001",
            0,
            &DesignRef::Name("To the moon".into()),
            &AesKey::generate(),
        )
        .await
        .unwrap();
        set_otc(&pool, "aa00000000000001", "weirdcode").await.unwrap();

        assert!(find_available_ntag_by_otc(&pool, "weirdcode")
            .await
            .unwrap()
            .is_some());

        let holder = "a".repeat(64);
        let mut tx = pool.begin().await.unwrap();
        upsert_holder(
            &mut *tx,
            &holder,
            &NewDelegation {
                conditions: "kind=1112&created_at<20&created_at>10",
                token: "tok",
                since: 10,
                until: 20,
            },
            &[],
        )
        .await
        .unwrap();
        create_card(&mut *tx, "aa00000000000001", &holder, "To the moon", "", &[])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(find_available_ntag_by_otc(&pool, "weirdcode")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn transfer_card_rebinds_and_disables() {
        let pool = test_pool().await;
        seeded_design(&pool).await;
        create_ntag(
            &pool,
            "aa00000000000001",
            0,
            &DesignRef::Name("To the moon".into()),
            &AesKey::generate(),
        )
        .await
        .unwrap();

        let donor = "a".repeat(64);
        let receiver = "b".repeat(64);
        let delegation = NewDelegation {
            conditions: "kind=1112&created_at<20&created_at>10",
            token: "tok",
            since: 10,
            until: 20,
        };

        let mut tx = pool.begin().await.unwrap();
        upsert_holder(&mut *tx, &donor, &delegation, &[]).await.unwrap();
        let card = create_card(&mut *tx, "aa00000000000001", &donor, "To the moon", "", &[])
            .await
            .unwrap();
        upsert_holder(&mut *tx, &receiver, &delegation, &[]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        assert!(matches!(
            transfer_card(&mut *tx, &card.uuid, &receiver, &donor).await,
            Err(ServiceError::NotFound(_))
        ));
        transfer_card(&mut *tx, &card.uuid, &donor, &receiver).await.unwrap();
        tx.commit().await.unwrap();

        let moved = card_by_uuid(&pool, &card.uuid).await.unwrap().unwrap();
        assert_eq!(moved.holder_pubkey.as_deref(), Some(receiver.as_str()));
        assert!(!moved.enabled);
    }

    #[tokio::test]
    async fn watermark_never_regresses() {
        let pool = test_pool().await;
        assert_eq!(watermark(&pool, "card-config-change").await.unwrap(), None);

        advance_watermark(&pool, "card-config-change", 100).await.unwrap();
        advance_watermark(&pool, "card-config-change", 50).await.unwrap();
        assert_eq!(
            watermark(&pool, "card-config-change").await.unwrap(),
            Some(100)
        );
    }
}
