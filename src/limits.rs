//! Sliding-window limit engine: how much each token may still withdraw.

use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Remaining allowance per token at `now`.
///
/// Every limit on the card is charged with the payments of its own window;
/// a token's effective remaining is the minimum over its limits. Tokens
/// whose minimum is exhausted (<= 0) are omitted, as are tokens the card
/// has no limit for. Runs on the caller's connection so pay flows can keep
/// the check inside their consuming transaction.
pub async fn remaining(
    conn: &mut SqliteConnection,
    card_uuid: &str,
    tokens: &[String],
    now: i64,
) -> Result<HashMap<String, i64>, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT l.token,
                l.amount - COALESCE((
                    SELECT SUM(p.amount) FROM payments p
                    WHERE p.card_uuid = l.card_uuid
                      AND p.token = l.token
                      AND p.created_at >= ? - l.delta
                      AND p.created_at <= ?
                ), 0) AS remaining
         FROM limits l
         WHERE l.card_uuid = ?",
    )
    .bind(now)
    .bind(now)
    .bind(card_uuid)
    .fetch_all(conn)
    .await?;

    let mut per_token: HashMap<String, i64> = HashMap::new();
    for (token, remaining) in rows {
        if !tokens.contains(&token) {
            continue;
        }
        per_token
            .entry(token)
            .and_modify(|current| *current = (*current).min(remaining))
            .or_insert(remaining);
    }

    per_token.retain(|_, remaining| *remaining > 0);
    Ok(per_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitSpec;
    use crate::crypto::AesKey;
    use crate::db::registry::{self, DesignRef, NewDelegation};
    use crate::db::test_pool;
    use sqlx::{Pool, Sqlite};
    use uuid::Uuid;

    const NOW: i64 = 1_700_000_000;

    async fn rem_at_now(
        pool: &Pool<Sqlite>,
        card: &str,
        tokens: &[String],
    ) -> HashMap<String, i64> {
        let mut conn = pool.acquire().await.unwrap();
        remaining(&mut *conn, card, tokens, NOW).await.unwrap()
    }

    async fn card_with_limits(pool: &Pool<Sqlite>, limits: &[LimitSpec]) -> String {
        let mut conn = pool.acquire().await.unwrap();
        registry::ensure_design(&mut *conn, "To the moon", "").await.unwrap();
        drop(conn);
        registry::create_ntag(
            pool,
            "f0da0000000010",
            0,
            &DesignRef::Name("To the moon".into()),
            &AesKey::generate(),
        )
        .await
        .unwrap();

        let holder = "a".repeat(64);
        let mut tx = pool.begin().await.unwrap();
        registry::upsert_holder(
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
        let card = registry::create_card(
            &mut *tx,
            "f0da0000000010",
            &holder,
            "To the moon",
            "",
            limits,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        card.uuid
    }

    async fn pay(pool: &Pool<Sqlite>, card_uuid: &str, token: &str, amount: i64, at: i64) {
        let pr_uuid = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO payment_requests (uuid, card_uuid, response, created_at)
             VALUES (?, ?, '{}', ?)",
        )
        .bind(&pr_uuid)
        .bind(card_uuid)
        .bind(at)
        .execute(pool)
        .await
        .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        registry::insert_payment(&mut *conn, card_uuid, token, amount, &pr_uuid, at)
            .await
            .unwrap();
    }

    fn btc_limit(amount: i64, delta: i64) -> LimitSpec {
        LimitSpec {
            name: "window".into(),
            description: String::new(),
            token: "BTC".into(),
            amount,
            delta,
        }
    }

    #[tokio::test]
    async fn charges_only_payments_inside_the_window() {
        let pool = test_pool().await;
        let card = card_with_limits(&pool, &[btc_limit(1_000_000, 60)]).await;

        pay(&pool, &card, "BTC", 999_000, NOW - 30).await;
        pay(&pool, &card, "BTC", 500_000, NOW - 61).await;

        let rem = rem_at_now(&pool, &card, &["BTC".into()]).await;
        assert_eq!(rem.get("BTC"), Some(&1_000));
    }

    #[tokio::test]
    async fn takes_minimum_over_windows_of_a_token() {
        let pool = test_pool().await;
        let card = card_with_limits(
            &pool,
            &[btc_limit(1_000_000, 60), btc_limit(300_000, 3600)],
        )
        .await;

        pay(&pool, &card, "BTC", 100_000, NOW - 600).await;

        // First window sees nothing, second is charged 100k.
        let rem = rem_at_now(&pool, &card, &["BTC".into()]).await;
        assert_eq!(rem.get("BTC"), Some(&200_000));
    }

    #[tokio::test]
    async fn exhausted_tokens_are_omitted() {
        let pool = test_pool().await;
        let card = card_with_limits(&pool, &[btc_limit(1_000, 60)]).await;

        pay(&pool, &card, "BTC", 1_000, NOW - 1).await;

        let rem = rem_at_now(&pool, &card, &["BTC".into()]).await;
        assert!(rem.is_empty());
    }

    #[tokio::test]
    async fn unknown_tokens_are_omitted() {
        let pool = test_pool().await;
        let card = card_with_limits(&pool, &[btc_limit(1_000, 60)]).await;

        let rem = rem_at_now(&pool, &card, &["USD".into()]).await;
        assert!(rem.is_empty());
    }

    #[tokio::test]
    async fn multi_token_cards_report_each_token() {
        let pool = test_pool().await;
        let mut usd = btc_limit(5_000, 60);
        usd.token = "USD".into();
        let card = card_with_limits(&pool, &[btc_limit(1_000_000, 60), usd]).await;

        pay(&pool, &card, "USD", 1_000, NOW - 10).await;

        let rem = rem_at_now(&pool, &card, &["BTC".into(), "USD".into()]).await;
        assert_eq!(rem.get("BTC"), Some(&1_000_000));
        assert_eq!(rem.get("USD"), Some(&4_000));
    }
}
