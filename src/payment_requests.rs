//! Single-use scan tokens (`k1`): issued on scan, consumed by exactly one
//! payment.

use sqlx::SqliteConnection;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::PaymentRequest;
use crate::suuid::{suuid2uuid, uuid2suuid};

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("unknown payment request")]
    NotFound,
    #[error("payment request expired")]
    Expired,
    #[error("payment request already used")]
    AlreadyUsed,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Insert a payment request holding the pre-rendered scan reply (without
/// its `k1`) and return the suuid-encoded token.
pub async fn issue(
    conn: &mut SqliteConnection,
    card_uuid: &str,
    response: &str,
    now: i64,
) -> Result<String, sqlx::Error> {
    let uuid = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO payment_requests (uuid, card_uuid, response, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(uuid.to_string())
    .bind(card_uuid)
    .bind(response)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(uuid2suuid(&uuid))
}

/// Resolve a `k1` to its open payment request.
///
/// The caller must create the Payment rows referencing the returned uuid
/// inside the same transaction; that insert is what marks the request
/// consumed.
pub async fn consume(
    conn: &mut SqliteConnection,
    k1: &str,
    expiry_secs: i64,
    now: i64,
) -> Result<PaymentRequest, ConsumeError> {
    let uuid = suuid2uuid(k1).map_err(|_| ConsumeError::NotFound)?;

    let request = sqlx::query_as::<_, PaymentRequest>(
        "SELECT * FROM payment_requests WHERE uuid = ?",
    )
    .bind(uuid.to_string())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(ConsumeError::NotFound)?;

    if now - request.created_at > expiry_secs {
        return Err(ConsumeError::Expired);
    }

    let used: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM payments WHERE payment_request_uuid = ? LIMIT 1")
            .bind(&request.uuid)
            .fetch_optional(&mut *conn)
            .await?;
    if used.is_some() {
        return Err(ConsumeError::AlreadyUsed);
    }

    Ok(request)
}
