//! SUN tap verifier: decrypts the PICC datagram, authenticates the SDMMAC
//! and enforces counter monotonicity against the store.

use sqlx::{Pool, Sqlite};
use thiserror::Error;

use crate::crypto::{self, AesKey, CardId, TapCounter};
use crate::db::models::Ntag;
use crate::db::registry;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("p must be 32 uppercase hex characters")]
    MalformedPLength,
    #[error("decrypted PICC data has a bad prefix")]
    MalformedPPrefix,
    #[error("tap counter is not newer than the last accepted tap")]
    CtrTooOld,
    #[error("c must be 16 uppercase hex characters")]
    MalformedCLength,
    #[error("SDMMAC mismatch")]
    SdmmacMismatch,
    #[error("no tag matches the decrypted card id")]
    NotFound,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Crypto(#[from] anyhow::Error),
}

/// A successfully authenticated tap.
#[derive(Debug)]
pub struct VerifiedTap {
    pub ntag: Ntag,
    pub new_ctr: TapCounter,
}

fn is_upper_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Decrypt and authenticate `(p, c)` against the stored tag without
/// touching the counter. Used by [`verify`] and by the read-only
/// diagnostics path.
async fn authenticate(
    pool: &Pool<Sqlite>,
    module_k1: &AesKey,
    p: &str,
    c: &str,
) -> Result<(Ntag, CardId, TapCounter), VerifyError> {
    if p.len() != 32 || !is_upper_hex(p) {
        return Err(VerifyError::MalformedPLength);
    }
    if c.len() != 16 || !is_upper_hex(c) {
        return Err(VerifyError::MalformedCLength);
    }

    let p_bytes = hex::decode(p).map_err(|_| VerifyError::MalformedPLength)?;
    let c_bytes = hex::decode(c).map_err(|_| VerifyError::MalformedCLength)?;

    let decrypted = crypto::decrypt_picc(module_k1, &p_bytes)?;
    let (cid, counter) =
        crypto::parse_picc(&decrypted).map_err(|_| VerifyError::MalformedPPrefix)?;

    let ntag = registry::ntag_by_cid_and_k1(pool, &cid.to_string(), &module_k1.to_string())
        .await?
        .ok_or(VerifyError::NotFound)?;

    if i64::from(counter.value()) <= ntag.ctr {
        return Err(VerifyError::CtrTooOld);
    }

    let k2 = AesKey::from_hex(&ntag.k2)?;
    if !crypto::verify_sdmmac(&k2, &cid, &counter, &c_bytes)? {
        return Err(VerifyError::SdmmacMismatch);
    }

    Ok((ntag, cid, counter))
}

/// Full tap verification: authenticate, then atomically persist the new
/// counter. A concurrent tap that already advanced the counter makes the
/// conditional update a no-op and this tap is rejected.
pub async fn verify(
    pool: &Pool<Sqlite>,
    module_k1: &AesKey,
    p: &str,
    c: &str,
) -> Result<VerifiedTap, VerifyError> {
    let (mut ntag, _cid, counter) = authenticate(pool, module_k1, p, c).await?;

    let mut conn = pool.acquire().await?;
    let advanced =
        registry::advance_counter(&mut *conn, &ntag.cid, i64::from(counter.value())).await?;
    if !advanced {
        return Err(VerifyError::CtrTooOld);
    }

    ntag.ctr = i64::from(counter.value());
    Ok(VerifiedTap {
        ntag,
        new_ctr: counter,
    })
}

/// Read-only verification for diagnostics: same checks, counter untouched.
pub async fn inspect(
    pool: &Pool<Sqlite>,
    module_k1: &AesKey,
    p: &str,
    c: &str,
) -> Result<VerifiedTap, VerifyError> {
    let (ntag, _cid, counter) = authenticate(pool, module_k1, p, c).await?;
    Ok(VerifiedTap {
        ntag,
        new_ctr: counter,
    })
}
