//! Short-UUID codec: a 128-bit UUID rendered as 22 digits over the
//! `A-Za-z0-9-_` alphabet, most significant digit first, padded with
//! leading `A`s.

use anyhow::{anyhow, Result};
use uuid::Uuid;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
const SUUID_LEN: usize = 22;

fn digit_value(c: u8) -> Option<u128> {
    match c {
        b'A'..=b'Z' => Some((c - b'A') as u128),
        b'a'..=b'z' => Some((c - b'a') as u128 + 26),
        b'0'..=b'9' => Some((c - b'0') as u128 + 52),
        b'-' => Some(62),
        b'_' => Some(63),
        _ => None,
    }
}

/// Encode a UUID as its 22-character short form.
pub fn uuid2suuid(uuid: &Uuid) -> String {
    let n = u128::from_be_bytes(*uuid.as_bytes());

    let mut out = [0u8; SUUID_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 6 * (SUUID_LEN - 1 - i) as u32;
        let digit = ((n >> shift) & 0x3F) as usize;
        *slot = ALPHABET[digit];
    }
    String::from_utf8(out.to_vec()).expect("alphabet is ascii")
}

/// Decode a 22-character short form back into a UUID.
pub fn suuid2uuid(s: &str) -> Result<Uuid> {
    let bytes = s.as_bytes();
    if bytes.len() != SUUID_LEN {
        return Err(anyhow!("short uuid must be 22 characters"));
    }

    // 22 digits carry 132 bits; the leading digit may only use 2 of its 6.
    if digit_value(bytes[0]).unwrap_or(u128::MAX) > 3 {
        return Err(anyhow!("short uuid overflows 128 bits"));
    }

    let mut n: u128 = 0;
    for &c in bytes {
        let digit = digit_value(c).ok_or_else(|| anyhow!("invalid short uuid character"))?;
        n = (n << 6) | digit;
    }

    Ok(Uuid::from_bytes(n.to_be_bytes()))
}
