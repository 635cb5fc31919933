//! NIP-04 encryption: AES-256-CBC under an ECDH-derived key, plus the
//! multi-recipient envelope used for card-data and card-config documents.
//!
//! The shared key is the raw x coordinate of the ECDH point (no hashing),
//! and the wire form is `base64(ciphertext) + "?iv=" + base64(iv)`.

use aes::Aes256;
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use secp256k1::ecdh::shared_secret_point;
use secp256k1::{Parity, PublicKey, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Derive the 32-byte conversation key between a secret key and an x-only
/// counterparty pubkey (64 hex chars).
fn conversation_key(sk: &SecretKey, counterparty_hex: &str) -> Result<[u8; 32]> {
    let xonly = XOnlyPublicKey::from_str(counterparty_hex)
        .map_err(|_| anyhow!("invalid counterparty pubkey"))?;
    let pk = PublicKey::from_x_only_public_key(xonly, Parity::Even);

    let point = shared_secret_point(&pk, sk);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

/// Encrypt a plaintext to one counterparty.
pub fn encrypt(sk: &SecretKey, counterparty_hex: &str, plaintext: &str) -> Result<String> {
    let key = conversation_key(sk, counterparty_hex)?;
    let iv: [u8; 16] = rand::random();

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| anyhow!("cipher init failed: {:?}", e))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt a `base64(ct)?iv=base64(iv)` payload from one counterparty.
pub fn decrypt(sk: &SecretKey, counterparty_hex: &str, payload: &str) -> Result<String> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| anyhow!("missing iv separator"))?;

    let ciphertext = BASE64.decode(ct_b64).context("bad ciphertext base64")?;
    let iv = BASE64.decode(iv_b64).context("bad iv base64")?;
    if iv.len() != 16 {
        bail!("iv must be 16 bytes");
    }

    let key = conversation_key(sk, counterparty_hex)?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| anyhow!("cipher init failed: {:?}", e))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| anyhow!("decryption failed"))?;

    String::from_utf8(plaintext).context("plaintext is not utf-8")
}

/// Envelope carrying one ciphertext per recipient, in recipient order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRecipientEnvelope {
    #[serde(rename = "enc-algo")]
    pub enc_algo: String,
    pub ciphertext: Vec<String>,
    pub recipients: Vec<String>,
}

/// Encrypt a plaintext so each recipient can open its own slot. Returns the
/// canonical envelope JSON used as event content.
pub fn encrypt_many(sk: &SecretKey, plaintext: &str, recipients: &[String]) -> Result<String> {
    let ciphertext = recipients
        .iter()
        .map(|recipient| encrypt(sk, recipient, plaintext))
        .collect::<Result<Vec<_>>>()?;

    let envelope = MultiRecipientEnvelope {
        enc_algo: "nip-04".to_string(),
        ciphertext,
        recipients: recipients.to_vec(),
    };
    serde_json::to_string(&envelope).context("envelope serialization failed")
}

/// Decrypt an inbound content blob from `sender`. Accepts either the
/// multi-recipient envelope (our slot is found by `own_pubkey`) or a bare
/// NIP-04 payload.
pub fn decrypt_inbound(
    sk: &SecretKey,
    own_pubkey: &str,
    sender_hex: &str,
    content: &str,
) -> Result<String> {
    if let Ok(envelope) = serde_json::from_str::<MultiRecipientEnvelope>(content) {
        if envelope.enc_algo != "nip-04" {
            bail!("unsupported enc-algo {}", envelope.enc_algo);
        }
        let slot = envelope
            .recipients
            .iter()
            .position(|r| r == own_pubkey)
            .ok_or_else(|| anyhow!("not a recipient"))?;
        let payload = envelope
            .ciphertext
            .get(slot)
            .ok_or_else(|| anyhow!("envelope ciphertext/recipient mismatch"))?;
        return decrypt(sk, sender_hex, payload);
    }

    decrypt(sk, sender_hex, content)
}
