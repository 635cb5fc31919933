pub mod nip04;

use aes::Aes128;
use anyhow::{anyhow, Result};
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 16-byte AES key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(anyhow!("AES key must be 16 bytes"));
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for AesKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AesKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A 7-byte card id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardId([u8; 7]);

impl CardId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 7 {
            return Err(anyhow!("card id must be 7 bytes"));
        }
        let mut arr = [0u8; 7];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Tap counter carried in the PICC data, 0..2^24-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TapCounter(u32);

impl TapCounter {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Decode the 3 on-wire bytes (little-endian).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 3 {
            return Err(anyhow!("counter must be 3 bytes"));
        }
        let value = u32::from(bytes[2]) << 16 | u32::from(bytes[1]) << 8 | u32::from(bytes[0]);
        Ok(Self(value))
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [
            (self.0 & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            ((self.0 >> 16) & 0xFF) as u8,
        ]
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TapCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decrypt the 16-byte PICC block. The card encrypts a single AES block in
/// CBC mode with a zero IV, which for one block is a plain block decrypt.
pub fn decrypt_picc(key: &AesKey, ciphertext: &[u8]) -> Result<[u8; 16]> {
    if ciphertext.len() != 16 {
        return Err(anyhow!("ciphertext must be 16 bytes"));
    }

    let cipher = Aes128::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow!("invalid key length: {:?}", e))?;
    let mut block = [0u8; 16];
    block.copy_from_slice(ciphertext);

    cipher.decrypt_block((&mut block).into());
    Ok(block)
}

/// Encrypt a 16-byte PICC block, the inverse of [`decrypt_picc`].
pub fn encrypt_picc(key: &AesKey, plaintext: &[u8; 16]) -> Result<[u8; 16]> {
    let cipher = Aes128::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow!("invalid key length: {:?}", e))?;
    let mut block = *plaintext;

    cipher.encrypt_block((&mut block).into());
    Ok(block)
}

/// Split a decrypted PICC block into card id and counter. The block must
/// start with the 0xC7 SUN prefix.
pub fn parse_picc(decrypted: &[u8; 16]) -> Result<(CardId, TapCounter)> {
    if decrypted[0] != 0xC7 {
        return Err(anyhow!("invalid PICC data prefix"));
    }

    let cid = CardId::from_bytes(&decrypted[1..8])?;
    let counter = TapCounter::from_bytes(&decrypted[8..11])?;

    Ok((cid, counter))
}

fn sv2(cid: &CardId, counter: &TapCounter) -> [u8; 16] {
    let mut sv2 = [0u8; 16];
    sv2[0] = 0x3c;
    sv2[1] = 0xc3;
    sv2[2] = 0x00;
    sv2[3] = 0x01;
    sv2[4] = 0x00;
    sv2[5] = 0x80;
    sv2[6..13].copy_from_slice(cid.as_bytes());
    sv2[13..16].copy_from_slice(&counter.to_bytes());
    sv2
}

/// Compute the 8-byte SDMMAC tag for a card id and counter.
///
/// Two CMAC layers: the first derives the session key from SV2, the second
/// runs over the empty message. The tag is the odd-indexed bytes of the
/// second MAC, matching the on-silicon truncation.
pub fn sdmmac(k2: &AesKey, cid: &CardId, counter: &TapCounter) -> Result<[u8; 8]> {
    let mut session = <Cmac<Aes128> as Mac>::new_from_slice(k2.as_bytes())
        .map_err(|e| anyhow!("invalid key length: {:?}", e))?;
    session.update(&sv2(cid, counter));
    let k_session = session.finalize().into_bytes();

    let outer = <Cmac<Aes128> as Mac>::new_from_slice(&k_session)
        .map_err(|e| anyhow!("invalid key length: {:?}", e))?;
    let mac = outer.finalize().into_bytes();

    let mut tag = [0u8; 8];
    for (i, byte) in tag.iter_mut().enumerate() {
        *byte = mac[2 * i + 1];
    }
    Ok(tag)
}

/// Check an 8-byte SDMMAC against the expected value.
pub fn verify_sdmmac(
    k2: &AesKey,
    cid: &CardId,
    counter: &TapCounter,
    expected: &[u8],
) -> Result<bool> {
    if expected.len() != 8 {
        return Err(anyhow!("SDMMAC must be 8 bytes"));
    }
    let tag = sdmmac(k2, cid, counter)?;
    Ok(tag[..] == *expected)
}

/// Produce a `(p, c)` pair that [`crate::verifier`] accepts: the encrypted
/// PICC block and its SDMMAC, both uppercase hex. `pad` fills the 5 unused
/// plaintext bytes.
pub fn generate_pc(
    k1: &AesKey,
    k2: &AesKey,
    cid: &CardId,
    counter: &TapCounter,
    pad: &[u8; 5],
) -> Result<(String, String)> {
    let mut plain = [0u8; 16];
    plain[0] = 0xC7;
    plain[1..8].copy_from_slice(cid.as_bytes());
    plain[8..11].copy_from_slice(&counter.to_bytes());
    plain[11..16].copy_from_slice(pad);

    let p = encrypt_picc(k1, &plain)?;
    let c = sdmmac(k2, cid, counter)?;

    Ok((hex::encode_upper(p), hex::encode_upper(c)))
}
