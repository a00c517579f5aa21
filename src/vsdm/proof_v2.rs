//! VSDM proof version 2
//!
//! ```text
//! 0       1 | operator (5 bit) | key version (2 bit)
//! 1..13   IV
//! 13..31  AES-128-GCM ciphertext, 18 bytes
//! 31..47  tag
//! ```
//!
//! Plaintext:
//!
//! ```text
//! 0..5    health card value; top bit of byte 0 is the revoked flag
//! 5..8    (iat - IAT_EPOCH_OFFSET) >> 3, big endian
//! 8..18   KVNR
//! ```

use super::{encode_proof, VsdmKey, PROOF_BINARY_SIZE};
use crate::crypto::{hkdf_sha256, random_iv, sha256, AesGcm128, SymmetricKey, IV_LENGTH, TAG_LENGTH};
use crate::error::{Result, VauError};
use chrono::{DateTime, TimeZone, Utc};

pub const HCV_LENGTH: usize = 5;
pub const ENCRYPTED_CONTENT_LENGTH: usize = 18;
/// 2025-01-01T00:00:00Z, origin of the compressed timestamp
pub const IAT_EPOCH_OFFSET: i64 = 1_735_689_600;

const KEY_DERIVATION_INFO: &[u8] = b"VSDM+ Version 2 AES/GCM";
const KVNR_LENGTH: usize = 10;
const VERSION_BIT: u8 = 0x80;
const REVOKED_BIT: u8 = 0x80;
const IAT_GRANULARITY_SHIFT: u32 = 3;
const MAX_IAT: i64 = 1 << 24;

const CIPHERTEXT_OFFSET: usize = 1 + IV_LENGTH;
const TAG_OFFSET: usize = CIPHERTEXT_OFFSET + ENCRYPTED_CONTENT_LENGTH;

/// Content of a v2 proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedProof {
    pub revoked: bool,
    pub hcv: [u8; HCV_LENGTH],
    pub iat: DateTime<Utc>,
    pub kvnr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsdmProofV2 {
    key_operator_id: char,
    key_version: char,
    iv: [u8; IV_LENGTH],
    ciphertext: [u8; ENCRYPTED_CONTENT_LENGTH],
    authentication_tag: [u8; TAG_LENGTH],
}

fn derive_key(shared_secret: &[u8]) -> Result<SymmetricKey> {
    let okm = hkdf_sha256(shared_secret, KEY_DERIVATION_INFO, AesGcm128::KEY_LENGTH)?;
    SymmetricKey::from_slice(&okm)
}

fn copy<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| VauError::Forbidden("VSDM proof truncated".into()))
}

impl VsdmProofV2 {
    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        if raw.len() != PROOF_BINARY_SIZE {
            return Err(VauError::Forbidden(format!(
                "VSDM proof has {} bytes, expected {}",
                raw.len(),
                PROOF_BINARY_SIZE
            )));
        }
        let field = raw[0];
        if field & VERSION_BIT == 0 {
            return Err(VauError::Protocol("VSDM proof is not version 2".into()));
        }
        let key_version = (b'0' + (field & 0x03)) as char;
        let operator = (field & 0x7f) >> 2;
        if operator > b'Z' - b'A' {
            return Err(VauError::Protocol(format!(
                "VSDM operator id out of range: {}",
                operator
            )));
        }

        Ok(Self {
            key_operator_id: (b'A' + operator) as char,
            key_version,
            iv: copy(raw, 1)?,
            ciphertext: copy(raw, CIPHERTEXT_OFFSET)?,
            authentication_tag: copy(raw, TAG_OFFSET)?,
        })
    }

    pub fn key_operator_id(&self) -> char {
        self.key_operator_id
    }

    pub fn key_version(&self) -> char {
        self.key_version
    }

    /// Decrypt with the operator's shared secret
    pub fn decrypt(&self, shared_secret: &[u8]) -> Result<DecryptedProof> {
        let key = derive_key(shared_secret)?;
        let plaintext = AesGcm128::decrypt(&self.ciphertext, &key, &self.iv, &self.authentication_tag)
            .map_err(|e| VauError::Forbidden(format!("VSDM proof can't be decrypted: {}", e)))?;
        if plaintext.len() != ENCRYPTED_CONTENT_LENGTH {
            return Err(VauError::Protocol("unexpected size of decrypted VSDM proof".into()));
        }

        let revoked = plaintext[0] & REVOKED_BIT != 0;
        let mut hcv: [u8; HCV_LENGTH] = copy(&plaintext, 0)?;
        hcv[0] &= !REVOKED_BIT;

        let compressed = (i64::from(plaintext[5]) << 16)
            | (i64::from(plaintext[6]) << 8)
            | i64::from(plaintext[7]);
        let seconds = (compressed << IAT_GRANULARITY_SHIFT) + IAT_EPOCH_OFFSET;
        let iat = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| VauError::Protocol("VSDM proof timestamp out of range".into()))?;

        let kvnr = std::str::from_utf8(&plaintext[8..8 + KVNR_LENGTH])
            .map_err(|_| VauError::Protocol("KVNR in VSDM proof is not ASCII".into()))?
            .to_string();

        Ok(DecryptedProof {
            revoked,
            hcv,
            iat,
            kvnr,
        })
    }

    /// Encrypt `proof` with a fresh IV. The timestamp is stored with 8 second
    /// granularity and must lie between 2025-01-01 and about 2029-04-03.
    pub fn encrypt(key: &VsdmKey, proof: &DecryptedProof) -> Result<Self> {
        if proof.hcv[0] & REVOKED_BIT != 0 {
            return Err(VauError::Protocol("top bit of the HCV must be clear".into()));
        }
        if proof.kvnr.len() != KVNR_LENGTH || !proof.kvnr.is_ascii() {
            return Err(VauError::Protocol(format!("invalid KVNR '{}'", proof.kvnr)));
        }
        let since_offset = proof.iat.timestamp() - IAT_EPOCH_OFFSET;
        if since_offset < 0 {
            return Err(VauError::Protocol("timestamp before 2025-01-01".into()));
        }
        let compressed = since_offset >> IAT_GRANULARITY_SHIFT;
        if compressed >= MAX_IAT {
            return Err(VauError::Protocol("timestamp too large".into()));
        }

        let mut cleartext = zeroize::Zeroizing::new(Vec::with_capacity(ENCRYPTED_CONTENT_LENGTH));
        cleartext.extend_from_slice(&proof.hcv);
        if proof.revoked {
            cleartext[0] |= REVOKED_BIT;
        }
        cleartext.extend_from_slice(&(compressed as u32).to_be_bytes()[1..]);
        cleartext.extend_from_slice(proof.kvnr.as_bytes());

        let iv = random_iv();
        let aes_key = derive_key(key.secret())?;
        let encrypted = AesGcm128::encrypt(&cleartext, &aes_key, &iv)?;

        Ok(Self {
            key_operator_id: key.operator_id(),
            key_version: key.version(),
            iv,
            ciphertext: copy(&encrypted.ciphertext, 0)?,
            authentication_tag: encrypted.authentication_tag,
        })
    }

    pub fn to_bytes(&self) -> [u8; PROOF_BINARY_SIZE] {
        let mut raw = [0u8; PROOF_BINARY_SIZE];
        let operator = (self.key_operator_id as u8).wrapping_sub(b'A') << 2;
        let version = (self.key_version as u8).wrapping_sub(b'0') & 0x03;
        raw[0] = VERSION_BIT | operator | version;
        raw[1..CIPHERTEXT_OFFSET].copy_from_slice(&self.iv);
        raw[CIPHERTEXT_OFFSET..TAG_OFFSET].copy_from_slice(&self.ciphertext);
        raw[TAG_OFFSET..].copy_from_slice(&self.authentication_tag);
        raw
    }

    pub fn serialize(&self) -> String {
        encode_proof(&self.to_bytes())
    }
}

/// Health card value: first five bytes of SHA-256(start || street) with the
/// top bit cleared
pub fn make_hcv(insurance_start: &str, street_address: &str) -> [u8; HCV_LENGTH] {
    let mut input = String::with_capacity(insurance_start.len() + street_address.len());
    input.push_str(insurance_start);
    input.push_str(street_address);
    let digest = sha256(input.as_bytes());

    let mut hcv = [0u8; HCV_LENGTH];
    hcv.copy_from_slice(&digest[..HCV_LENGTH]);
    hcv[0] &= !REVOKED_BIT;
    hcv
}
