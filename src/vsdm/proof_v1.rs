//! VSDM proof version 1
//!
//! ```text
//! 0..10   KVNR (insurance holder id, ASCII)
//! 10..20  unix timestamp, 10 ASCII digits
//! 20      result code
//! 21      key operator id ('A'..'Z')
//! 22      key version ('0'..'3')
//! 23..47  HMAC-SHA256 over bytes 0..23, truncated to 24 bytes
//! ```

use super::{encode_proof, VsdmKey, PROOF_BINARY_SIZE};
use crate::crypto::hmac_sha256;
use crate::error::{Result, VauError};
use chrono::{DateTime, TimeZone, Utc};
use subtle::ConstantTimeEq;

pub const KVNR_LENGTH: usize = 10;
const TIMESTAMP_OFFSET: usize = 10;
const TIMESTAMP_LENGTH: usize = 10;
const RESULT_CODE_OFFSET: usize = 20;
const OPERATOR_OFFSET: usize = 21;
const VERSION_OFFSET: usize = 22;
/// Bytes covered by the HMAC
pub const SIGNED_LENGTH: usize = 23;
/// Length of the truncated HMAC
pub const HMAC_LENGTH: usize = PROOF_BINARY_SIZE - SIGNED_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsdmProofV1 {
    raw: [u8; PROOF_BINARY_SIZE],
}

impl VsdmProofV1 {
    /// Only the length is checked here; see [`VsdmProofV1::verify_hmac`]
    /// and [`VsdmProofV1::timestamp`] for content checks.
    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        let raw: [u8; PROOF_BINARY_SIZE] = raw.try_into().map_err(|_| {
            VauError::Forbidden(format!(
                "VSDM proof has {} bytes, expected {}",
                raw.len(),
                PROOF_BINARY_SIZE
            ))
        })?;
        Ok(Self { raw })
    }

    /// Build and sign a proof
    pub fn sign(key: &VsdmKey, kvnr: &str, timestamp: DateTime<Utc>, result_code: u8) -> Result<Self> {
        if kvnr.len() != KVNR_LENGTH
            || !kvnr.is_ascii()
            || !kvnr.as_bytes()[0].is_ascii_uppercase()
        {
            return Err(VauError::Protocol(format!("invalid KVNR '{}'", kvnr)));
        }
        let seconds = timestamp.timestamp();
        if !(0..10_000_000_000).contains(&seconds) {
            return Err(VauError::Protocol("timestamp does not fit 10 digits".into()));
        }

        let mut raw = [0u8; PROOF_BINARY_SIZE];
        raw[..KVNR_LENGTH].copy_from_slice(kvnr.as_bytes());
        raw[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_LENGTH]
            .copy_from_slice(format!("{:010}", seconds).as_bytes());
        raw[RESULT_CODE_OFFSET] = result_code;
        raw[OPERATOR_OFFSET] = key.operator_id() as u8;
        raw[VERSION_OFFSET] = key.version() as u8;

        let mac = hmac_sha256(key.secret(), &raw[..SIGNED_LENGTH])?;
        raw[SIGNED_LENGTH..].copy_from_slice(&mac[..HMAC_LENGTH]);
        Ok(Self { raw })
    }

    pub fn kvnr(&self) -> Result<&str> {
        std::str::from_utf8(&self.raw[..KVNR_LENGTH])
            .map_err(|_| VauError::Forbidden("KVNR in VSDM proof is not ASCII".into()))
    }

    pub fn result_code(&self) -> u8 {
        self.raw[RESULT_CODE_OFFSET]
    }

    pub fn key_operator_id(&self) -> char {
        self.raw[OPERATOR_OFFSET] as char
    }

    pub fn key_version(&self) -> char {
        self.raw[VERSION_OFFSET] as char
    }

    pub fn signed_data(&self) -> &[u8] {
        &self.raw[..SIGNED_LENGTH]
    }

    pub fn truncated_hmac(&self) -> &[u8] {
        &self.raw[SIGNED_LENGTH..]
    }

    /// The embedded timestamp
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        let digits = &self.raw[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + TIMESTAMP_LENGTH];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(VauError::Forbidden("VSDM proof timestamp is not numeric".into()));
        }
        let seconds: i64 = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| VauError::Forbidden("VSDM proof timestamp is not numeric".into()))?;
        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| VauError::Forbidden("VSDM proof timestamp out of range".into()))
    }

    /// Compare the truncated HMAC in constant time
    pub fn verify_hmac(&self, key: &VsdmKey) -> Result<()> {
        let mac = hmac_sha256(key.secret(), self.signed_data())?;
        if bool::from(mac[..HMAC_LENGTH].ct_eq(self.truncated_hmac())) {
            Ok(())
        } else {
            Err(VauError::Forbidden("VSDM proof HMAC mismatch".into()))
        }
    }

    pub fn to_bytes(&self) -> [u8; PROOF_BINARY_SIZE] {
        self.raw
    }

    pub fn serialize(&self) -> String {
        encode_proof(&self.raw)
    }
}
