//! VSDM presence proofs ("Prüfziffer")
//!
//! A pharmacy proves that an insurance card was present by submitting a
//! 64 character base64 proof (47 raw bytes). Two versions exist:
//!
//! - **proof_v1**: plain payload with a truncated HMAC-SHA256
//! - **proof_v2**: AES-128-GCM encrypted payload with a health card value
//! - **validator**: key lookup and policy checks on decoded proofs
//!
//! The version is told apart by the first decoded byte: an uppercase ASCII
//! letter for v1, a set high bit for v2.

pub mod proof_v1;
pub mod proof_v2;
pub mod validator;

pub use proof_v1::VsdmProofV1;
pub use proof_v2::{make_hcv, DecryptedProof, VsdmProofV2, HCV_LENGTH, IAT_EPOCH_OFFSET};
pub use validator::{ProofValidator, ValidatedProof, VsdmKeyRing};

use crate::error::{Result, VauError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use zeroize::Zeroizing;

/// Decoded size of every proof
pub const PROOF_BINARY_SIZE: usize = 47;
/// Encoded size of every proof
pub const PROOF_BASE64_SIZE: usize = 64;

/// Per-operator VSDM key. The secret is the HMAC key for v1 and the HKDF
/// input for v2.
#[derive(Clone)]
pub struct VsdmKey {
    operator_id: char,
    version: char,
    secret: Zeroizing<Vec<u8>>,
}

impl VsdmKey {
    pub fn new(operator_id: char, version: char, secret: Vec<u8>) -> Result<Self> {
        if !operator_id.is_ascii_uppercase() {
            return Err(VauError::Protocol(format!(
                "VSDM operator id '{}' not in A..Z",
                operator_id
            )));
        }
        if !('0'..='3').contains(&version) {
            return Err(VauError::Protocol(format!(
                "VSDM key version '{}' not in 0..3",
                version
            )));
        }
        if secret.is_empty() {
            return Err(VauError::Protocol("VSDM key secret is empty".into()));
        }
        Ok(Self {
            operator_id,
            version,
            secret: Zeroizing::new(secret),
        })
    }

    /// Key with a base64 encoded secret, as delivered by key enrolment
    pub fn from_base64(operator_id: char, version: char, secret: &str) -> Result<Self> {
        let secret = STANDARD
            .decode(secret.trim())
            .map_err(|_| VauError::Protocol("VSDM key secret is not base64".into()))?;
        Self::new(operator_id, version, secret)
    }

    pub fn operator_id(&self) -> char {
        self.operator_id
    }

    pub fn version(&self) -> char {
        self.version
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for VsdmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VsdmKey {{ operator_id: {}, version: {}, secret: <redacted> }}",
            self.operator_id, self.version
        )
    }
}

/// A decoded proof of either version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VsdmProof {
    V1(VsdmProofV1),
    V2(VsdmProofV2),
}

impl VsdmProof {
    pub fn from_base64(encoded: &str) -> Result<Self> {
        Self::deserialize(&decode_proof(encoded)?)
    }

    /// Dispatch on the first byte
    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        match raw.first() {
            Some(b) if b.is_ascii_uppercase() => Ok(VsdmProof::V1(VsdmProofV1::deserialize(raw)?)),
            Some(b) if b & 0x80 != 0 => Ok(VsdmProof::V2(VsdmProofV2::deserialize(raw)?)),
            Some(b) => Err(VauError::Forbidden(format!(
                "unknown VSDM proof version byte 0x{:02x}",
                b
            ))),
            None => Err(VauError::Forbidden("empty VSDM proof".into())),
        }
    }

    pub fn key_operator_id(&self) -> char {
        match self {
            VsdmProof::V1(p) => p.key_operator_id(),
            VsdmProof::V2(p) => p.key_operator_id(),
        }
    }

    pub fn key_version(&self) -> char {
        match self {
            VsdmProof::V1(p) => p.key_version(),
            VsdmProof::V2(p) => p.key_version(),
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            VsdmProof::V1(p) => p.serialize(),
            VsdmProof::V2(p) => p.serialize(),
        }
    }
}

pub(crate) fn decode_proof(encoded: &str) -> Result<Vec<u8>> {
    if encoded.len() != PROOF_BASE64_SIZE {
        return Err(VauError::Forbidden(format!(
            "VSDM proof has {} characters, expected {}",
            encoded.len(),
            PROOF_BASE64_SIZE
        )));
    }
    STANDARD
        .decode(encoded)
        .map_err(|_| VauError::Forbidden("VSDM proof is not valid base64".into()))
}

pub(crate) fn encode_proof(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}
