//! Policy checks on VSDM proofs

use super::{DecryptedProof, VsdmKey, VsdmProof, VsdmProofV1, HCV_LENGTH};
use crate::error::{Result, VauError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// VSDM keys by operator id and key version
#[derive(Debug, Default, Clone)]
pub struct VsdmKeyRing {
    keys: HashMap<(char, char), VsdmKey>,
}

impl VsdmKeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, replacing one with the same operator and version
    pub fn insert(&mut self, key: VsdmKey) {
        info!(
            "registered VSDM key for operator {} version {}",
            key.operator_id(),
            key.version()
        );
        self.keys.insert((key.operator_id(), key.version()), key);
    }

    pub fn get(&self, operator_id: char, version: char) -> Result<&VsdmKey> {
        self.keys.get(&(operator_id, version)).ok_or_else(|| {
            VauError::Forbidden(format!(
                "no VSDM key for operator {} version {}",
                operator_id, version
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A proof that passed all checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedProof {
    pub version: u8,
    pub kvnr: String,
    pub timestamp: DateTime<Utc>,
}

/// Validates proofs against keys and a validity window
#[derive(Debug, Clone)]
pub struct ProofValidator {
    validity: chrono::Duration,
}

impl ProofValidator {
    pub fn new(validity: Duration) -> Result<Self> {
        let validity = chrono::Duration::from_std(validity)
            .map_err(|e| VauError::Config(format!("proof validity out of range: {}", e)))?;
        Ok(Self { validity })
    }

    /// Decode and check a base64 proof. For v2 proofs the health card value
    /// is compared when `expected_hcv` is given.
    pub fn validate(
        &self,
        encoded: &str,
        keys: &VsdmKeyRing,
        expected_hcv: Option<&[u8; HCV_LENGTH]>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedProof> {
        let proof = VsdmProof::from_base64(encoded)?;
        let key = keys.get(proof.key_operator_id(), proof.key_version())?;
        let result = match &proof {
            VsdmProof::V1(p) => self.validate_v1(p, key, now),
            VsdmProof::V2(p) => {
                let decrypted = p.decrypt(key.secret())?;
                self.validate_v2(&decrypted, expected_hcv, now)
            }
        };
        if let Err(e) = &result {
            warn!(
                "rejected VSDM proof of operator {}: {}",
                proof.key_operator_id(),
                e
            );
        }
        result
    }

    pub fn validate_v1(
        &self,
        proof: &VsdmProofV1,
        key: &VsdmKey,
        now: DateTime<Utc>,
    ) -> Result<ValidatedProof> {
        proof.verify_hmac(key)?;
        let timestamp = proof.timestamp()?;
        self.check_timestamp(timestamp, now)?;
        Ok(ValidatedProof {
            version: 1,
            kvnr: proof.kvnr()?.to_string(),
            timestamp,
        })
    }

    pub fn validate_v2(
        &self,
        proof: &DecryptedProof,
        expected_hcv: Option<&[u8; HCV_LENGTH]>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedProof> {
        if proof.revoked {
            return Err(VauError::Forbidden("health card is revoked".into()));
        }
        self.check_timestamp(proof.iat, now)?;
        if let Some(expected) = expected_hcv {
            if &proof.hcv != expected {
                return Err(VauError::Forbidden("health card value mismatch".into()));
            }
        }
        Ok(ValidatedProof {
            version: 2,
            kvnr: proof.kvnr.clone(),
            timestamp: proof.iat,
        })
    }

    /// The proof must not be older than the validity window, nor lie further
    /// in the future than that.
    fn check_timestamp(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let age = now.signed_duration_since(timestamp);
        if age > self.validity {
            return Err(VauError::Forbidden(format!(
                "VSDM proof expired, issued {}",
                timestamp.to_rfc3339()
            )));
        }
        if -age > self.validity {
            return Err(VauError::Forbidden(format!(
                "VSDM proof issued in the future: {}",
                timestamp.to_rfc3339()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsdm::{make_hcv, VsdmProofV2, IAT_EPOCH_OFFSET};
    use chrono::TimeZone;

    fn ring() -> VsdmKeyRing {
        let mut ring = VsdmKeyRing::new();
        ring.insert(VsdmKey::new('A', '1', vec![1; 32]).unwrap());
        ring.insert(VsdmKey::new('B', '0', vec![2; 32]).unwrap());
        ring
    }

    fn validator() -> ProofValidator {
        ProofValidator::new(Duration::from_secs(1800)).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(IAT_EPOCH_OFFSET + 8 * 100_000, 0).unwrap()
    }

    fn v2(revoked: bool, iat: DateTime<Utc>) -> String {
        let keys = ring();
        let proof = DecryptedProof {
            revoked,
            hcv: make_hcv("20240101", "Musterweg 5"),
            iat,
            kvnr: "K987654321".into(),
        };
        VsdmProofV2::encrypt(keys.get('B', '0').unwrap(), &proof)
            .unwrap()
            .serialize()
    }

    #[test]
    fn test_valid_v1() {
        let keys = ring();
        let proof = VsdmProofV1::sign(keys.get('A', '1').unwrap(), "K987654321", now(), b'U').unwrap();
        let validated = validator()
            .validate(&proof.serialize(), &keys, None, now())
            .unwrap();
        assert_eq!(validated.version, 1);
        assert_eq!(validated.kvnr, "K987654321");
    }

    #[test]
    fn test_v1_expired_and_future() {
        let keys = ring();
        let key = keys.get('A', '1').unwrap();
        let old = VsdmProofV1::sign(key, "K987654321", now() - chrono::Duration::seconds(1801), b'U')
            .unwrap();
        let err = validator()
            .validate(&old.serialize(), &keys, None, now())
            .unwrap_err();
        assert!(matches!(err, VauError::Forbidden(_)));

        let future = VsdmProofV1::sign(key, "K987654321", now() + chrono::Duration::hours(2), b'U')
            .unwrap();
        assert!(validator()
            .validate(&future.serialize(), &keys, None, now())
            .is_err());
    }

    #[test]
    fn test_unknown_key_is_forbidden() {
        let other = VsdmKey::new('C', '1', vec![3; 32]).unwrap();
        let proof = VsdmProofV1::sign(&other, "K987654321", now(), b'U').unwrap();
        let err = validator()
            .validate(&proof.serialize(), &ring(), None, now())
            .unwrap_err();
        assert_eq!(err.status(), crate::error::HttpStatus::Forbidden);
    }

    #[test]
    fn test_valid_v2_with_hcv() {
        let hcv = make_hcv("20240101", "Musterweg 5");
        let validated = validator()
            .validate(&v2(false, now()), &ring(), Some(&hcv), now())
            .unwrap();
        assert_eq!(validated.version, 2);
        assert_eq!(validated.timestamp, now());
    }

    #[test]
    fn test_v2_hcv_mismatch() {
        let hcv = make_hcv("20240101", "Musterweg 6");
        let err = validator()
            .validate(&v2(false, now()), &ring(), Some(&hcv), now())
            .unwrap_err();
        assert!(matches!(err, VauError::Forbidden(_)));
    }

    #[test]
    fn test_v2_revoked() {
        let err = validator()
            .validate(&v2(true, now()), &ring(), None, now())
            .unwrap_err();
        assert!(matches!(err, VauError::Forbidden(_)));
    }

    #[test]
    fn test_v2_expired() {
        let old = now() - chrono::Duration::seconds(3600);
        assert!(validator().validate(&v2(false, old), &ring(), None, now()).is_err());
    }

    #[test]
    fn test_key_ring_replace() {
        let mut keys = ring();
        assert_eq!(keys.len(), 2);
        keys.insert(VsdmKey::new('A', '1', vec![9; 32]).unwrap());
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.get('A', '1').unwrap().secret(), &[9u8; 32]);
    }
}
