//! Software HSM for development and tests
//!
//! ECIES key pairs are P-256 private scalars stored in plain blobs. TEE tokens
//! are random bytes behind a fixed prefix. Fault injection counters let tests
//! simulate connect failures, expired sessions and curve mismatches.

use super::blob::{ErpBlob, TeeToken};
use super::client::{derive_ecies_content_key, HsmClient, RawSession, MAX_RANDOM_BYTES};
use crate::crypto::SymmetricKey;
use crate::error::{Result, VauError};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use uuid::Uuid;

const TOKEN_PREFIX: &[u8] = b"mock-tee-token:";

/// Simulated HSM
#[derive(Debug, Default)]
pub struct MockHsmClient {
    device: String,
    token_generation: AtomicU32,

    connect_count: AtomicUsize,
    reconnect_count: AtomicUsize,
    disconnect_count: AtomicUsize,
    random_calls: AtomicUsize,
    ecies_calls: AtomicUsize,

    failing_connects: AtomicU32,
    expiring_calls: AtomicU32,
    failing_token_issues: AtomicU32,
    mismatched_generation: AtomicU32,
}

/// Take one unit from a fault counter, true if a fault should fire
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockHsmClient {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            ..Self::default()
        }
    }

    /// New ECIES key pair blob of the given generation
    pub fn generate_ecies_key_pair(generation: u32) -> Result<ErpBlob> {
        let secret = SecretKey::random(&mut OsRng);
        Ok(ErpBlob::new(secret.to_bytes().to_vec(), generation))
    }

    /// Uncompressed SEC1 public key of a key pair blob
    pub fn public_key_of(key_pair: &ErpBlob) -> Result<Vec<u8>> {
        let secret = Self::secret_of(key_pair)?;
        Ok(secret.public_key().to_encoded_point(false).as_bytes().to_vec())
    }

    fn secret_of(key_pair: &ErpBlob) -> Result<SecretKey> {
        SecretKey::from_slice(&key_pair.data)
            .map_err(|_| VauError::Internal("ECIES key pair blob is corrupt".into()))
    }

    /// Let the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Let the next `count` session calls fail as if the HSM dropped the session
    pub fn expire_next_calls(&self, count: u32) {
        self.expiring_calls.store(count, Ordering::SeqCst);
    }

    /// Let the next `count` token issues fail
    pub fn fail_next_token_issues(&self, count: u32) {
        self.failing_token_issues.store(count, Ordering::SeqCst);
    }

    /// Report a curve mismatch for key pairs of this generation (0 disables)
    pub fn mismatch_curve_for_generation(&self, generation: u32) {
        self.mismatched_generation.store(generation, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnect_count.load(Ordering::SeqCst)
    }

    pub fn random_calls(&self) -> usize {
        self.random_calls.load(Ordering::SeqCst)
    }

    pub fn ecies_calls(&self) -> usize {
        self.ecies_calls.load(Ordering::SeqCst)
    }

    fn check_session(&self, session: &RawSession) -> Result<()> {
        if !session.connected {
            return Err(VauError::HsmSessionExpired(format!(
                "session {} is not connected",
                session.id
            )));
        }
        if take_fault(&self.expiring_calls) {
            return Err(VauError::HsmSessionExpired(format!(
                "session {} was closed by the HSM",
                session.id
            )));
        }
        Ok(())
    }

    fn check_token(tee_token: &TeeToken) -> Result<()> {
        if tee_token.data.len() <= TOKEN_PREFIX.len() || !tee_token.data.starts_with(TOKEN_PREFIX) {
            return Err(VauError::HsmUnavailable("TEE token missing or invalid".into()));
        }
        Ok(())
    }
}

impl HsmClient for MockHsmClient {
    fn connect(&self) -> Result<RawSession> {
        if take_fault(&self.failing_connects) {
            return Err(VauError::HsmUnavailable(format!(
                "can't connect to '{}'",
                self.device
            )));
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(RawSession {
            id: Uuid::new_v4(),
            device: self.device.clone(),
            connected: true,
        })
    }

    fn reconnect(&self, session: &mut RawSession) -> Result<()> {
        if take_fault(&self.failing_connects) {
            session.connected = false;
            return Err(VauError::HsmUnavailable(format!(
                "can't reconnect to '{}'",
                self.device
            )));
        }
        self.reconnect_count.fetch_add(1, Ordering::SeqCst);
        session.connected = true;
        Ok(())
    }

    fn disconnect(&self, session: &mut RawSession) {
        if session.connected {
            session.connected = false;
            self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn vau_ecies128(
        &self,
        session: &RawSession,
        tee_token: &TeeToken,
        key_pair: &ErpBlob,
        client_public_key: &[u8],
    ) -> Result<SymmetricKey> {
        self.check_session(session)?;
        Self::check_token(tee_token)?;
        self.ecies_calls.fetch_add(1, Ordering::SeqCst);

        let mismatched = self.mismatched_generation.load(Ordering::SeqCst);
        if mismatched != 0 && mismatched == key_pair.generation {
            return Err(VauError::EciesCurveMismatch);
        }

        let secret = Self::secret_of(key_pair)?;
        let peer =
            PublicKey::from_sec1_bytes(client_public_key).map_err(|_| VauError::EciesCurveMismatch)?;
        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        derive_ecies_content_key(shared.raw_secret_bytes().as_slice())
    }

    fn get_random_data(&self, session: &RawSession, count: usize) -> Result<Vec<u8>> {
        self.check_session(session)?;
        if count > MAX_RANDOM_BYTES {
            return Err(VauError::Internal(format!(
                "requested {} random bytes, at most {} allowed",
                count, MAX_RANDOM_BYTES
            )));
        }
        self.random_calls.fetch_add(1, Ordering::SeqCst);
        let mut data = vec![0u8; count];
        OsRng.fill_bytes(&mut data);
        Ok(data)
    }

    fn issue_tee_token(&self, session: &RawSession) -> Result<TeeToken> {
        self.check_session(session)?;
        if take_fault(&self.failing_token_issues) {
            return Err(VauError::HsmUnavailable("attestation handshake failed".into()));
        }
        let generation = self.token_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut data = TOKEN_PREFIX.to_vec();
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        data.extend_from_slice(&nonce);
        Ok(TeeToken::new(data, generation))
    }
}
