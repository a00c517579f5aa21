//! One logged-in HSM connection with guarded, retrying calls

use super::blob::{EciesKeyStore, TeeToken};
use super::client::{HsmClient, RawSession};
use crate::crypto::SymmetricKey;
use crate::error::{Result, VauError};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How often a failed call is retried after a reconnect
const MAX_RETRY_COUNT: usize = 1;

/// A connected HSM session.
///
/// Owned by exactly one user at a time, normally through a
/// [`PoolSession`](super::pool::PoolSession). Disconnects on drop.
pub struct HsmSession {
    client: Arc<dyn HsmClient>,
    keys: Arc<EciesKeyStore>,
    raw: RawSession,
    tee_token: TeeToken,
    last_call: Option<Instant>,
    broken: bool,
}

impl HsmSession {
    pub(crate) fn new(client: Arc<dyn HsmClient>, keys: Arc<EciesKeyStore>, raw: RawSession) -> Self {
        Self {
            client,
            keys,
            raw,
            tee_token: TeeToken::default(),
            last_call: None,
            broken: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.raw.id
    }

    pub fn tee_token(&self) -> &TeeToken {
        &self.tee_token
    }

    pub fn set_tee_token(&mut self, token: TeeToken) {
        self.tee_token = token;
    }

    /// Time of the last HSM call, `None` before the first one
    pub fn last_call(&self) -> Option<Instant> {
        self.last_call
    }

    /// Set when retries were exhausted; a broken session must not be reused
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn reconnect(&mut self) -> Result<()> {
        info!("reconnecting HSM session {}", self.raw.id);
        self.client.reconnect(&mut self.raw)?;
        self.broken = false;
        Ok(())
    }

    /// Derive the VAU content key for `client_public_key`.
    ///
    /// Uses the latest ECIES key pair, or the previous generation when
    /// `use_fallback` is set. A curve mismatch on the latest key is retried
    /// once with the fallback key.
    pub fn vau_ecies128(&mut self, client_public_key: &[u8], use_fallback: bool) -> Result<SymmetricKey> {
        let keys = self.keys.keys();
        let key_pair = if use_fallback {
            keys.fallback.ok_or_else(|| {
                VauError::Internal("no fallback ECIES key pair available".into())
            })?
        } else {
            keys.latest
        };

        let result = self.guarded(|client, raw, token| {
            client.vau_ecies128(raw, token, &key_pair, client_public_key)
        });

        match result {
            Err(VauError::EciesCurveMismatch) if !use_fallback => {
                warn!(
                    "ECIES curve mismatch with key generation {}, trying fallback key",
                    key_pair.generation
                );
                self.vau_ecies128(client_public_key, true)
            }
            other => other,
        }
    }

    pub fn get_random_data(&mut self, count: usize) -> Result<Vec<u8>> {
        self.guarded(|client, raw, _| client.get_random_data(raw, count))
    }

    /// Ask the HSM for a fresh TEE token over this session
    pub fn issue_tee_token(&mut self) -> Result<TeeToken> {
        self.guarded(|client, raw, _| client.issue_tee_token(raw))
    }

    /// True if no call went to the HSM within `max_idle`
    pub fn is_idle_longer_than(&self, max_idle: Duration) -> bool {
        self.last_call
            .map_or(true, |last| last.elapsed() > max_idle)
    }

    /// Issue a no-op call if the last call is older than `max_idle`
    pub fn keep_alive(&mut self, max_idle: Duration) -> Result<()> {
        if self.is_idle_longer_than(max_idle) {
            debug!("keeping HSM session {} alive", self.raw.id);
            self.get_random_data(1)?;
        }
        Ok(())
    }

    /// Run `action` against the HSM. Expired or unreachable sessions are
    /// reconnected and the call retried; other errors return immediately.
    fn guarded<T>(
        &mut self,
        mut action: impl FnMut(&dyn HsmClient, &RawSession, &TeeToken) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            self.last_call = Some(Instant::now());
            let error = match action(self.client.as_ref(), &self.raw, &self.tee_token) {
                Ok(value) => return Ok(value),
                Err(error) if error.is_hsm_fault() => error,
                Err(error) => return Err(error),
            };

            if attempt >= MAX_RETRY_COUNT {
                error!(
                    "HSM call on session {} failed after {} retries: {}",
                    self.raw.id,
                    attempt,
                    error
                );
                self.broken = true;
                return Err(error);
            }
            attempt += 1;

            warn!("HSM call on session {} failed, reconnecting: {}", self.raw.id, error);
            if let Err(reconnect_error) = self.reconnect() {
                error!(
                    "reconnect of HSM session {} failed: {}",
                    self.raw.id,
                    reconnect_error
                );
                self.broken = true;
                return Err(reconnect_error);
            }
        }
    }
}

impl Drop for HsmSession {
    fn drop(&mut self) {
        self.client.disconnect(&mut self.raw);
    }
}

impl std::fmt::Debug for HsmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmSession")
            .field("id", &self.raw.id)
            .field("tee_token", &self.tee_token)
            .field("broken", &self.broken)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::blob::ErpBlob;
    use crate::hsm::client::{HsmBackend, HsmFactory};
    use crate::hsm::mock::MockHsmClient;

    fn setup(with_fallback: bool) -> (Arc<MockHsmClient>, HsmFactory, Vec<u8>) {
        let mock = Arc::new(MockHsmClient::new("sim"));
        let latest = MockHsmClient::generate_ecies_key_pair(2).unwrap();
        let public = MockHsmClient::public_key_of(&latest).unwrap();
        let keys = if with_fallback {
            let fallback = MockHsmClient::generate_ecies_key_pair(1).unwrap();
            EciesKeyStore::with_fallback(latest, fallback)
        } else {
            EciesKeyStore::new(latest)
        };
        let factory = HsmFactory::new(HsmBackend::Simulated, mock.clone(), Arc::new(keys));
        (mock, factory, public)
    }

    fn session_with_token(factory: &HsmFactory) -> HsmSession {
        let mut session = factory.connect().unwrap();
        let token = session.issue_tee_token().unwrap();
        session.set_tee_token(token);
        session
    }

    #[test]
    fn test_expired_session_is_reconnected_once() {
        let (mock, factory, _) = setup(false);
        let mut session = factory.connect().unwrap();

        mock.expire_next_calls(1);
        assert_eq!(session.get_random_data(4).unwrap().len(), 4);
        assert_eq!(mock.reconnect_count(), 1);
        assert!(!session.is_broken());
    }

    #[test]
    fn test_retries_are_bounded() {
        let (mock, factory, _) = setup(false);
        let mut session = factory.connect().unwrap();

        mock.expire_next_calls(2);
        let err = session.get_random_data(4).unwrap_err();
        assert!(matches!(err, VauError::HsmSessionExpired(_)));
        assert_eq!(mock.reconnect_count(), 1);
        assert!(session.is_broken());
    }

    #[test]
    fn test_failed_reconnect_breaks_session() {
        let (mock, factory, _) = setup(false);
        let mut session = factory.connect().unwrap();

        mock.expire_next_calls(1);
        mock.fail_next_connects(1);
        assert!(session.get_random_data(1).is_err());
        assert!(session.is_broken());
    }

    #[test]
    fn test_curve_mismatch_uses_fallback_key() {
        let (mock, factory, _) = setup(true);
        let mut session = session_with_token(&factory);
        let fallback = factory.keys().keys().fallback.unwrap();
        let fallback_public = MockHsmClient::public_key_of(&fallback).unwrap();

        mock.mismatch_curve_for_generation(2);
        let key = session.vau_ecies128(&fallback_public, false).unwrap();
        assert_eq!(key.len(), 16);
        assert_eq!(mock.ecies_calls(), 2);
        assert_eq!(mock.reconnect_count(), 0);
    }

    #[test]
    fn test_curve_mismatch_without_fallback_fails_internally() {
        let (mock, factory, public) = setup(false);
        let mut session = session_with_token(&factory);

        mock.mismatch_curve_for_generation(2);
        let err = session.vau_ecies128(&public, false).unwrap_err();
        assert!(matches!(err, VauError::Internal(_)));
    }

    #[test]
    fn test_keep_alive_only_when_stale() {
        let (mock, factory, _) = setup(false);
        let mut session = factory.connect().unwrap();

        session.keep_alive(Duration::from_secs(60)).unwrap();
        assert_eq!(mock.random_calls(), 1);

        session.keep_alive(Duration::from_secs(60)).unwrap();
        assert_eq!(mock.random_calls(), 1);

        std::thread::sleep(Duration::from_millis(5));
        session.keep_alive(Duration::from_millis(1)).unwrap();
        assert_eq!(mock.random_calls(), 2);
    }

    #[test]
    fn test_drop_disconnects() {
        let (mock, factory, _) = setup(false);
        let session = factory.connect().unwrap();
        drop(session);
        assert_eq!(mock.disconnect_count(), 1);
    }

    #[test]
    fn test_token_is_per_session() {
        let (_, factory, _) = setup(false);
        let mut a = factory.connect().unwrap();
        let b = factory.connect().unwrap();
        a.set_tee_token(ErpBlob::new(vec![1, 2, 3], 9));
        assert_eq!(a.tee_token().generation, 9);
        assert!(b.tee_token().is_empty());
    }
}
