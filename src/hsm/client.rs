//! HSM capability interface and session factory
//!
//! [`HsmClient`] is the seam between the transport code and a concrete HSM.
//! Two backends exist: a direct, hardware-backed client that is linked in by
//! the deployment, and the software [`MockHsmClient`](super::mock::MockHsmClient)
//! used for development and tests. The factory picks one at startup.

use super::blob::{EciesKeyStore, ErpBlob, TeeToken};
use super::mock::MockHsmClient;
use super::session::HsmSession;
use crate::crypto::SymmetricKey;
use crate::error::{Result, VauError};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Largest amount of random data a single HSM call may return
pub const MAX_RANDOM_BYTES: usize = 320;

/// HKDF info label of the VAU content key derivation
pub const ECIES_KEY_DERIVATION_INFO: &[u8] = b"ecies-vau-transport";
/// Length of the derived VAU content key
pub const ECIES_CONTENT_KEY_LENGTH: usize = 16;

/// Derive the AES-128 content key from the x coordinate of an ECDH result
pub fn derive_ecies_content_key(shared_x: &[u8]) -> Result<SymmetricKey> {
    let okm = crate::crypto::hkdf_sha256(
        shared_x,
        ECIES_KEY_DERIVATION_INFO,
        ECIES_CONTENT_KEY_LENGTH,
    )?;
    SymmetricKey::from_slice(&okm)
}

/// Which HSM implementation backs the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HsmBackend {
    /// A real HSM reached through an injected client
    Direct,
    /// Software simulation, no hardware required
    #[default]
    Simulated,
}

impl std::str::FromStr for HsmBackend {
    type Err = VauError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "hsm" => Ok(HsmBackend::Direct),
            "simulated" | "mock" => Ok(HsmBackend::Simulated),
            other => Err(VauError::Config(format!("unknown HSM backend '{}'", other))),
        }
    }
}

/// Connection handle of one HSM login
#[derive(Debug)]
pub struct RawSession {
    pub id: Uuid,
    pub device: String,
    pub connected: bool,
}

/// Operations an HSM backend must provide.
///
/// Implementations are shared between threads; per-connection state lives in
/// [`RawSession`].
pub trait HsmClient: Send + Sync {
    fn connect(&self) -> Result<RawSession>;

    fn reconnect(&self, session: &mut RawSession) -> Result<()>;

    fn disconnect(&self, session: &mut RawSession);

    /// ECDH between the ECIES key pair in `key_pair` and the client key,
    /// followed by HKDF-SHA256 to a 128 bit content key.
    ///
    /// `client_public_key` is an uncompressed SEC1 point. A point that does
    /// not belong to the key pair's curve yields
    /// [`VauError::EciesCurveMismatch`].
    fn vau_ecies128(
        &self,
        session: &RawSession,
        tee_token: &TeeToken,
        key_pair: &ErpBlob,
        client_public_key: &[u8],
    ) -> Result<SymmetricKey>;

    fn get_random_data(&self, session: &RawSession, count: usize) -> Result<Vec<u8>>;

    /// Run the attestation handshake and return a fresh TEE token
    fn issue_tee_token(&self, session: &RawSession) -> Result<TeeToken>;
}

/// Creates connected [`HsmSession`]s for one backend
pub struct HsmFactory {
    backend: HsmBackend,
    client: Arc<dyn HsmClient>,
    keys: Arc<EciesKeyStore>,
}

impl HsmFactory {
    pub fn new(backend: HsmBackend, client: Arc<dyn HsmClient>, keys: Arc<EciesKeyStore>) -> Self {
        Self {
            backend,
            client,
            keys,
        }
    }

    /// Select the backend by configuration.
    ///
    /// `Direct` needs a client supplied by the caller; `Simulated` builds a
    /// [`MockHsmClient`] with a freshly generated ECIES key pair.
    pub fn for_backend(
        backend: HsmBackend,
        device: &str,
        direct_client: Option<(Arc<dyn HsmClient>, Arc<EciesKeyStore>)>,
    ) -> Result<Self> {
        match (backend, direct_client) {
            (HsmBackend::Direct, Some((client, keys))) => {
                info!("using direct HSM backend");
                Ok(Self::new(backend, client, keys))
            }
            (HsmBackend::Direct, None) => Err(VauError::HsmUnavailable(
                "direct HSM backend selected but no HSM client is available".into(),
            )),
            (HsmBackend::Simulated, _) => {
                info!("using simulated HSM backend, device '{}'", device);
                let mock = Arc::new(MockHsmClient::new(device));
                let keys = Arc::new(EciesKeyStore::new(MockHsmClient::generate_ecies_key_pair(1)?));
                Ok(Self::new(backend, mock, keys))
            }
        }
    }

    pub fn backend(&self) -> HsmBackend {
        self.backend
    }

    pub fn client(&self) -> &Arc<dyn HsmClient> {
        &self.client
    }

    pub fn keys(&self) -> &Arc<EciesKeyStore> {
        &self.keys
    }

    /// Open a new session. The session carries no TEE token yet.
    pub fn connect(&self) -> Result<HsmSession> {
        let raw = self.client.connect()?;
        debug!("connected HSM session {} on '{}'", raw.id, raw.device);
        Ok(HsmSession::new(
            Arc::clone(&self.client),
            Arc::clone(&self.keys),
            raw,
        ))
    }
}
