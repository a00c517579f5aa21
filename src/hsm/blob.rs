//! Opaque HSM blobs: TEE tokens and ECIES key pairs

use log::info;
use parking_lot::RwLock;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// An opaque blob issued by the HSM together with its key generation
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ErpBlob {
    pub data: Vec<u8>,
    pub generation: u32,
}

impl ErpBlob {
    pub fn new(data: Vec<u8>, generation: u32) -> Self {
        Self { data, generation }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for ErpBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ErpBlob {{ size: {}, generation: {} }}",
            self.data.len(),
            self.generation
        )
    }
}

/// Authorisation token required on authorised HSM calls.
///
/// An empty token means "none installed yet".
pub type TeeToken = ErpBlob;

/// The ECIES key pairs known to the HSM: the current generation and,
/// during a key rotation, the previous one.
#[derive(Debug, Clone)]
pub struct EciesKeyBlobs {
    pub latest: ErpBlob,
    pub fallback: Option<ErpBlob>,
}

/// Shared, rotatable storage of the ECIES key blobs
pub struct EciesKeyStore {
    keys: RwLock<EciesKeyBlobs>,
}

impl EciesKeyStore {
    pub fn new(latest: ErpBlob) -> Self {
        Self {
            keys: RwLock::new(EciesKeyBlobs {
                latest,
                fallback: None,
            }),
        }
    }

    pub fn with_fallback(latest: ErpBlob, fallback: ErpBlob) -> Self {
        Self {
            keys: RwLock::new(EciesKeyBlobs {
                latest,
                fallback: Some(fallback),
            }),
        }
    }

    pub fn keys(&self) -> EciesKeyBlobs {
        self.keys.read().clone()
    }

    /// Install a new key generation; the previous latest becomes the fallback
    pub fn rotate(&self, next: ErpBlob) {
        let mut keys = self.keys.write();
        let previous = std::mem::replace(&mut keys.latest, next);
        info!(
            "rotated ECIES key: generation {} -> {}",
            previous.generation,
            keys.latest.generation
        );
        keys.fallback = Some(previous);
    }
}
