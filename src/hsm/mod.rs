//! HSM Layer — sessions, pooling and TEE token maintenance
//!
//! - **blob**: opaque TEE tokens and ECIES key pair blobs
//! - **client**: backend capability trait and session factory
//! - **mock**: software HSM for development and tests
//! - **session**: one connection with reconnect-and-retry semantics
//! - **pool**: bounded session pool with keep-alive
//! - **token_updater**: periodic TEE token refresh and health

pub mod blob;
pub mod client;
pub mod mock;
pub mod pool;
pub mod session;
pub mod token_updater;

pub use blob::{EciesKeyBlobs, EciesKeyStore, ErpBlob, TeeToken};
pub use client::{
    derive_ecies_content_key, HsmBackend, HsmClient, HsmFactory, RawSession,
    ECIES_CONTENT_KEY_LENGTH, ECIES_KEY_DERIVATION_INFO, MAX_RANDOM_BYTES,
};
pub use mock::MockHsmClient;
pub use pool::{HsmSessionPool, PoolConfig, PoolSession};
pub use session::HsmSession;
pub use token_updater::{hsm_token_provider, TeeTokenUpdater, TokenProvider, TokenSink, UpdaterPhase};
