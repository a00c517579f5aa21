//! Symmetric crypto primitives
//!
//! - **aes_gcm**: AES-GCM with explicit key/IV/tag, 128 and 256 bit keys
//! - **kdf**: HKDF-SHA256, SHA-256 and HMAC-SHA256 helpers

pub mod aes_gcm;
pub mod kdf;

pub use self::aes_gcm::{
    random_iv, AesGcm, AesGcm128, AesGcm256, EncryptionResult, SymmetricKey, IV_LENGTH,
    TAG_LENGTH,
};
pub use kdf::{hkdf_sha256, hmac_sha256, sha256};
