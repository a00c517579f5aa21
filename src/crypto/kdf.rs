//! Hash, HMAC and HKDF helpers

use crate::error::{Result, VauError};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// HKDF-SHA256 without salt, as used for every key derivation in this crate
pub fn hkdf_sha256(shared_secret: &[u8], info: &[u8], length: usize) -> Result<Zeroizing<Vec<u8>>> {
    if length == 0 {
        return Err(VauError::Internal("HKDF output length must not be zero".into()));
    }
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|_| VauError::Internal("HKDF key derivation failed".into()))?;
    Ok(okm)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| VauError::Internal("invalid HMAC key".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
