//! AES-GCM engine with explicit key, IV and authentication tag
//!
//! Ciphertext and tag are handled separately because every wire format in
//! this crate places the IV, ciphertext and tag at fixed positions of its own.
//! The engine has no state; concurrent use with independent arguments is safe.

use crate::error::{Result, VauError};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce, Tag};
use std::fmt;
use std::marker::PhantomData;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the GCM initialisation vector in bytes
pub const IV_LENGTH: usize = 12;
/// Length of the GCM authentication tag in bytes
pub const TAG_LENGTH: usize = 16;

/// Secret key material for AES-GCM. Zeroed on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(Vec<u8>);

impl SymmetricKey {
    /// Wrap raw key bytes; only 128 and 256 bit keys are accepted
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != Bits128::KEY_LENGTH && bytes.len() != Bits256::KEY_LENGTH {
            let len = bytes.len();
            let mut bytes = bytes;
            bytes.zeroize();
            return Err(VauError::Aead(format!("invalid key length {}", len)));
        }
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::new(bytes.to_vec())
    }

    /// Fresh random key of the given length
    pub fn generate(length: usize) -> Result<Self> {
        let mut bytes = vec![0u8; length];
        rand::Rng::fill(&mut rand::thread_rng(), bytes.as_mut_slice());
        Self::new(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({} bytes, redacted)", self.0.len())
    }
}

/// Output of an encryption: ciphertext of plaintext length plus the tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionResult {
    pub ciphertext: Vec<u8>,
    pub authentication_tag: [u8; TAG_LENGTH],
}

/// Key size parameter of [`AesGcm`]
pub trait KeySize {
    const KEY_LENGTH: usize;
    type Cipher: KeyInit + AeadInPlace;
}

/// 128 bit keys
pub struct Bits128;
/// 256 bit keys
pub struct Bits256;

impl KeySize for Bits128 {
    const KEY_LENGTH: usize = 16;
    type Cipher = Aes128Gcm;
}

impl KeySize for Bits256 {
    const KEY_LENGTH: usize = 32;
    type Cipher = Aes256Gcm;
}

/// AES-GCM parametrised by key length
pub struct AesGcm<K: KeySize>(PhantomData<K>);

pub type AesGcm128 = AesGcm<Bits128>;
pub type AesGcm256 = AesGcm<Bits256>;

impl<K: KeySize> AesGcm<K> {
    pub const KEY_LENGTH: usize = K::KEY_LENGTH;
    pub const IV_LENGTH: usize = IV_LENGTH;
    pub const TAG_LENGTH: usize = TAG_LENGTH;

    /// Encrypt `plaintext` without padding; ciphertext length equals plaintext length
    pub fn encrypt(plaintext: &[u8], key: &SymmetricKey, iv: &[u8]) -> Result<EncryptionResult> {
        let cipher = Self::cipher(key)?;
        Self::check_iv(iv)?;

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(iv), &[], &mut buffer)
            .map_err(|_| VauError::Aead("can't encrypt data".into()))?;

        if buffer.len() != plaintext.len() {
            buffer.zeroize();
            return Err(VauError::Aead("ciphertext has invalid length".into()));
        }

        let mut authentication_tag = [0u8; TAG_LENGTH];
        authentication_tag.copy_from_slice(tag.as_slice());
        Ok(EncryptionResult {
            ciphertext: buffer,
            authentication_tag,
        })
    }

    /// Decrypt and verify. On any failure no plaintext is released.
    pub fn decrypt(
        ciphertext: &[u8],
        key: &SymmetricKey,
        iv: &[u8],
        authentication_tag: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = Self::cipher(key)?;
        Self::check_iv(iv)?;
        if authentication_tag.len() != TAG_LENGTH {
            return Err(VauError::Aead(format!(
                "authentication tag has invalid length {}",
                authentication_tag.len()
            )));
        }

        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                &[],
                buffer.as_mut_slice(),
                Tag::from_slice(authentication_tag),
            )
            .map_err(|_| VauError::Aead("authentication failed".into()))?;

        if buffer.len() != ciphertext.len() {
            return Err(VauError::Aead("plaintext has invalid length".into()));
        }
        Ok(buffer)
    }

    fn cipher(key: &SymmetricKey) -> Result<K::Cipher> {
        if key.len() != K::KEY_LENGTH {
            return Err(VauError::Aead(format!(
                "invalid key length, actual: {}, expected: {}",
                key.len(),
                K::KEY_LENGTH
            )));
        }
        K::Cipher::new_from_slice(key.as_bytes())
            .map_err(|_| VauError::Aead("can't initialize AES-GCM".into()))
    }

    fn check_iv(iv: &[u8]) -> Result<()> {
        if iv.len() != IV_LENGTH {
            return Err(VauError::Aead(format!(
                "invalid IV length, actual: {}, expected: {}",
                iv.len(),
                IV_LENGTH
            )));
        }
        Ok(())
    }
}

/// Fresh random IV
pub fn random_iv() -> [u8; IV_LENGTH] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(len: usize, byte: u8) -> SymmetricKey {
        SymmetricKey::new(vec![byte; len]).unwrap()
    }

    #[test]
    fn test_known_answer_empty_plaintext() {
        let result = AesGcm128::encrypt(b"", &key(16, 0), &[0u8; 12]).unwrap();
        assert!(result.ciphertext.is_empty());
        assert_eq!(
            hex::encode(result.authentication_tag),
            "58e2fccefa7e3061367f1d57a4e7455a"
        );
    }

    #[test]
    fn test_roundtrip_128_and_256() {
        let plaintext = b"prescription bundle, very confidential";
        let iv = random_iv();

        let k128 = key(16, 7);
        let enc = AesGcm128::encrypt(plaintext, &k128, &iv).unwrap();
        assert_eq!(enc.ciphertext.len(), plaintext.len());
        let dec = AesGcm128::decrypt(&enc.ciphertext, &k128, &iv, &enc.authentication_tag).unwrap();
        assert_eq!(dec.as_slice(), plaintext);

        let k256 = key(32, 9);
        let enc = AesGcm256::encrypt(plaintext, &k256, &iv).unwrap();
        let dec = AesGcm256::decrypt(&enc.ciphertext, &k256, &iv, &enc.authentication_tag).unwrap();
        assert_eq!(dec.as_slice(), plaintext);
    }

    #[test]
    fn test_bit_flips_are_detected() {
        let k = key(16, 1);
        let iv = [3u8; 12];
        let enc = AesGcm128::encrypt(b"abcdef", &k, &iv).unwrap();

        for i in 0..enc.ciphertext.len() * 8 {
            let mut ct = enc.ciphertext.clone();
            ct[i / 8] ^= 1 << (i % 8);
            let err = AesGcm128::decrypt(&ct, &k, &iv, &enc.authentication_tag).unwrap_err();
            assert!(matches!(err, VauError::Aead(_)));
        }
        for i in 0..TAG_LENGTH * 8 {
            let mut tag = enc.authentication_tag;
            tag[i / 8] ^= 1 << (i % 8);
            assert!(AesGcm128::decrypt(&enc.ciphertext, &k, &iv, &tag).is_err());
        }
    }

    #[test]
    fn test_wrong_key_size_for_variant() {
        let err = AesGcm256::encrypt(b"x", &key(16, 0), &[0u8; 12]).unwrap_err();
        assert!(matches!(err, VauError::Aead(_)));
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(SymmetricKey::new(vec![0u8; 15]).is_err());
        assert!(AesGcm128::encrypt(b"x", &key(16, 0), &[0u8; 11]).is_err());
        let enc = AesGcm128::encrypt(b"x", &key(16, 0), &[0u8; 12]).unwrap();
        assert!(AesGcm128::decrypt(&enc.ciphertext, &key(16, 0), &[0u8; 12], &[0u8; 15]).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let k = key(16, 0xAB);
        let printed = format!("{:?}", k);
        assert!(!printed.contains("ab"));
        assert!(printed.contains("16 bytes"));
    }
}
