//! Outer envelope of a VAU request
//!
//! Fixed layout, no separators:
//!
//! ```text
//! 0        version      1 byte
//! 1..33    ephemeral X  32 bytes
//! 33..65   ephemeral Y  32 bytes
//! 65..77   IV           12 bytes
//! 77..N-16 ciphertext   variable
//! N-16..N  tag          16 bytes
//! ```
//!
//! The codec only checks lengths. The version value and the legitimacy of the
//! key are the protocol layer's business.

use crate::crypto::{IV_LENGTH, TAG_LENGTH};
use crate::error::{Result, VauError};

/// Length of one ephemeral key coordinate
pub const COORDINATE_LENGTH: usize = 32;
/// Length of everything but the ciphertext
pub const FIXED_LENGTH: usize = 1 + 2 * COORDINATE_LENGTH + IV_LENGTH + TAG_LENGTH;

const X_OFFSET: usize = 1;
const Y_OFFSET: usize = X_OFFSET + COORDINATE_LENGTH;
const IV_OFFSET: usize = Y_OFFSET + COORDINATE_LENGTH;
const CIPHERTEXT_OFFSET: usize = IV_OFFSET + IV_LENGTH;

/// Decoded outer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterEnvelope {
    pub version: u8,
    pub x_component: [u8; COORDINATE_LENGTH],
    pub y_component: [u8; COORDINATE_LENGTH],
    pub iv: [u8; IV_LENGTH],
    pub ciphertext: Vec<u8>,
    pub authentication_tag: [u8; TAG_LENGTH],
}

impl OuterEnvelope {
    /// Serialise all fields in wire order
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_LENGTH + self.ciphertext.len());
        out.push(self.version);
        out.extend_from_slice(&self.x_component);
        out.extend_from_slice(&self.y_component);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.authentication_tag);
        out
    }

    /// Parse the wire form. Fails with [`VauError::Format`] below [`FIXED_LENGTH`] bytes.
    pub fn disassemble(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_LENGTH {
            return Err(VauError::Format(format!(
                "outer request too short: {} bytes, need at least {}",
                data.len(),
                FIXED_LENGTH
            )));
        }
        let tag_offset = data.len() - TAG_LENGTH;

        Ok(Self {
            version: data[0],
            x_component: field(data, X_OFFSET)?,
            y_component: field(data, Y_OFFSET)?,
            iv: field(data, IV_OFFSET)?,
            ciphertext: data[CIPHERTEXT_OFFSET..tag_offset].to_vec(),
            authentication_tag: field(data, tag_offset)?,
        })
    }

    /// Uncompressed SEC1 encoding of the ephemeral public key (`04 || X || Y`)
    pub fn ephemeral_public_key_sec1(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + 2 * COORDINATE_LENGTH);
        key.push(0x04);
        key.extend_from_slice(&self.x_component);
        key.extend_from_slice(&self.y_component);
        key
    }
}

fn field<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| VauError::Format(format!("field at offset {} out of bounds", offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OuterEnvelope {
        OuterEnvelope {
            version: 1,
            x_component: *b"0123456789abcdef0123456789ABCDEF",
            y_component: *b"fedcba9876543210FEDCBA9876543210",
            iv: *b"iv-iv-iv-iv-",
            ciphertext: b"this is the original request, usually encrypted".to_vec(),
            authentication_tag: *b"tag-tag-tag-tag-",
        }
    }

    #[test]
    fn test_fixed_length() {
        assert_eq!(FIXED_LENGTH, 93);
    }

    #[test]
    fn test_assemble_is_plain_concatenation() {
        let envelope = sample();
        let assembled = envelope.assemble();

        let mut expected = vec![1u8];
        expected.extend_from_slice(b"0123456789abcdef0123456789ABCDEF");
        expected.extend_from_slice(b"fedcba9876543210FEDCBA9876543210");
        expected.extend_from_slice(b"iv-iv-iv-iv-");
        expected.extend_from_slice(b"this is the original request, usually encrypted");
        expected.extend_from_slice(b"tag-tag-tag-tag-");
        assert_eq!(assembled, expected);

        let parsed = OuterEnvelope::disassemble(&expected).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_too_short() {
        for len in [0usize, 1, 50, 92] {
            let err = OuterEnvelope::disassemble(&vec![1u8; len]).unwrap_err();
            assert!(matches!(err, VauError::Format(_)));
        }
    }

    #[test]
    fn test_exactly_fixed_length_has_empty_ciphertext() {
        let parsed = OuterEnvelope::disassemble(&[7u8; 93]).unwrap();
        assert!(parsed.ciphertext.is_empty());
        assert_eq!(parsed.version, 7);
    }

    #[test]
    fn test_no_version_validation_in_codec() {
        let mut envelope = sample();
        envelope.version = 0x42;
        let parsed = OuterEnvelope::disassemble(&envelope.assemble()).unwrap();
        assert_eq!(parsed.version, 0x42);
    }

    #[test]
    fn test_sec1_key() {
        let key = sample().ephemeral_public_key_sec1();
        assert_eq!(key.len(), 65);
        assert_eq!(key[0], 0x04);
        assert_eq!(&key[1..33], b"0123456789abcdef0123456789ABCDEF");
    }
}
