//! Client side of the VAU channel, for tools and tests

use super::envelope::{OuterEnvelope, COORDINATE_LENGTH};
use super::inner::{InnerRequest, InnerResponse, RESPONSE_KEY_LENGTH};
use super::protocol::OUTER_VERSION;
use crate::crypto::{random_iv, AesGcm128, SymmetricKey, IV_LENGTH, TAG_LENGTH};
use crate::error::{Result, VauError};
use crate::hsm::derive_ecies_content_key;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;

/// Length of the random request id a client generates
pub const REQUEST_ID_LENGTH: usize = 16;

pub struct ClientTeeProtocol {
    server_public_key: PublicKey,
}

impl ClientTeeProtocol {
    /// `server_public_key` is the uncompressed SEC1 point of the VAU key
    pub fn new(server_public_key: &[u8]) -> Result<Self> {
        let server_public_key = PublicKey::from_sec1_bytes(server_public_key)
            .map_err(|_| VauError::Config("invalid VAU public key".into()))?;
        Ok(Self { server_public_key })
    }

    /// Encrypt an arbitrary inner plaintext into an outer envelope
    pub fn encrypt_plaintext(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let point = ephemeral.public_key().to_encoded_point(false);
        let shared = ephemeral.diffie_hellman(&self.server_public_key);
        let content_key = derive_ecies_content_key(shared.raw_secret_bytes().as_slice())?;

        let iv = random_iv();
        let encrypted = AesGcm128::encrypt(plaintext, &content_key, &iv)?;

        Ok(OuterEnvelope {
            version: OUTER_VERSION,
            x_component: coordinate(point.x())?,
            y_component: coordinate(point.y())?,
            iv,
            ciphertext: encrypted.ciphertext,
            authentication_tag: encrypted.authentication_tag,
        }
        .assemble())
    }

    /// Build an encrypted request with a fresh request id and response key
    pub fn create_request(
        &self,
        access_token: &str,
        http_request: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, SymmetricKey)> {
        let request_id: [u8; REQUEST_ID_LENGTH] = rand::random();
        let response_key = SymmetricKey::generate(RESPONSE_KEY_LENGTH)?;
        let plaintext =
            InnerRequest::serialize(access_token, &request_id, &response_key, http_request);
        let outer = self.encrypt_plaintext(&plaintext)?;
        Ok((outer, request_id.to_vec(), response_key))
    }

    /// Decrypt a response body (`iv || ciphertext || tag`)
    pub fn parse_response(body: &[u8], response_key: &SymmetricKey) -> Result<(Vec<u8>, InnerResponse)> {
        if body.len() < IV_LENGTH + TAG_LENGTH {
            return Err(VauError::Format(format!(
                "response too short: {} bytes",
                body.len()
            )));
        }
        let (iv, rest) = body.split_at(IV_LENGTH);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LENGTH);
        let plaintext = AesGcm128::decrypt(ciphertext, response_key, iv, tag)?;
        InnerResponse::parse(&plaintext)
    }
}

fn coordinate(bytes: Option<&p256::FieldBytes>) -> Result<[u8; COORDINATE_LENGTH]> {
    bytes
        .and_then(|b| b.as_slice().try_into().ok())
        .ok_or_else(|| VauError::Internal("ephemeral key has no affine coordinate".into()))
}
