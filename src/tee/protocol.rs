//! Server side of the VAU channel
//!
//! A request is decrypted with a content key the HSM derives from the
//! client's ephemeral key (ECDH + HKDF). The response is encrypted with the
//! AES key the client put into the inner request, so the HSM is not needed
//! on the way back.

use super::envelope::OuterEnvelope;
use super::inner::{InnerRequest, InnerResponse};
use crate::crypto::{random_iv, AesGcm128, SymmetricKey, IV_LENGTH, TAG_LENGTH};
use crate::error::{HttpStatus, Result, VauError};
use crate::hsm::HsmSessionPool;
use log::{debug, info, warn};
use p256::PublicKey;

/// Only version of the outer envelope
pub const OUTER_VERSION: u8 = 1;
/// Content type of every encrypted response
pub const OUTER_RESPONSE_CONTENT_TYPE: &str = "application/octet-stream";

/// Encrypted response as sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OuterResponse {
    pub status: HttpStatus,
    pub content_type: &'static str,
    /// `iv || ciphertext || tag`
    pub body: Vec<u8>,
}

impl OuterResponse {
    /// Plain error answer without body
    pub fn from_error(error: &VauError) -> Self {
        warn!("rejecting VAU request: {}", error);
        Self {
            status: error.status(),
            content_type: OUTER_RESPONSE_CONTENT_TYPE,
            body: Vec::new(),
        }
    }
}

pub struct TeeProtocol;

impl TeeProtocol {
    /// Decrypt an outer request into the inner request.
    ///
    /// Holds one pooled HSM session for the key derivation. When the tag does
    /// not verify, the derivation is repeated once with the previous ECIES key
    /// generation to cover key rotation; if that fails too, the first error is
    /// returned.
    pub fn decrypt_request(outer: &[u8], pool: &HsmSessionPool) -> Result<InnerRequest> {
        let envelope = OuterEnvelope::disassemble(outer)?;
        if envelope.version != OUTER_VERSION {
            return Err(VauError::Protocol(format!(
                "unsupported outer request version {}",
                envelope.version
            )));
        }

        let client_public_key = envelope.ephemeral_public_key_sec1();
        PublicKey::from_sec1_bytes(&client_public_key)
            .map_err(|_| VauError::Protocol("ephemeral public key is not a valid curve point".into()))?;

        let mut session = pool.acquire()?;
        let content_key = session.vau_ecies128(&client_public_key, false)?;

        let plaintext = match Self::open(&envelope, &content_key) {
            Ok(plaintext) => plaintext,
            Err(error @ VauError::Aead(_)) => {
                info!("VAU request does not decrypt with the latest ECIES key, trying fallback");
                let fallback = session
                    .vau_ecies128(&client_public_key, true)
                    .and_then(|key| Self::open(&envelope, &key));
                match fallback {
                    Ok(plaintext) => plaintext,
                    Err(fallback_error) => {
                        debug!("fallback ECIES key failed too: {}", fallback_error);
                        return Err(error);
                    }
                }
            }
            Err(error) => return Err(error),
        };
        drop(session);

        let request = InnerRequest::parse(&plaintext)?;
        debug!(
            "decrypted VAU request {}",
            hex::encode(request.request_id())
        );
        Ok(request)
    }

    fn open(envelope: &OuterEnvelope, key: &SymmetricKey) -> Result<zeroize::Zeroizing<Vec<u8>>> {
        AesGcm128::decrypt(
            &envelope.ciphertext,
            key,
            &envelope.iv,
            &envelope.authentication_tag,
        )
    }

    /// Encrypt an inner response with the client's response key.
    ///
    /// The key was already validated when the request was parsed, so every
    /// failure here is an internal one.
    pub fn encrypt_response(
        response: &InnerResponse,
        response_key: &SymmetricKey,
        request_id: &[u8],
    ) -> Result<OuterResponse> {
        let plaintext = response.serialize(request_id);
        let iv = random_iv();
        let encrypted =
            AesGcm128::encrypt(&plaintext, response_key, &iv).map_err(VauError::into_internal)?;

        let mut body = Vec::with_capacity(IV_LENGTH + encrypted.ciphertext.len() + TAG_LENGTH);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&encrypted.ciphertext);
        body.extend_from_slice(&encrypted.authentication_tag);

        Ok(OuterResponse {
            status: HttpStatus::Ok,
            content_type: OUTER_RESPONSE_CONTENT_TYPE,
            body,
        })
    }

    /// Answer a request: encrypt `response` for `request`
    pub fn respond(request: &InnerRequest, response: &InnerResponse) -> Result<OuterResponse> {
        Self::encrypt_response(response, request.response_key(), request.request_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::{
        hsm_token_provider, EciesKeyStore, HsmBackend, HsmFactory, MockHsmClient, PoolConfig,
    };
    use crate::tee::client::ClientTeeProtocol;
    use std::sync::Arc;

    struct Fixture {
        _runtime: tokio::runtime::Runtime,
        keys: Arc<EciesKeyStore>,
        pool: Arc<HsmSessionPool>,
    }

    impl Fixture {
        fn new() -> Self {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let keys = Arc::new(EciesKeyStore::new(
                MockHsmClient::generate_ecies_key_pair(1).unwrap(),
            ));
            let factory = HsmFactory::new(
                HsmBackend::Simulated,
                Arc::new(MockHsmClient::new("sim")),
                Arc::clone(&keys),
            );
            let pool = HsmSessionPool::new(
                factory,
                PoolConfig::default(),
                hsm_token_provider(),
                runtime.handle(),
            )
            .unwrap();
            Self {
                _runtime: runtime,
                keys,
                pool,
            }
        }

        fn client(&self) -> ClientTeeProtocol {
            let public = MockHsmClient::public_key_of(&self.keys.keys().latest).unwrap();
            ClientTeeProtocol::new(&public).unwrap()
        }
    }

    const HTTP: &[u8] = b"POST /Task/$create HTTP/1.1\r\nContent-Type: application/fhir+xml\r\n\r\n<Parameters/>";

    #[test]
    fn test_request_response_roundtrip() {
        let fixture = Fixture::new();
        let client = fixture.client();
        let (outer, request_id, response_key) = client.create_request("jwt", HTTP).unwrap();

        let request = TeeProtocol::decrypt_request(&outer, &fixture.pool).unwrap();
        assert_eq!(request.authentication_token(), "jwt");
        assert_eq!(request.request_id(), request_id.as_slice());
        assert_eq!(request.response_key(), &response_key);
        assert_eq!(request.http_request(), HTTP);
        assert_eq!(fixture.pool.active_session_count(), 0);

        let response = InnerResponse::new(HttpStatus::Ok).with_body(b"created".to_vec());
        let outer_response = TeeProtocol::respond(&request, &response).unwrap();
        assert_eq!(outer_response.status, HttpStatus::Ok);
        assert_eq!(outer_response.content_type, "application/octet-stream");

        let (answered_id, decrypted) =
            ClientTeeProtocol::parse_response(&outer_response.body, &response_key).unwrap();
        assert_eq!(answered_id, request_id);
        assert_eq!(decrypted.status, HttpStatus::Ok);
        assert_eq!(decrypted.header("Content-Length"), Some("7"));
        assert_eq!(decrypted.body, b"created");
    }

    #[test]
    fn test_short_envelope_is_format_error() {
        let fixture = Fixture::new();
        let err = TeeProtocol::decrypt_request(&[1u8; 40], &fixture.pool).unwrap_err();
        assert!(matches!(err, VauError::Format(_)));
        assert_eq!(OuterResponse::from_error(&err).status, HttpStatus::BadRequest);
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let fixture = Fixture::new();
        let (mut outer, _, _) = fixture.client().create_request("jwt", HTTP).unwrap();
        outer[0] = 2;
        let err = TeeProtocol::decrypt_request(&outer, &fixture.pool).unwrap_err();
        assert!(matches!(err, VauError::Protocol(_)));
    }

    #[test]
    fn test_point_not_on_curve_is_rejected() {
        let fixture = Fixture::new();
        let (mut outer, _, _) = fixture.client().create_request("jwt", HTTP).unwrap();
        outer[5] ^= 0x01;
        let err = TeeProtocol::decrypt_request(&outer, &fixture.pool).unwrap_err();
        assert!(matches!(err, VauError::Protocol(_)));
        assert_eq!(err.status(), HttpStatus::BadRequest);
    }

    #[test]
    fn test_tampered_ciphertext_is_aead_error() {
        let fixture = Fixture::new();
        let (mut outer, _, _) = fixture.client().create_request("jwt", HTTP).unwrap();
        let last = outer.len() - 20;
        outer[last] ^= 0x80;
        let err = TeeProtocol::decrypt_request(&outer, &fixture.pool).unwrap_err();
        assert!(matches!(err, VauError::Aead(_)));
        assert_eq!(fixture.pool.active_session_count(), 0);
    }

    #[test]
    fn test_request_for_previous_key_uses_fallback() {
        let fixture = Fixture::new();
        let old_client = fixture.client();
        fixture
            .keys
            .rotate(MockHsmClient::generate_ecies_key_pair(2).unwrap());

        let (outer, request_id, _) = old_client.create_request("jwt", HTTP).unwrap();
        let request = TeeProtocol::decrypt_request(&outer, &fixture.pool).unwrap();
        assert_eq!(request.request_id(), request_id.as_slice());
    }

    #[test]
    fn test_malformed_inner_request() {
        let fixture = Fixture::new();
        let client = fixture.client();
        let outer = client.encrypt_plaintext(b"1  jwt 00 00 GET").unwrap();
        let err = TeeProtocol::decrypt_request(&outer, &fixture.pool).unwrap_err();
        assert!(matches!(err, VauError::Protocol(_)));
    }

    #[test]
    fn test_encrypt_response_with_bad_key_is_internal() {
        let key = SymmetricKey::from_slice(&[0u8; 32]).unwrap();
        let err = TeeProtocol::encrypt_response(&InnerResponse::new(HttpStatus::Ok), &key, b"id")
            .unwrap_err();
        assert_eq!(err.status(), HttpStatus::InternalServerError);
    }
}
