//! Process-wide VAU state, built once at startup
//!
//! Owns the HSM session pool, the VSDM keys and the proof validator. Callers
//! create one context and pass it where it is needed; tests create their own.

use crate::config::VauConfig;
use crate::error::Result;
use crate::health::HealthReport;
use crate::hsm::{hsm_token_provider, HsmFactory, HsmSessionPool, TokenProvider};
use crate::tee::{InnerRequest, InnerResponse, OuterResponse, TeeProtocol};
use crate::vsdm::{ProofValidator, ValidatedProof, VsdmKey, VsdmKeyRing, HCV_LENGTH};
use chrono::{DateTime, Utc};
use log::{error, info};
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

pub struct VauContext {
    /// Effective configuration
    pub config: VauConfig,
    /// Random id of this instance, for log correlation
    pub instance_id: String,
    pool: Arc<HsmSessionPool>,
    vsdm_keys: VsdmKeyRing,
    validator: ProofValidator,
}

impl VauContext {
    /// Build a context on the backend named in `config`
    pub fn new(config: VauConfig, runtime: &Handle) -> Result<Self> {
        let factory = HsmFactory::for_backend(config.hsm.backend, &config.hsm.device, None)?;
        Self::with_factory(config, factory, hsm_token_provider(), runtime)
    }

    /// Build a context around an already selected HSM backend
    pub fn with_factory(
        config: VauConfig,
        factory: HsmFactory,
        token_provider: TokenProvider,
        runtime: &Handle,
    ) -> Result<Self> {
        config.validate()?;
        let instance_id = Uuid::new_v4().to_string();
        info!("Creating VAU context instance={}", instance_id);
        info!("Effective configuration:\n{}", config.summary());

        let pool = HsmSessionPool::new(factory, config.pool_config(), token_provider, runtime)?;
        let validator = ProofValidator::new(config.proof_validity())?;
        Ok(Self {
            config,
            instance_id,
            pool,
            vsdm_keys: VsdmKeyRing::new(),
            validator,
        })
    }

    pub fn pool(&self) -> &Arc<HsmSessionPool> {
        &self.pool
    }

    pub fn register_vsdm_key(&mut self, key: VsdmKey) {
        self.vsdm_keys.insert(key);
    }

    pub fn vsdm_keys(&self) -> &VsdmKeyRing {
        &self.vsdm_keys
    }

    /// Decrypt `outer`, let `handler` answer it and encrypt the answer.
    ///
    /// Every failure becomes a bodyless error response with the status of
    /// its kind; details go to the log only.
    pub fn handle_request(
        &self,
        outer: &[u8],
        handler: impl FnOnce(&InnerRequest) -> InnerResponse,
    ) -> OuterResponse {
        let request = match TeeProtocol::decrypt_request(outer, &self.pool) {
            Ok(request) => request,
            Err(e) => return OuterResponse::from_error(&e),
        };
        let response = handler(&request);
        TeeProtocol::respond(&request, &response).unwrap_or_else(|e| OuterResponse::from_error(&e))
    }

    /// Check a VSDM proof against the registered keys
    pub fn validate_proof(
        &self,
        encoded: &str,
        expected_hcv: Option<&[u8; HCV_LENGTH]>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedProof> {
        self.validator.validate(encoded, &self.vsdm_keys, expected_hcv, now)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::collect(&self.pool)
    }

    /// Stop background jobs and release the pool
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down VAU context instance={}", self.instance_id);
        self.pool.shutdown().inspect_err(|e| error!("unclean shutdown: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpStatus;
    use crate::hsm::MockHsmClient;
    use crate::tee::ClientTeeProtocol;
    use crate::vsdm::{make_hcv, DecryptedProof, VsdmProofV2};
    use chrono::TimeZone;

    fn context(runtime: &tokio::runtime::Runtime) -> VauContext {
        VauContext::new(VauConfig::default(), runtime.handle()).unwrap()
    }

    fn client(ctx: &VauContext) -> ClientTeeProtocol {
        let latest = ctx.pool().factory().keys().keys().latest;
        ClientTeeProtocol::new(&MockHsmClient::public_key_of(&latest).unwrap()).unwrap()
    }

    #[test]
    fn test_handle_request() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&runtime);
        let (outer, request_id, key) = client(&ctx)
            .create_request("jwt", b"GET /Task HTTP/1.1\r\n\r\n")
            .unwrap();

        let response = ctx.handle_request(&outer, |request| {
            assert_eq!(request.request_line(), Some("GET /Task HTTP/1.1"));
            InnerResponse::new(HttpStatus::Ok).with_body(b"[]".to_vec())
        });
        assert_eq!(response.status, HttpStatus::Ok);

        let (answered, inner) = ClientTeeProtocol::parse_response(&response.body, &key).unwrap();
        assert_eq!(answered, request_id);
        assert_eq!(inner.body, b"[]");
        assert!(ctx.shutdown().is_ok());
    }

    #[test]
    fn test_bad_request_gets_bodyless_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&runtime);
        let response = ctx.handle_request(&[1u8; 10], |_| unreachable!("handler must not run"));
        assert_eq!(response.status, HttpStatus::BadRequest);
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_validate_proof_with_registered_key() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut ctx = context(&runtime);
        let key = VsdmKey::new('D', '1', vec![4; 32]).unwrap();
        let now = Utc.timestamp_opt(crate::vsdm::IAT_EPOCH_OFFSET + 8 * 5000, 0).unwrap();
        let hcv = make_hcv("20250301", "Am Markt 2");
        let proof = VsdmProofV2::encrypt(
            &key,
            &DecryptedProof {
                revoked: false,
                hcv,
                iat: now,
                kvnr: "Z000000001".into(),
            },
        )
        .unwrap()
        .serialize();

        assert!(ctx.validate_proof(&proof, Some(&hcv), now).is_err());
        ctx.register_vsdm_key(key);
        assert_eq!(ctx.vsdm_keys().len(), 1);
        let validated = ctx.validate_proof(&proof, Some(&hcv), now).unwrap();
        assert_eq!(validated.kvnr, "Z000000001");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut config = VauConfig::default();
        config.hsm.max_session_count = 0;
        assert!(VauContext::new(config, runtime.handle()).is_err());
    }

    #[test]
    fn test_health_of_fresh_context() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&runtime);
        assert!(ctx.health().is_up());
        assert!(!ctx.instance_id.is_empty());
    }
}
