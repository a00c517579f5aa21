//! Aggregated health of the HSM pool and the TEE token updater

use crate::error::{Result, VauError};
use crate::hsm::{HsmSessionPool, UpdaterPhase};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                status: HealthStatus::Up,
                detail: None,
            },
            Err(e) => Self {
                status: HealthStatus::Down,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_session_count: usize,
    pub active_session_count: usize,
    pub available_session_count: usize,
    pub inactive_session_count: usize,
    pub max_used_session_count: usize,
    pub keep_alive_job_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdaterStats {
    pub phase: UpdaterPhase,
    pub failure_count: u32,
    pub last_update: Option<DateTime<Utc>>,
}

/// Point-in-time health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub hsm: CheckResult,
    pub tee_token: CheckResult,
    pub pool: PoolStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_updater: Option<UpdaterStats>,
}

impl HealthReport {
    /// Ping the HSM through one pooled session and query the token updater
    pub fn collect(pool: &HsmSessionPool) -> Self {
        let hsm = CheckResult::from_result(Self::check_hsm(pool));
        let tee_token = CheckResult::from_result(
            pool.with_token_updater(|updater| updater.health_check())
                .unwrap_or_else(|| Err(VauError::Unhealthy("TEE token updater stopped".into()))),
        );
        let token_updater = pool.with_token_updater(|updater| UpdaterStats {
            phase: updater.phase(),
            failure_count: updater.failure_count(),
            last_update: updater.last_update_time(),
        });

        let status = if hsm.status == HealthStatus::Up && tee_token.status == HealthStatus::Up {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };
        if status == HealthStatus::Down {
            warn!(
                "health check failed: hsm {:?}, tee token {:?}",
                hsm.detail,
                tee_token.detail
            );
        }

        Self {
            status,
            timestamp: Utc::now(),
            hsm,
            tee_token,
            pool: PoolStats {
                max_session_count: pool.max_session_count(),
                active_session_count: pool.active_session_count(),
                available_session_count: pool.available_session_count(),
                inactive_session_count: pool.inactive_session_count(),
                max_used_session_count: pool.max_used_session_count(),
                keep_alive_job_running: pool.is_keep_alive_job_running(),
            },
            token_updater,
        }
    }

    fn check_hsm(pool: &HsmSessionPool) -> Result<()> {
        let mut session = pool.acquire()?;
        session.get_random_data(1)?;
        Ok(())
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| VauError::Internal(format!("can't serialise health report: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::{
        hsm_token_provider, EciesKeyStore, HsmBackend, HsmFactory, MockHsmClient, PoolConfig,
        TokenProvider,
    };
    use std::sync::Arc;

    fn pool(
        runtime: &tokio::runtime::Runtime,
        mock: Arc<MockHsmClient>,
        provider: TokenProvider,
    ) -> Arc<HsmSessionPool> {
        let keys = Arc::new(EciesKeyStore::new(
            MockHsmClient::generate_ecies_key_pair(1).unwrap(),
        ));
        let factory = HsmFactory::new(HsmBackend::Simulated, mock, keys);
        HsmSessionPool::new(factory, PoolConfig::default(), provider, runtime.handle()).unwrap()
    }

    #[test]
    fn test_healthy_pool() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&runtime, Arc::new(MockHsmClient::new("sim")), hsm_token_provider());

        let report = HealthReport::collect(&pool);
        assert!(report.is_up());
        assert_eq!(report.pool.max_session_count, 5);
        assert_eq!(report.pool.active_session_count, 0);
        assert_eq!(report.pool.available_session_count, 1);
        assert_eq!(report.token_updater.as_ref().unwrap().failure_count, 0);
        assert_eq!(
            report.token_updater.as_ref().unwrap().phase,
            UpdaterPhase::Scheduled
        );

        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"UP\""));
    }

    #[test]
    fn test_token_failure_makes_report_down() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mock = Arc::new(MockHsmClient::new("sim"));
        // the session retries once after reconnecting, so both attempts must fail
        mock.fail_next_token_issues(2);
        let pool = pool(&runtime, mock, hsm_token_provider());

        let report = HealthReport::collect(&pool);
        assert!(!report.is_up());
        assert_eq!(report.hsm.status, HealthStatus::Up);
        assert_eq!(report.tee_token.status, HealthStatus::Down);
        assert!(report.tee_token.detail.as_ref().unwrap().contains("never updated"));
        let updater = report.token_updater.unwrap();
        assert_eq!(updater.failure_count, 1);
        assert!(updater.last_update.is_none());
    }

    #[test]
    fn test_token_outage_after_single_retry_stays_up() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mock = Arc::new(MockHsmClient::new("sim"));
        mock.fail_next_token_issues(1);
        let pool = pool(&runtime, mock, hsm_token_provider());

        let report = HealthReport::collect(&pool);
        assert!(report.is_up());
        assert_eq!(report.token_updater.unwrap().failure_count, 0);
    }

    #[test]
    fn test_unreachable_hsm_makes_report_down() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mock = Arc::new(MockHsmClient::new("sim"));
        let pool = pool(&runtime, mock.clone(), hsm_token_provider());

        mock.fail_next_connects(1);
        let report = HealthReport::collect(&pool);
        assert_eq!(report.hsm.status, HealthStatus::Down);
        assert!(report.hsm.detail.is_some());
    }

    #[test]
    fn test_released_pool_is_down() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let pool = pool(&runtime, Arc::new(MockHsmClient::new("sim")), hsm_token_provider());
        pool.release_pool();

        let report = HealthReport::collect(&pool);
        assert!(!report.is_up());
        assert!(report.token_updater.is_none());
    }
}
