//! Periodic refresh of the TEE token
//!
//! The updater obtains a token through its [`TokenProvider`] and hands it to a
//! [`TokenSink`], normally the session pool. After a success the next refresh
//! is scheduled one update interval later, after a failure one retry interval
//! later. The schedule runs as a tokio task; the refresh itself is blocking
//! HSM I/O and runs on the blocking thread pool.

use super::blob::TeeToken;
use super::client::HsmFactory;
use crate::error::{Result, VauError};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Produces a fresh TEE token, typically by talking to the HSM
pub type TokenProvider = Arc<dyn Fn(&HsmFactory) -> Result<TeeToken> + Send + Sync>;

/// Receives freshly issued tokens
pub trait TokenSink: Send + Sync {
    fn set_tee_token(&self, token: TeeToken);
}

/// Provider that opens a dedicated session and runs the attestation there
pub fn hsm_token_provider() -> TokenProvider {
    Arc::new(|factory: &HsmFactory| {
        let mut session = factory.connect()?;
        session.issue_tee_token()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdaterPhase {
    /// Created, loop not started
    Idle,
    /// Waiting for the next refresh
    Scheduled,
    /// A refresh is in progress
    Running,
    Stopped,
}

struct UpdaterState {
    phase: UpdaterPhase,
    failure_count: u32,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,
    next_delay: Duration,
}

struct UpdaterShared {
    sink: Weak<dyn TokenSink>,
    factory: Arc<HsmFactory>,
    provider: TokenProvider,
    update_interval: Duration,
    retry_interval: Duration,
    state: Mutex<UpdaterState>,
}

impl UpdaterShared {
    fn update(&self) -> Duration {
        let after = {
            let mut state = self.state.lock();
            match state.phase {
                UpdaterPhase::Stopped => UpdaterPhase::Stopped,
                UpdaterPhase::Idle => {
                    state.phase = UpdaterPhase::Running;
                    UpdaterPhase::Idle
                }
                _ => {
                    state.phase = UpdaterPhase::Running;
                    UpdaterPhase::Scheduled
                }
            }
        };

        let result = (self.provider)(&self.factory);

        let result = result.and_then(|token| {
            let sink = self
                .sink
                .upgrade()
                .ok_or_else(|| VauError::Internal("TEE token receiver is gone".into()))?;
            let generation = token.generation;
            sink.set_tee_token(token);
            Ok(generation)
        });

        let mut state = self.state.lock();
        match result {
            Ok(generation) => {
                if state.failure_count > 0 {
                    info!(
                        "TEE token update succeeded after {} failures",
                        state.failure_count
                    );
                }
                info!("updated TEE token, generation {}", generation);
                state.failure_count = 0;
                state.last_update = Some(Utc::now());
                state.last_error = None;
                state.next_delay = self.update_interval;
            }
            Err(error) => {
                state.failure_count += 1;
                warn!(
                    "TEE token update failed ({} in a row), retrying in {:?}: {}",
                    state.failure_count,
                    self.retry_interval,
                    error
                );
                state.last_error = Some(error.to_string());
                state.next_delay = self.retry_interval;
            }
        }
        if state.phase != UpdaterPhase::Stopped {
            state.phase = after;
        }
        state.next_delay
    }
}

/// Refreshes the TEE token on a schedule
pub struct TeeTokenUpdater {
    shared: Arc<UpdaterShared>,
    job: Mutex<Option<JoinHandle<()>>>,
}

impl TeeTokenUpdater {
    pub fn new(
        sink: Weak<dyn TokenSink>,
        factory: Arc<HsmFactory>,
        provider: TokenProvider,
        update_interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(UpdaterShared {
                sink,
                factory,
                provider,
                update_interval,
                retry_interval,
                state: Mutex::new(UpdaterState {
                    phase: UpdaterPhase::Idle,
                    failure_count: 0,
                    last_update: None,
                    last_error: None,
                    next_delay: update_interval,
                }),
            }),
            job: Mutex::new(None),
        }
    }

    /// Refresh once, synchronously. Returns the delay until the next refresh.
    pub fn update(&self) -> Duration {
        self.shared.update()
    }

    /// Start the refresh loop; the first refresh happens after the current
    /// scheduled delay. Starting twice has no effect.
    pub fn start(&self, runtime: &Handle) {
        let mut job = self.job.lock();
        if job.is_some() {
            return;
        }
        self.shared.state.lock().phase = UpdaterPhase::Scheduled;

        let shared = Arc::clone(&self.shared);
        *job = Some(runtime.spawn(async move {
            loop {
                let delay = shared.state.lock().next_delay;
                tokio::time::sleep(delay).await;

                let tick = Arc::clone(&shared);
                if let Err(e) = tokio::task::spawn_blocking(move || tick.update()).await {
                    error!("TEE token update task failed: {}", e);
                }
            }
        }));
        info!("TEE token updater started");
    }

    /// Cancel the refresh loop. Idempotent.
    pub fn stop(&self) {
        if let Some(job) = self.job.lock().take() {
            job.abort();
            info!("TEE token updater stopped");
        }
        self.shared.state.lock().phase = UpdaterPhase::Stopped;
    }

    pub fn phase(&self) -> UpdaterPhase {
        self.shared.state.lock().phase
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.state.lock().failure_count
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.shared.state.lock().last_update
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    pub fn next_delay(&self) -> Duration {
        self.shared.state.lock().next_delay
    }

    pub fn update_interval(&self) -> Duration {
        self.shared.update_interval
    }

    pub fn health_check(&self) -> Result<()> {
        self.health_check_at(Utc::now())
    }

    /// Unhealthy if no update ever succeeded or the last success is older
    /// than 1.5 update intervals at `now`. An interval too large to represent
    /// never goes stale.
    pub fn health_check_at(&self, now: DateTime<Utc>) -> Result<()> {
        let max_age = self
            .shared
            .update_interval
            .checked_mul(3)
            .and_then(|interval| chrono::Duration::from_std(interval / 2).ok());

        let state = self.shared.state.lock();
        let Some(last) = state.last_update else {
            return Err(VauError::Unhealthy(format!(
                "TEE token was never updated, {} failed attempts",
                state.failure_count
            )));
        };
        if max_age.is_some_and(|max_age| now.signed_duration_since(last) > max_age) {
            return Err(VauError::Unhealthy(format!(
                "last TEE token update at {} is too old, {} failed attempts since",
                last.to_rfc3339(),
                state.failure_count
            )));
        }
        Ok(())
    }
}

impl Drop for TeeTokenUpdater {
    fn drop(&mut self) {
        self.stop();
    }
}
