//! Bounded pool of HSM sessions
//!
//! At most `max_session_count` sessions exist at any time. Idle sessions are
//! kept in a queue and reused; when all are checked out, `acquire` blocks until
//! one is released. Every session handed out carries the most recent TEE
//! token. A background job keeps idle sessions from timing out on the HSM side
//! and a [`TeeTokenUpdater`] keeps the token fresh.

use super::blob::TeeToken;
use super::client::HsmFactory;
use super::session::HsmSession;
use super::token_updater::{TeeTokenUpdater, TokenProvider, TokenSink};
use crate::error::{Result, VauError};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_session_count: usize,
    /// Idle time after which the HSM drops a session
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a free session; `None` waits forever
    pub acquire_timeout: Option<Duration>,
    pub token_update_interval: Duration,
    pub token_retry_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_session_count: 5,
            idle_timeout: Duration::from_secs(15 * 60),
            acquire_timeout: None,
            token_update_interval: Duration::from_secs(20 * 60),
            token_retry_interval: Duration::from_secs(60),
        }
    }
}

struct PoolState {
    available: VecDeque<HsmSession>,
    active_count: usize,
    max_used_count: usize,
    tee_token: TeeToken,
    leases: HashSet<u64>,
    next_lease: u64,
    released: bool,
}

/// Thread safe pool of HSM sessions
pub struct HsmSessionPool {
    factory: Arc<HsmFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    session_released: Condvar,
    keep_alive_job: Mutex<Option<JoinHandle<()>>>,
    token_updater: Mutex<Option<TeeTokenUpdater>>,
}

impl HsmSessionPool {
    /// Create the pool, install a first TEE token and start the background
    /// jobs on `runtime`.
    pub fn new(
        factory: HsmFactory,
        config: PoolConfig,
        token_provider: TokenProvider,
        runtime: &Handle,
    ) -> Result<Arc<Self>> {
        if config.max_session_count == 0 {
            return Err(VauError::Config("HSM pool needs at least one session".into()));
        }
        let factory = Arc::new(factory);
        let pool = Arc::new(Self {
            factory: Arc::clone(&factory),
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                active_count: 0,
                max_used_count: 0,
                tee_token: TeeToken::default(),
                leases: HashSet::new(),
                next_lease: 0,
                released: false,
            }),
            session_released: Condvar::new(),
            keep_alive_job: Mutex::new(None),
            token_updater: Mutex::new(None),
        });

        let sink: Weak<dyn TokenSink> = Arc::downgrade(&pool) as Weak<dyn TokenSink>;
        let updater = TeeTokenUpdater::new(
            sink,
            factory,
            token_provider,
            pool.config.token_update_interval,
            pool.config.token_retry_interval,
        );
        updater.update();
        updater.start(runtime);
        *pool.token_updater.lock() = Some(updater);

        pool.start_keep_alive_job(runtime);
        info!(
            "HSM session pool ready: max {} sessions, idle timeout {:?}",
            pool.config.max_session_count,
            pool.config.idle_timeout
        );
        Ok(pool)
    }

    /// Check out a session, blocking while all sessions are in use.
    ///
    /// Reuses an idle session if one exists, otherwise connects a new one
    /// while below the limit. The returned session carries the current TEE
    /// token and goes back to the pool when dropped.
    pub fn acquire(&self) -> Result<PoolSession<'_>> {
        // A timeout too large to represent waits forever.
        let deadline = self
            .config
            .acquire_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.state.lock();
        loop {
            if state.released {
                error!("HSM session requested from a released pool");
                return Err(VauError::Internal("HSM session pool was released".into()));
            }

            if let Some(mut session) = state.available.pop_front() {
                session.set_tee_token(state.tee_token.clone());
                state.active_count += 1;
                let lease = Self::check_out(&mut state);
                return Ok(PoolSession::new(self, session, lease));
            }

            if state.active_count < self.config.max_session_count {
                // Reserve the slot, connect without holding the lock.
                state.active_count += 1;
                drop(state);
                return self.connect_reserved();
            }

            match deadline {
                None => self.session_released.wait(&mut state),
                Some(deadline) => {
                    if self.session_released.wait_until(&mut state, deadline).timed_out()
                        && state.available.is_empty()
                        && state.active_count >= self.config.max_session_count
                    {
                        warn!("timed out waiting for a free HSM session");
                        return Err(VauError::HsmUnavailable(
                            "no HSM session became available in time".into(),
                        ));
                    }
                }
            }
        }
    }

    fn connect_reserved(&self) -> Result<PoolSession<'_>> {
        let connected = self.factory.connect();

        let mut state = self.state.lock();
        let mut session = match connected {
            Ok(session) => session,
            Err(error) => {
                state.active_count -= 1;
                drop(state);
                self.session_released.notify_one();
                error!("can't create HSM session: {}", error);
                return Err(error);
            }
        };
        if state.released {
            state.active_count -= 1;
            return Err(VauError::Internal("HSM session pool was released".into()));
        }

        session.set_tee_token(state.tee_token.clone());
        let lease = Self::check_out(&mut state);
        info!(
            "created HSM session {}, {} of {} in use",
            session.id(),
            state.active_count,
            self.config.max_session_count
        );
        Ok(PoolSession::new(self, session, lease))
    }

    /// Record a checkout. The caller has already counted it in `active_count`.
    fn check_out(state: &mut PoolState) -> u64 {
        state.max_used_count = state.max_used_count.max(state.active_count);
        state.next_lease += 1;
        state.leases.insert(state.next_lease);
        state.next_lease
    }

    fn release(&self, mut session: HsmSession, lease: u64) {
        if !session.is_broken() {
            if let Err(e) = session.keep_alive(self.config.idle_timeout / 2) {
                warn!("HSM session {} failed keep-alive on release: {}", session.id(), e);
            }
        }

        let mut state = self.state.lock();
        assert!(
            state.leases.remove(&lease),
            "HSM session {} returned with unknown lease {}",
            session.id(),
            lease
        );
        state.active_count -= 1;

        if state.released || session.is_broken() {
            info!("dropping HSM session {} on release", session.id());
            drop(state);
            drop(session);
        } else {
            state.available.push_back(session);
            drop(state);
        }
        self.session_released.notify_one();
    }

    /// Ping idle sessions that have been unused for half the idle timeout.
    /// Sessions that fail are dropped.
    ///
    /// Stale sessions are taken out of the queue and counted as active while
    /// they are pinged, so the lock is not held during HSM round trips and the
    /// session limit still holds.
    pub fn keep_available_sessions_alive(&self) {
        let max_idle = self.config.idle_timeout / 2;
        let stale: Vec<HsmSession> = {
            let mut state = self.state.lock();
            let (stale, fresh): (VecDeque<HsmSession>, VecDeque<HsmSession>) = state
                .available
                .drain(..)
                .partition(|session| session.is_idle_longer_than(max_idle));
            state.available = fresh;
            state.active_count += stale.len();
            stale.into()
        };
        if stale.is_empty() {
            return;
        }

        let pinged = stale.len();
        let survivors: Vec<HsmSession> = stale
            .into_iter()
            .filter_map(|mut session| match session.keep_alive(max_idle) {
                Ok(()) => Some(session),
                Err(e) => {
                    warn!("dropping idle HSM session {}: {}", session.id(), e);
                    None
                }
            })
            .collect();
        let dropped = pinged - survivors.len();

        let mut state = self.state.lock();
        state.active_count -= pinged;
        if state.released {
            drop(state);
            drop(survivors);
        } else {
            state.available.extend(survivors);
            drop(state);
        }
        self.session_released.notify_all();
        if dropped > 0 {
            info!("dropped {} idle HSM sessions after failed keep-alive", dropped);
        }
    }

    fn start_keep_alive_job(self: &Arc<Self>, runtime: &Handle) {
        let period = self.config.idle_timeout / 4;
        if period.is_zero() {
            warn!("HSM idle timeout too small, keep-alive job disabled");
            return;
        }
        let Some(first_tick) = tokio::time::Instant::now().checked_add(period) else {
            warn!("HSM idle timeout too large, keep-alive job disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        let job = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if let Err(e) =
                    tokio::task::spawn_blocking(move || pool.keep_available_sessions_alive()).await
                {
                    error!("HSM keep-alive task failed: {}", e);
                }
            }
        });
        *self.keep_alive_job.lock() = Some(job);
    }

    /// Install a new TEE token for all future checkouts. Sessions that are
    /// checked out keep theirs until they come back.
    pub fn set_tee_token(&self, token: TeeToken) {
        info!(
            "installing TEE token of {} bytes, generation {}",
            token.data.len(),
            token.generation
        );
        self.state.lock().tee_token = token;
    }

    pub fn tee_token(&self) -> TeeToken {
        self.state.lock().tee_token.clone()
    }

    pub fn factory(&self) -> &Arc<HsmFactory> {
        &self.factory
    }

    pub fn max_session_count(&self) -> usize {
        self.config.max_session_count
    }

    pub fn active_session_count(&self) -> usize {
        self.state.lock().active_count
    }

    pub fn available_session_count(&self) -> usize {
        self.state.lock().available.len()
    }

    /// Remaining capacity: sessions that could still be created
    pub fn inactive_session_count(&self) -> usize {
        let state = self.state.lock();
        self.config.max_session_count - state.active_count - state.available.len()
    }

    pub fn max_used_session_count(&self) -> usize {
        self.state.lock().max_used_count
    }

    pub fn reset_max_used_session_count(&self) {
        let mut state = self.state.lock();
        state.max_used_count = state.active_count;
    }

    pub fn is_keep_alive_job_running(&self) -> bool {
        self.keep_alive_job
            .lock()
            .as_ref()
            .is_some_and(|job| !job.is_finished())
    }

    /// Run `f` against the token updater, if it still exists
    pub fn with_token_updater<T>(&self, f: impl FnOnce(&TeeTokenUpdater) -> T) -> Option<T> {
        self.token_updater.lock().as_ref().map(f)
    }

    /// Stop the background jobs and drop all idle sessions. Sessions still
    /// checked out are dropped when they come back. Later `acquire` calls fail.
    pub fn release_pool(&self) {
        if let Some(job) = self.keep_alive_job.lock().take() {
            job.abort();
        }
        if let Some(updater) = self.token_updater.lock().take() {
            updater.stop();
        }

        let idle: Vec<HsmSession> = {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.available.drain(..).collect()
        };
        info!("released HSM session pool, closing {} idle sessions", idle.len());
        drop(idle);
        self.session_released.notify_all();
    }

    /// Release the pool and report checkouts that were never returned
    pub fn shutdown(&self) -> Result<()> {
        self.release_pool();
        let active = self.active_session_count();
        if active > 0 {
            error!("{} HSM sessions still checked out at shutdown", active);
            return Err(VauError::Internal(format!(
                "{} HSM sessions still checked out at shutdown",
                active
            )));
        }
        Ok(())
    }
}

impl TokenSink for HsmSessionPool {
    fn set_tee_token(&self, token: TeeToken) {
        HsmSessionPool::set_tee_token(self, token);
    }
}

impl Drop for HsmSessionPool {
    fn drop(&mut self) {
        self.release_pool();
    }
}

/// A checked-out session. Returns to the pool on drop.
pub struct PoolSession<'a> {
    pool: &'a HsmSessionPool,
    session: Option<HsmSession>,
    lease: u64,
}

impl<'a> PoolSession<'a> {
    fn new(pool: &'a HsmSessionPool, session: HsmSession, lease: u64) -> Self {
        Self {
            pool,
            session: Some(session),
            lease,
        }
    }
}

impl Deref for PoolSession<'_> {
    type Target = HsmSession;

    fn deref(&self) -> &HsmSession {
        self.session
            .as_ref()
            .unwrap_or_else(|| unreachable!("pool session used after release"))
    }
}

impl DerefMut for PoolSession<'_> {
    fn deref_mut(&mut self) -> &mut HsmSession {
        self.session
            .as_mut()
            .unwrap_or_else(|| unreachable!("pool session used after release"))
    }
}

impl Drop for PoolSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, self.lease);
        }
    }
}
