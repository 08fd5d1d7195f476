//! Single-session lifecycle: one browser per process, guarded by a coarse
//! transition token.
//!
//! Exactly one `Session` may exist process-wide at any instant. That is a
//! documented scaling limitation of this service, kept as an explicit
//! single-slot registry. Do not generalize it to a pool.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::BrowserHandle;
use crate::config::Config;
use crate::error::AutomationError;

/// Contenders for the transition token poll rather than queue: with a
/// single slot, contention is rare and short-lived.
const TOKEN_POLL: Duration = Duration::from_millis(100);
const TOKEN_WAIT_CAP: Duration = Duration::from_secs(30);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Session {
    pub id: String,
    pub browser: Arc<BrowserHandle>,
    created_at: Instant,
    last_activity: StdMutex<Instant>,
    busy: AtomicBool,
    email: StdMutex<Option<String>>,
}

impl Session {
    fn new(browser: BrowserHandle) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            browser: Arc::new(browser),
            created_at: now,
            last_activity: StdMutex::new(now),
            busy: AtomicBool::new(false),
            email: StdMutex::new(None),
        }
    }

    pub fn touch(&self) {
        *lock_or_recover(&self.last_activity) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock_or_recover(&self.last_activity).elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn set_email(&self, email: &str) {
        *lock_or_recover(&self.email) = Some(email.to_string());
    }

    pub fn email(&self) -> Option<String> {
        lock_or_recover(&self.email).clone()
    }
}

fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Released on drop; holding it serializes every slot transition,
/// foreground and reaper alike.
struct TokenGuard<'a> {
    registry: &'a SessionRegistry,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.registry.transition.store(false, Ordering::SeqCst);
    }
}

/// Checked-out access to the live session for the duration of one
/// operation. The busy flag keeps the reapers away until the lease drops.
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn browser(&self) -> &BrowserHandle {
        &self.session.browser
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.busy.store(false, Ordering::SeqCst);
    }
}

pub struct SessionRegistry {
    config: Config,
    slot: Mutex<Option<Arc<Session>>>,
    /// The coarse mutual-exclusion token for slot transitions.
    transition: AtomicBool,
    /// Second guard: two browser launches must never overlap, even if the
    /// token discipline were bypassed.
    initializing: AtomicBool,
}

impl SessionRegistry {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot: Mutex::new(None),
            transition: AtomicBool::new(false),
            initializing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn acquire_token(&self) -> Result<TokenGuard<'_>, AutomationError> {
        let deadline = tokio::time::Instant::now() + TOKEN_WAIT_CAP;
        while self
            .transition
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            if tokio::time::Instant::now() >= deadline {
                return Err(AutomationError::Busy);
            }
            tokio::time::sleep(TOKEN_POLL).await;
        }
        Ok(TokenGuard { registry: self })
    }

    fn try_token(&self) -> Option<TokenGuard<'_>> {
        self.transition
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| TokenGuard { registry: self })
    }

    /// Create the session, replacing any existing one wholesale: the old
    /// browser is fully closed before the new launch begins.
    pub async fn create(&self) -> Result<Arc<Session>, AutomationError> {
        self.create_with(|| BrowserHandle::launch(&self.config)).await
    }

    async fn create_with<F, Fut>(&self, launch: F) -> Result<Arc<Session>, AutomationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BrowserHandle, AutomationError>>,
    {
        let _token = self.acquire_token().await?;

        if let Some(old) = self.slot.lock().await.take() {
            info!(id = %old.id, "closing existing session before replacement");
            old.browser.close().await;
        }

        if self
            .initializing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AutomationError::Launch {
                detail: "another browser launch is already in flight".to_string(),
            });
        }
        let launched = launch().await;
        self.initializing.store(false, Ordering::SeqCst);

        let session = Arc::new(Session::new(launched?));
        *self.slot.lock().await = Some(session.clone());
        info!(id = %session.id, "session active");
        Ok(session)
    }

    pub async fn current(&self) -> Option<Arc<Session>> {
        self.slot.lock().await.clone()
    }

    /// Check the live session out for one operation: marks it busy so the
    /// reapers leave it alone and touches `last_activity` on both edges.
    pub async fn checkout(&self) -> Result<SessionLease, AutomationError> {
        let _token = self.acquire_token().await?;
        let Some(session) = self.slot.lock().await.clone() else {
            return Err(AutomationError::NoSession);
        };
        if session.busy.swap(true, Ordering::SeqCst) {
            return Err(AutomationError::Busy);
        }
        session.touch();
        Ok(SessionLease { session })
    }

    /// Tear the slot down regardless of the busy flag. Used by explicit
    /// close, the reapers, and the timeout-abandon path.
    pub async fn close_current(&self, reason: &str) -> bool {
        let Ok(_token) = self.acquire_token().await else {
            warn!(reason, "could not acquire token to close session");
            return false;
        };
        let Some(session) = self.slot.lock().await.take() else {
            return false;
        };
        info!(id = %session.id, reason, "closing session");
        session.browser.close().await;
        true
    }

    /// Start the two background sweepers. Both take the same transition
    /// token as foreground operations, so neither can ever close a session
    /// mid-operation.
    pub fn spawn_reapers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let idle = {
            let registry = self.clone();
            tokio::spawn(async move { registry.idle_reaper().await })
        };
        let liveness = {
            let registry = self.clone();
            tokio::spawn(async move { registry.liveness_reaper().await })
        };
        vec![idle, liveness]
    }

    async fn idle_reaper(&self) {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(_token) = self.try_token() else {
                continue;
            };
            let reaped = {
                let mut slot = self.slot.lock().await;
                match slot.as_ref() {
                    Some(s) if !s.is_busy() && s.idle_for() > self.config.idle_timeout() => {
                        slot.take()
                    }
                    _ => None,
                }
            };
            if let Some(session) = reaped {
                info!(
                    id = %session.id,
                    idle_secs = session.idle_for().as_secs(),
                    "reaping idle session"
                );
                session.browser.close().await;
            }
        }
    }

    async fn liveness_reaper(&self) {
        let mut ticker = tokio::time::interval(self.config.liveness_interval());
        loop {
            ticker.tick().await;
            let Some(_token) = self.try_token() else {
                continue;
            };
            let reaped = {
                let mut slot = self.slot.lock().await;
                match slot.as_ref() {
                    Some(s) if !s.browser.is_alive() => slot.take(),
                    _ => None,
                }
            };
            if let Some(session) = reaped {
                warn!(id = %session.id, "browser disconnected, reclaiming session");
                session.browser.close().await;
            } else {
                debug!("liveness sweep: session healthy or absent");
            }
        }
    }
}

/// Race `operation` against `limit`. Losing the race abandons the work:
/// there is no cooperative cancellation primitive for an in-flight browser
/// call, so the browser state is undefined afterwards, the session is torn
/// down, and the caller must start a fresh one.
pub async fn run_with_deadline<T>(
    registry: &SessionRegistry,
    what: &'static str,
    limit: Duration,
    operation: impl Future<Output = T>,
) -> Result<T, AutomationError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(what, secs = limit.as_secs(), "deadline lost, tearing down the session");
            registry.close_current("operation timeout").await;
            Err(AutomationError::Timeout {
                what,
                secs: limit.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_session() -> (Arc<SessionRegistry>, Arc<Session>) {
        let registry = SessionRegistry::new(Config::default());
        let session = registry
            .create_with(|| async { Ok(BrowserHandle::unlaunched()) })
            .await
            .expect("create");
        (registry, session)
    }

    #[tokio::test]
    async fn replacement_closes_the_old_session_first() {
        let (registry, first) = registry_with_session().await;
        assert!(!first.browser.close_requested());

        let second = registry
            .create_with(|| async { Ok(BrowserHandle::unlaunched()) })
            .await
            .expect("replace");

        assert!(first.browser.close_requested());
        assert!(!second.browser.close_requested());
        let current = registry.current().await.expect("slot populated");
        assert_eq!(current.id, second.id);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn launch_failure_leaves_the_slot_empty() {
        let registry = SessionRegistry::new(Config::default());
        let result = registry
            .create_with(|| async {
                Err(AutomationError::Launch {
                    detail: "boom".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert!(registry.current().await.is_none());
        // the initializing guard must have been released
        assert!(!registry.initializing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn checkout_without_a_session_is_an_error() {
        let registry = SessionRegistry::new(Config::default());
        assert!(matches!(
            registry.checkout().await,
            Err(AutomationError::NoSession)
        ));
    }

    #[tokio::test]
    async fn checked_out_session_rejects_a_second_checkout() {
        let (registry, _session) = registry_with_session().await;
        let lease = registry.checkout().await.expect("first checkout");
        assert!(lease.session().is_busy());
        assert!(matches!(
            registry.checkout().await,
            Err(AutomationError::Busy)
        ));
        drop(lease);
        let again = registry.checkout().await.expect("after release");
        assert!(again.session().is_busy());
    }

    #[tokio::test]
    async fn transition_token_is_exclusive() {
        let registry = SessionRegistry::new(Config::default());
        let held = registry.try_token().expect("first acquire");
        assert!(registry.try_token().is_none());
        drop(held);
        assert!(registry.try_token().is_some());
    }

    #[tokio::test]
    async fn close_current_empties_the_slot() {
        let (registry, session) = registry_with_session().await;
        assert!(registry.close_current("test").await);
        assert!(session.browser.close_requested());
        assert!(registry.current().await.is_none());
        // second close finds nothing
        assert!(!registry.close_current("test").await);
    }

    #[tokio::test]
    async fn lost_deadline_tears_the_session_down() {
        let (registry, session) = registry_with_session().await;
        let result = run_with_deadline(&registry, "harvest", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            42
        })
        .await;
        assert!(matches!(
            result,
            Err(AutomationError::Timeout { what: "harvest", .. })
        ));
        assert!(session.browser.close_requested());
        assert!(registry.current().await.is_none());
    }

    #[tokio::test]
    async fn touch_resets_the_idle_clock() {
        let (_registry, session) = registry_with_session().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.idle_for() >= Duration::from_millis(20));
        session.touch();
        assert!(session.idle_for() < Duration::from_millis(20));
    }
}
