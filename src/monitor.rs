// Session expiry monitor
// Warns before the credential expires and forces logout when it does

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{expires_at, CredentialStore, RefreshEndpoint};
use crate::error::RefreshError;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut current) = self.now.lock() {
            *current = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut current) = self.now.lock() {
            *current += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Where the session stands relative to its expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Normal,
    Warning,
    Expired,
}

type ExpiryCallback = Box<dyn Fn() + Send + Sync>;

/// Polls the stored credential and drives `Normal -> Warning -> Expired`
///
/// Transitions only happen on `tick()`, `reset_warning()` or a successful
/// `refresh_session()`. Once `Expired`, ticks do nothing until a reset.
pub struct SessionMonitor {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn RefreshEndpoint>,
    clock: Arc<dyn Clock>,

    /// Warn when less than this is left (default: 300 seconds)
    threshold: Duration,

    state: watch::Sender<SessionState>,
    on_expired: ExpiryCallback,
}

impl SessionMonitor {
    /// Fails when the threshold does not fit a signed duration
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: Arc<dyn RefreshEndpoint>,
        clock: Arc<dyn Clock>,
        threshold_secs: u64,
        on_expired: impl Fn() + Send + Sync + 'static,
    ) -> Result<Self> {
        let threshold = i64::try_from(threshold_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                anyhow!(
                    "Session warning threshold out of range: {} seconds",
                    threshold_secs
                )
            })?;

        let (state, _) = watch::channel(SessionState::Normal);
        Ok(Self {
            store,
            refresher,
            clock,
            threshold,
            state,
            on_expired: Box::new(on_expired),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_expiring_soon(&self) -> bool {
        self.state() == SessionState::Warning
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// One poll evaluation
    pub fn tick(&self) -> SessionState {
        let current = self.state();
        if current == SessionState::Expired {
            return current;
        }

        let token = match self.store.get() {
            Ok(Some(token)) => token,
            Ok(None) => return current,
            Err(e) => {
                tracing::warn!("Session monitor could not read credential: {}", e);
                return current;
            }
        };

        let expiry = match expires_at(&token) {
            Ok(expiry) => expiry,
            Err(e) => {
                tracing::warn!("Session monitor could not read token expiry: {}", e);
                return current;
            }
        };

        let time_left = expiry - self.clock.now();
        let next = if time_left <= Duration::zero() {
            SessionState::Expired
        } else if time_left < self.threshold {
            SessionState::Warning
        } else {
            SessionState::Normal
        };

        if self.transition(next) {
            match next {
                SessionState::Expired => {
                    tracing::warn!("Session expired at {}, forcing logout", expiry.to_rfc3339());
                    (self.on_expired)();
                }
                SessionState::Warning => tracing::info!(
                    seconds_left = time_left.num_seconds(),
                    "Session expiring soon"
                ),
                SessionState::Normal => tracing::debug!("Session back to normal"),
            }
        }

        next
    }

    /// Back to `Normal` immediately; the next tick re-evaluates
    pub fn reset_warning(&self) {
        self.transition(SessionState::Normal);
    }

    /// Extend the session without going through a 401
    ///
    /// Failure is returned for the caller to show; it never forces a logout.
    pub async fn refresh_session(&self) -> std::result::Result<(), RefreshError> {
        let token = match self.refresher.refresh().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to extend session");
                return Err(e);
            }
        };

        self.store
            .set(&token)
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        self.reset_warning();
        tracing::info!("Session extended");
        Ok(())
    }

    /// Poll on a timer until the returned handle is stopped or dropped
    pub fn spawn(self: Arc<Self>, interval: std::time::Duration) -> MonitorHandle {
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                self.tick();
            }
        });

        MonitorHandle { task }
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        })
    }
}

/// Owns the polling task; dropping it stops the timer
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRefresher(std::result::Result<String, RefreshError>);

    #[async_trait]
    impl RefreshEndpoint for FixedRefresher {
        async fn refresh(&self) -> std::result::Result<String, RefreshError> {
            self.0.clone()
        }
    }

    fn token_expiring_at(exp: DateTime<Utc>) -> String {
        let payload = serde_json::json!({ "exp": exp.timestamp(), "role": "client" });
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(payload.to_string())
        )
    }

    struct Fixture {
        monitor: Arc<SessionMonitor>,
        store: Arc<MemoryCredentialStore>,
        clock: Arc<ManualClock>,
        expired_calls: Arc<AtomicUsize>,
        now: DateTime<Utc>,
    }

    fn fixture(refresh: std::result::Result<String, RefreshError>) -> Fixture {
        let now = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        let store = Arc::new(MemoryCredentialStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let expired_calls = Arc::new(AtomicUsize::new(0));
        let calls = expired_calls.clone();

        let monitor = Arc::new(SessionMonitor::new(
            store.clone(),
            Arc::new(FixedRefresher(refresh)),
            clock.clone(),
            300,
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap());

        Fixture {
            monitor,
            store,
            clock,
            expired_calls,
            now,
        }
    }

    #[test]
    fn test_no_credential_stays_normal() {
        let f = fixture(Ok("unused".to_string()));
        assert_eq!(f.monitor.tick(), SessionState::Normal);
        assert!(!f.monitor.is_expiring_soon());
    }

    #[test]
    fn test_warning_inside_threshold() {
        let f = fixture(Ok("unused".to_string()));
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(250)))
            .unwrap();

        assert_eq!(f.monitor.tick(), SessionState::Warning);
        assert!(f.monitor.is_expiring_soon());
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exactly_threshold_is_normal() {
        let f = fixture(Ok("unused".to_string()));
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(300)))
            .unwrap();

        assert_eq!(f.monitor.tick(), SessionState::Normal);
    }

    #[test]
    fn test_expired_invokes_callback_once() {
        let f = fixture(Ok("unused".to_string()));
        f.store
            .set(&token_expiring_at(f.now - Duration::seconds(1)))
            .unwrap();

        assert_eq!(f.monitor.tick(), SessionState::Expired);
        assert!(!f.monitor.is_expiring_soon());
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 1);

        // Latched until reset
        f.clock.advance(Duration::seconds(5));
        assert_eq!(f.monitor.tick(), SessionState::Expired);
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_progression_over_time() {
        let f = fixture(Ok("unused".to_string()));
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(600)))
            .unwrap();

        assert_eq!(f.monitor.tick(), SessionState::Normal);

        f.clock.advance(Duration::seconds(301));
        assert_eq!(f.monitor.tick(), SessionState::Warning);

        f.clock.set(f.now + Duration::seconds(600));
        assert_eq!(f.monitor.tick(), SessionState::Expired);
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_warning_until_next_tick() {
        let f = fixture(Ok("unused".to_string()));
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(100)))
            .unwrap();
        f.monitor.tick();
        assert!(f.monitor.is_expiring_soon());

        f.monitor.reset_warning();
        assert!(!f.monitor.is_expiring_soon());
        assert_eq!(f.monitor.state(), SessionState::Normal);

        assert_eq!(f.monitor.tick(), SessionState::Warning);
    }

    #[test]
    fn test_undecodable_token_changes_nothing() {
        let f = fixture(Ok("unused".to_string()));
        f.store.set("opaque").unwrap();
        assert_eq!(f.monitor.tick(), SessionState::Normal);
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let f = fixture(Ok("unused".to_string()));
        let mut rx = f.monitor.subscribe();
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(10)))
            .unwrap();

        f.monitor.tick();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SessionState::Warning);

        // Same state again is not a change
        f.monitor.tick();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_refresh_session_success() {
        let f = fixture(Ok("placeholder".to_string()));
        let fresh = token_expiring_at(f.now + Duration::seconds(3600));
        let monitor = Arc::new(SessionMonitor::new(
            f.store.clone(),
            Arc::new(FixedRefresher(Ok(fresh.clone()))),
            f.clock.clone(),
            300,
            || {},
        )
        .unwrap());
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(60)))
            .unwrap();
        monitor.tick();
        assert!(monitor.is_expiring_soon());

        monitor.refresh_session().await.unwrap();

        assert!(!monitor.is_expiring_soon());
        assert_eq!(f.store.get().unwrap(), Some(fresh));
        assert_eq!(monitor.tick(), SessionState::Normal);
    }

    #[tokio::test]
    async fn test_refresh_session_failure_keeps_session() {
        let failure = RefreshError::Transport("offline".to_string());
        let f = fixture(Err(failure.clone()));
        let token = token_expiring_at(f.now + Duration::seconds(60));
        f.store.set(&token).unwrap();
        f.monitor.tick();

        assert_eq!(f.monitor.refresh_session().await.unwrap_err(), failure);
        assert!(f.monitor.is_expiring_soon());
        assert_eq!(f.store.get().unwrap(), Some(token));
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_threshold_out_of_range_is_rejected() {
        let store = Arc::new(MemoryCredentialStore::new());
        let refresher = Arc::new(FixedRefresher(Ok("unused".to_string())));
        let clock = Arc::new(ManualClock::new(Utc::now()));

        for threshold in [10_000_000_000_000_000, u64::MAX] {
            let err = SessionMonitor::new(
                store.clone(),
                refresher.clone(),
                clock.clone(),
                threshold,
                || {},
            )
            .err()
            .unwrap();
            assert!(err.to_string().contains("out of range"));
        }

        assert!(SessionMonitor::new(store, refresher, clock, 86_400, || {}).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_poller_and_teardown() {
        let f = fixture(Ok("unused".to_string()));
        f.store
            .set(&token_expiring_at(f.now + Duration::seconds(200)))
            .unwrap();

        let handle = f.monitor.clone().spawn(std::time::Duration::from_secs(5));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(f.monitor.is_expiring_soon());

        f.clock.advance(Duration::seconds(200));
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(f.monitor.state(), SessionState::Expired);
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 1);

        // After teardown nothing re-evaluates the state
        handle.stop();
        f.monitor.reset_warning();
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(f.monitor.state(), SessionState::Normal);
        assert_eq!(f.expired_calls.load(Ordering::SeqCst), 1);
    }
}
