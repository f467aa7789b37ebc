//! Session token manager.
//!
//! One `SessionManager` is built at startup and cloned into every call site.
//! All refresh bookkeeping (the in-flight exchange, the last completion
//! instant, the auto-refresh task) lives on that instance, so at most one
//! refresh exchange is outstanding per manager.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::TokenRefresher;
use crate::store::SessionStore;

use super::session::{SessionRecord, SessionStorage};
use super::token;

// ============================================================================
// Constants
// ============================================================================

/// Access tokens expiring within this window are refreshed before use.
const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 120;

/// Minimum interval between two real refresh exchanges.
const DEFAULT_MIN_REFRESH_INTERVAL_SECS: u64 = 30;

/// How long before expiry the background timer fires.
const DEFAULT_AUTO_REFRESH_MARGIN_SECS: u64 = 60;

/// Floor for the background timer delay.
const DEFAULT_MIN_AUTO_REFRESH_DELAY_SECS: u64 = 10;

/// Timing knobs for the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub refresh_threshold: Duration,
    pub min_refresh_interval: Duration,
    pub auto_refresh_margin: Duration,
    pub min_auto_refresh_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
            min_refresh_interval: Duration::from_secs(DEFAULT_MIN_REFRESH_INTERVAL_SECS),
            auto_refresh_margin: Duration::from_secs(DEFAULT_AUTO_REFRESH_MARGIN_SECS),
            min_auto_refresh_delay: Duration::from_secs(DEFAULT_MIN_AUTO_REFRESH_DELAY_SECS),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn with_auto_refresh_margin(mut self, margin: Duration) -> Self {
        self.auto_refresh_margin = margin;
        self
    }

    #[must_use]
    pub fn with_min_auto_refresh_delay(mut self, delay: Duration) -> Self {
        self.min_auto_refresh_delay = delay;
        self
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Default)]
struct RefreshState {
    /// The exchange currently running, tagged with its flight id
    in_flight: Option<(u64, SharedRefresh)>,
    next_flight: u64,
    /// Completion instant of the last successful exchange
    last_refresh: Option<Instant>,
    auto_refresh: Option<JoinHandle<()>>,
}

struct Inner {
    storage: SessionStorage,
    refresher: Arc<dyn TokenRefresher>,
    config: SessionConfig,
    state: Mutex<RefreshState>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One network exchange. Storage is only written on success.
    async fn exchange(&self, refresh_token: String) -> Option<String> {
        info!("Refreshing access token");
        let tokens = match self.refresher.refresh_access_token(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                return None;
            }
        };

        // Merge into the current record rather than the one read before the
        // exchange, so fields written meanwhile survive.
        let Some(mut record) = self.storage.load() else {
            warn!("Session cleared during refresh, discarding new token");
            return None;
        };
        record.access_token = Some(tokens.access_token.clone());
        if let Some(rotated) = tokens.refresh_token {
            record.refresh_token = Some(rotated);
        }
        record.last_refresh = Some(Utc::now());

        if !self.storage.store(&record) {
            return None;
        }
        self.lock_state().last_refresh = Some(Instant::now());
        info!(expires_at = ?record.access_expires_at(), "Access token refreshed");
        Some(tokens.access_token)
    }
}

/// Clears the in-flight marker when the exchange task ends, however it ends.
struct FlightGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if state.in_flight.as_ref().map(|(id, _)| *id) == Some(self.id) {
            state.in_flight = None;
        }
    }
}

enum Flight {
    Pending(SharedRefresh),
    Ready(Option<String>),
}

/// Hands out valid access tokens and keeps the stored session fresh.
/// Clone is cheap and every clone shares the same refresh state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: impl SessionStore + 'static,
        refresher: Arc<dyn TokenRefresher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage: SessionStorage::new(store),
                refresher,
                config,
                state: Mutex::new(RefreshState::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Persist a session record, replacing any existing one.
    pub fn store(&self, record: &SessionRecord) -> bool {
        self.inner.storage.store(record)
    }

    /// Read the stored session. Missing or malformed data is `None`.
    pub fn load(&self) -> Option<SessionRecord> {
        self.inner.storage.load()
    }

    pub fn clear(&self) {
        self.inner.storage.clear();
    }

    /// Stop the background timer and forget the session.
    pub fn logout(&self) {
        self.stop_auto_refresh();
        self.clear();
        info!("Logged out");
    }

    // =========================================================================
    // Access tokens
    // =========================================================================

    /// Return an access token that is not about to expire, refreshing if
    /// needed. When no token can be produced the session is cleared and
    /// `on_force_login` runs once.
    pub async fn valid_access_token<F>(&self, on_force_login: F) -> Option<String>
    where
        F: FnOnce(),
    {
        let Some(record) = self.load() else {
            debug!("No session on record");
            on_force_login();
            return None;
        };

        if let Some(access) = record.access_token() {
            if !token::expires_within(access, self.threshold()) {
                return Some(access.to_string());
            }
        }

        match self.refresh().await {
            Some(access) => Some(access),
            None => {
                info!("Unable to refresh session, login required");
                self.clear();
                on_force_login();
                None
            }
        }
    }

    /// Same as [`valid_access_token`](Self::valid_access_token) without a
    /// force-login hook.
    pub async fn access_token(&self) -> Option<String> {
        self.valid_access_token(|| {}).await
    }

    fn threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.config.refresh_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero())
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share one exchange and all see its outcome. Within
    /// the minimum interval after a successful exchange the token on record
    /// is returned without a network call. Failures return `None` and leave
    /// storage as it was.
    pub async fn refresh(&self) -> Option<String> {
        match self.begin_refresh() {
            Flight::Pending(flight) => flight.await,
            Flight::Ready(outcome) => outcome,
        }
    }

    fn begin_refresh(&self) -> Flight {
        let mut state = self.inner.lock_state();
        if let Some((_, ref flight)) = state.in_flight {
            debug!("Joining refresh already in flight");
            return Flight::Pending(flight.clone());
        }

        let record = self.load();

        if let Some(last) = state.last_refresh {
            if last.elapsed() < self.inner.config.min_refresh_interval {
                debug!("Refresh throttled, using token on record");
                return Flight::Ready(
                    record.and_then(|r| r.access_token().map(str::to_string)),
                );
            }
        }

        let Some(refresh_token) = record
            .as_ref()
            .and_then(|r| r.usable_refresh_token())
            .map(str::to_string)
        else {
            debug!("No usable refresh token");
            return Flight::Ready(None);
        };

        let id = state.next_flight;
        state.next_flight += 1;

        // The exchange runs on its own task so it completes even if every
        // caller stops waiting.
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = FlightGuard {
                inner: Arc::clone(&inner),
                id,
            };
            inner.exchange(refresh_token).await
        });

        let flight = task
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Refresh task did not complete");
                    None
                }
            })
            .boxed()
            .shared();
        state.in_flight = Some((id, flight.clone()));
        Flight::Pending(flight)
    }

    /// Refresh once if the stored access token is missing or expired and a
    /// usable refresh token exists. Returns true if a refresh succeeded.
    pub async fn reconcile_on_load(&self) -> bool {
        let Some(record) = self.load() else {
            debug!("No session to reconcile");
            return false;
        };
        if !record.access_expired() {
            debug!("Stored access token still valid");
            return false;
        }
        if record.usable_refresh_token().is_none() {
            debug!("Stored refresh token unusable, leaving session as is");
            return false;
        }

        info!("Stored access token stale, refreshing");
        self.refresh().await.is_some()
    }

    // =========================================================================
    // Auto refresh
    // =========================================================================

    /// Start a background timer that refreshes shortly before the access
    /// token expires and then reschedules itself from the new token.
    ///
    /// Does nothing and returns false when there is no session or its access
    /// token has no readable expiry. A previously scheduled timer is replaced.
    /// The timer ends once a refresh fails after the access token expired.
    pub fn schedule_auto_refresh(&self) -> bool {
        let Some(first_delay) = self.next_auto_refresh_delay() else {
            debug!("No token expiry on record, auto refresh not scheduled");
            return false;
        };
        debug!(delay_secs = first_delay.as_secs(), "Auto refresh scheduled");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut delay = first_delay;
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };
                if manager.refresh().await.is_none() {
                    let stale = manager
                        .load()
                        .map(|record| record.access_expired())
                        .unwrap_or(true);
                    if stale {
                        warn!("Refresh failed with access token expired, auto refresh stopped");
                        break;
                    }
                    warn!("Scheduled refresh did not produce a token");
                }
                match manager.next_auto_refresh_delay() {
                    Some(next) => {
                        debug!(delay_secs = next.as_secs(), "Auto refresh rescheduled");
                        delay = next;
                    }
                    None => {
                        debug!("No token expiry on record, auto refresh stopped");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.inner.lock_state().auto_refresh.replace(handle) {
            previous.abort();
        }
        true
    }

    /// Cancel the background timer. A refresh already in flight still completes.
    pub fn stop_auto_refresh(&self) {
        if let Some(handle) = self.inner.lock_state().auto_refresh.take() {
            handle.abort();
            debug!("Auto refresh stopped");
        }
    }

    /// `expiry - now - margin`, floored at the minimum delay.
    fn next_auto_refresh_delay(&self) -> Option<Duration> {
        let expiry = self.load()?.access_expires_at()?;
        let config = &self.inner.config;
        let margin = chrono::Duration::from_std(config.auto_refresh_margin).ok()?;
        let until = (expiry - Utc::now() - margin)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some(until.max(config.min_auto_refresh_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::api::{ApiError, RefreshedTokens};
    use crate::auth::UserProfile;
    use crate::store::{MemoryStore, StorageError};

    use crate::auth::token::token_expiring_in;

    #[derive(Default)]
    struct FakeRefresher {
        calls: AtomicUsize,
        fail: bool,
        rotate: bool,
        gate: Option<Arc<Notify>>,
    }

    impl FakeRefresher {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn rotating() -> Self {
            Self {
                rotate: true,
                ..Default::default()
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh_access_token(
            &self,
            _refresh_token: &str,
        ) -> Result<RefreshedTokens, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref gate) = self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(ApiError::Unauthorized);
            }
            Ok(RefreshedTokens {
                access_token: token_expiring_in(3600),
                refresh_token: self.rotate.then(|| "rotated-refresh".to_string()),
            })
        }
    }

    fn record(access_in: i64, refresh_in: i64) -> SessionRecord {
        let mut record = SessionRecord::new(
            token_expiring_in(access_in),
            token_expiring_in(refresh_in),
        )
        .with_user(UserProfile {
            id: Some(json!(7)),
            name: Some("Ada".into()),
            roles: vec!["manager".into()],
            ..Default::default()
        });
        record.extra.insert("workspace".into(), json!("fin"));
        record
    }

    fn manager_with(store: &MemoryStore, refresher: &Arc<FakeRefresher>) -> SessionManager {
        SessionManager::new(store.clone(), refresher.clone(), SessionConfig::default())
    }

    fn seeded(record: &SessionRecord) -> MemoryStore {
        MemoryStore::with_value(serde_json::to_string(record).unwrap())
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let stored = record(600, 86_400);
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        let token = manager.access_token().await;
        assert_eq!(token, stored.access_token);
        assert_eq!(refresher.calls(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_near_expiry_triggers_single_refresh() {
        let stored = record(30, 86_400);
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        let token = manager.access_token().await.expect("token after refresh");
        assert_eq!(refresher.calls(), 1);
        assert_ne!(Some(&token), stored.access_token.as_ref());

        let after = manager.load().unwrap();
        assert_eq!(after.access_token.as_deref(), Some(token.as_str()));
        assert_eq!(after.refresh_token, stored.refresh_token);
        assert_eq!(after.user, stored.user);
        assert_eq!(after.extra.get("workspace"), Some(&json!("fin")));
        assert!(after.last_refresh.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_exchange() {
        let store = seeded(&record(-10, 86_400));
        let gate = Arc::new(Notify::new());
        let refresher = Arc::new(FakeRefresher::gated(gate.clone()));
        let manager = manager_with(&store, &refresher);

        let callers = join_all((0..8).map(|_| manager.refresh()));
        let release = async {
            tokio::task::yield_now().await;
            gate.notify_one();
        };
        let (results, ()) = tokio::join!(callers, release);

        assert_eq!(refresher.calls(), 1);
        let first = results[0].clone().expect("refresh should succeed");
        assert!(results.iter().all(|r| r.as_deref() == Some(first.as_str())));
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_storage_untouched() {
        let stored = record(-10, 86_400);
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::failing());
        let manager = manager_with(&store, &refresher);

        assert!(manager.refresh().await.is_none());
        assert_eq!(manager.load(), Some(stored));
        assert_eq!(store.write_count(), 0);

        // The in-flight marker is gone, so the next call tries again.
        assert!(manager.refresh().await.is_none());
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_forces_login_once() {
        let store = seeded(&record(-10, 86_400));
        let refresher = Arc::new(FakeRefresher::failing());
        let manager = manager_with(&store, &refresher);

        let forced = AtomicUsize::new(0);
        let token = manager
            .valid_access_token(|| {
                forced.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(token.is_none());
        assert_eq!(forced.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.calls(), 1);
        assert!(manager.load().is_none());
    }

    #[tokio::test]
    async fn test_both_tokens_expired_forces_login_without_network() {
        let store = seeded(&record(-60, -30));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        let forced = AtomicUsize::new(0);
        let token = manager
            .valid_access_token(|| {
                forced.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(token.is_none());
        assert_eq!(forced.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn test_absent_or_malformed_session_forces_login() {
        for store in [MemoryStore::new(), MemoryStore::with_value("not json")] {
            let refresher = Arc::new(FakeRefresher::default());
            let manager = manager_with(&store, &refresher);
            let forced = AtomicUsize::new(0);

            assert!(manager
                .valid_access_token(|| {
                    forced.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .is_none());
            assert_eq!(forced.load(Ordering::SeqCst), 1);
            assert_eq!(refresher.calls(), 0);
        }
    }

    #[tokio::test]
    async fn test_malformed_access_token_is_refreshed() {
        let mut stored = record(600, 86_400);
        stored.access_token = Some("not-a-token".into());
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        let token = manager.access_token().await.unwrap();
        assert_ne!(token, "not-a-token");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_throttled_within_min_interval() {
        let store = seeded(&record(-10, 86_400));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        let first = manager.refresh().await.unwrap();
        let second = manager.refresh().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(refresher.calls(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        manager.refresh().await.unwrap();
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_is_noop_for_valid_access_token() {
        let stored = record(600, 86_400);
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        assert!(!manager.reconcile_on_load().await);
        assert_eq!(refresher.calls(), 0);
        assert_eq!(store.write_count(), 0);
        assert_eq!(manager.load(), Some(stored));
    }

    #[tokio::test]
    async fn test_reconcile_repairs_stale_access_token() {
        let stored = record(-300, 86_400);
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        assert!(manager.reconcile_on_load().await);
        assert_eq!(refresher.calls(), 1);
        assert!(!manager.load().unwrap().access_expired());
    }

    #[tokio::test]
    async fn test_reconcile_skips_expired_refresh_token() {
        let store = seeded(&record(-300, -1));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        assert!(!manager.reconcile_on_load().await);
        assert_eq!(refresher.calls(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_fires_and_reschedules_until_stopped() {
        // 70s to expiry minus the 60s margin puts the first run at the 10s floor.
        let store = seeded(&record(70, 86_400));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        assert!(manager.schedule_auto_refresh());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(refresher.calls(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(refresher.calls(), 1);

        // New token expires in an hour, so the next run is ~59 minutes out.
        tokio::time::sleep(Duration::from_secs(3541)).await;
        assert_eq!(refresher.calls(), 2);

        manager.stop_auto_refresh();
        tokio::time::sleep(Duration::from_secs(10_000)).await;
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test]
    async fn test_auto_refresh_needs_decodable_expiry() {
        let refresher = Arc::new(FakeRefresher::default());

        let manager = manager_with(&MemoryStore::new(), &refresher);
        assert!(!manager.schedule_auto_refresh());

        let mut stored = record(600, 86_400);
        stored.access_token = Some("opaque".into());
        let manager = manager_with(&seeded(&stored), &refresher);
        assert!(!manager.schedule_auto_refresh());
    }

    #[tokio::test]
    async fn test_logout_clears_session_and_timer() {
        let store = seeded(&record(600, 86_400));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        assert!(manager.schedule_auto_refresh());
        manager.logout();
        assert!(manager.load().is_none());
        assert!(manager.inner.lock_state().auto_refresh.is_none());
        manager.logout();
    }

    /// Reads from the inner store but refuses every write.
    struct ReadOnlyStore(MemoryStore);

    impl SessionStore for ReadOnlyStore {
        fn read(&self) -> Result<Option<String>, StorageError> {
            self.0.read()
        }
        fn write(&self, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("read-only".into()))
        }
        fn remove(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("read-only".into()))
        }
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_replaces_stored_one() {
        let stored = record(-10, 86_400);
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::rotating());
        let manager = manager_with(&store, &refresher);

        let token = manager.refresh().await.expect("refresh should succeed");

        let after = manager.load().unwrap();
        assert_eq!(after.access_token.as_deref(), Some(token.as_str()));
        assert_eq!(after.refresh_token.as_deref(), Some("rotated-refresh"));
        assert_eq!(after.user, stored.user);
        assert_eq!(after.extra, stored.extra);
    }

    #[tokio::test]
    async fn test_session_cleared_during_refresh_is_not_restored() {
        let store = seeded(&record(-10, 86_400));
        let gate = Arc::new(Notify::new());
        let refresher = Arc::new(FakeRefresher::gated(gate.clone()));
        let manager = manager_with(&store, &refresher);

        let pending = manager.refresh();
        let logout_midway = async {
            tokio::task::yield_now().await;
            manager.clear();
            gate.notify_one();
        };
        let (outcome, ()) = tokio::join!(pending, logout_midway);

        assert!(outcome.is_none());
        assert_eq!(refresher.calls(), 1);
        assert!(manager.load().is_none());
        // Only the clear itself touched storage.
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_after_exchange_opens_no_throttle_window() {
        let inner = seeded(&record(-10, 86_400));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = SessionManager::new(
            ReadOnlyStore(inner),
            refresher.clone(),
            SessionConfig::default(),
        );

        assert!(manager.refresh().await.is_none());
        assert!(manager.inner.lock_state().last_refresh.is_none());

        // Not throttled, so the next call goes back to the network.
        assert!(manager.refresh().await.is_none());
        assert_eq!(refresher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_replaces_previous_timer() {
        let store = seeded(&record(70, 86_400));
        let refresher = Arc::new(FakeRefresher::default());
        let manager = manager_with(&store, &refresher);

        // First timer would fire at the 10s floor.
        assert!(manager.schedule_auto_refresh());

        // Second timer, from a token valid for 10 minutes, fires ~9 minutes out.
        assert!(manager.store(&record(600, 86_400)));
        assert!(manager.schedule_auto_refresh());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(refresher.calls(), 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(refresher.calls(), 1);
        manager.stop_auto_refresh();
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_refresh_gives_up_after_rejection_of_expired_session() {
        // Opaque refresh token, so it is always sent and always rejected.
        let mut stored = record(-10, 86_400);
        stored.refresh_token = Some("opaque-refresh".into());
        let store = seeded(&stored);
        let refresher = Arc::new(FakeRefresher::failing());
        let manager = manager_with(&store, &refresher);

        assert!(manager.schedule_auto_refresh());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(refresher.calls(), 1);

        tokio::time::sleep(Duration::from_secs(1_000)).await;
        assert_eq!(refresher.calls(), 1);
    }
}
