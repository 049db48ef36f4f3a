//! Background refresh scheduling for one signed-in session.

use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::activity::ActivityTracker;
use super::cache::{CacheError, CacheKey, QueryCache, RefetchType};
use super::config::{RefreshConfig, AUTH_NAMESPACE, INACTIVITY_CEILING};
use super::environment::Environment;

/// Named periodic timers a running coordinator may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    UserRefresh,
    PermissionsRefresh,
    SessionCheck,
    OrgRefresh,
    StaleRefresh,
}

impl TimerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TimerKind::UserRefresh => "user-refresh",
            TimerKind::PermissionsRefresh => "permissions-refresh",
            TimerKind::SessionCheck => "session-check",
            TimerKind::OrgRefresh => "org-refresh",
            TimerKind::StaleRefresh => "stale-refresh",
        }
    }
}

/// An explicit refresh that failed.
#[derive(Debug, thiserror::Error)]
#[error("refresh of {key} failed: {source}")]
pub struct RefreshError {
    pub key: String,
    #[source]
    pub source: CacheError,
}

/// Point-in-time view of a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub is_active: bool,
    pub active_intervals: usize,
    pub last_activity: Instant,
    pub config: RefreshConfig,
}

#[derive(Default)]
struct CoordinatorState {
    timers: HashMap<TimerKind, JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    active: bool,
}

/// Runs the tick policies. Cloned into every timer task.
#[derive(Clone)]
struct Ticker {
    cache: Arc<dyn QueryCache>,
    activity: ActivityTracker,
    gate_on_activity: bool,
}

impl Ticker {
    fn user_tick(&self, key: &CacheKey) {
        if self.gate_on_activity {
            let idle = self.activity.idle_for();
            if idle > INACTIVITY_CEILING {
                trace!(event = "refresh.user.skipped", key = %key, idle_secs = idle.as_secs());
                return;
            }
        }
        self.dispatch(key.clone(), "user");
    }

    fn permissions_tick(&self, key: &CacheKey) {
        self.dispatch(key.clone(), "permissions");
    }

    fn session_tick(&self, key: &CacheKey) {
        let active = self
            .cache
            .query_data(key)
            .as_ref()
            .is_some_and(session_is_active);
        if !active {
            debug!(event = "refresh.session.inactive", key = %key);
            self.dispatch(key.clone(), "session");
        }
    }

    fn organization_tick(&self, key: &CacheKey) {
        self.dispatch(key.clone(), "organization");
    }

    fn stale_tick(&self) {
        for entry in self.cache.stale_entries(AUTH_NAMESPACE, Instant::now()) {
            self.dispatch(entry.key, "stale");
        }
    }

    /// Fire a refetch on its own task. Failures end here.
    fn dispatch(&self, key: CacheKey, reason: &'static str) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.refetch(&key, RefetchType::Active).await {
                debug!(
                    event = "refresh.background.failed",
                    reason = reason,
                    key = %key,
                    error = %e
                );
            }
        });
    }
}

/// Whether cached session data reports a live session.
fn session_is_active(data: &Value) -> bool {
    ["authenticated", "is_active", "isActive"]
        .iter()
        .any(|field| data.get(field).and_then(Value::as_bool) == Some(true))
}

fn spawn_timer<F>(kind: TimerKind, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            trace!(event = "refresh.timer.tick", timer = kind.name());
            tick();
        }
    })
}

/// Keeps auth-scoped cache entries fresh while a session is open.
///
/// Build one per signed-in session and call [`start`](Self::start) inside a
/// tokio runtime. Dropping the coordinator stops it.
pub struct RefreshCoordinator {
    cache: Arc<dyn QueryCache>,
    environment: Arc<dyn Environment>,
    config: RefreshConfig,
    activity: ActivityTracker,
    state: Mutex<CoordinatorState>,
}

impl RefreshCoordinator {
    pub fn new(
        cache: Arc<dyn QueryCache>,
        environment: Arc<dyn Environment>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            cache,
            environment,
            config,
            activity: ActivityTracker::new(),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    fn ticker(&self) -> Ticker {
        Ticker {
            cache: self.cache.clone(),
            activity: self.activity.clone(),
            gate_on_activity: self.config.enable_activity_based_refresh,
        }
    }

    /// Arm every timer for `user_id`, replacing any previous run.
    pub fn start(&self, user_id: &str, org_id: Option<&str>) {
        let mut state = self.lock();
        self.stop_locked(&mut state);

        let ticker = self.ticker();
        let config = &self.config;

        let user_key = CacheKey::user(user_id);
        let t = ticker.clone();
        state.timers.insert(
            TimerKind::UserRefresh,
            spawn_timer(TimerKind::UserRefresh, config.user_data_interval(), move || {
                t.user_tick(&user_key)
            }),
        );

        let permissions_key = CacheKey::permissions(user_id);
        let t = ticker.clone();
        state.timers.insert(
            TimerKind::PermissionsRefresh,
            spawn_timer(TimerKind::PermissionsRefresh, config.permissions_interval(), move || {
                t.permissions_tick(&permissions_key)
            }),
        );

        let session_key = CacheKey::session(user_id);
        let t = ticker.clone();
        state.timers.insert(
            TimerKind::SessionCheck,
            spawn_timer(TimerKind::SessionCheck, config.session_check_interval(), move || {
                t.session_tick(&session_key)
            }),
        );

        if let Some(org_id) = org_id {
            let org_key = CacheKey::organization(org_id);
            let t = ticker.clone();
            state.timers.insert(
                TimerKind::OrgRefresh,
                spawn_timer(TimerKind::OrgRefresh, config.user_data_interval(), move || {
                    t.organization_tick(&org_key)
                }),
            );
        }

        if config.enable_stale_data_refresh {
            let t = ticker;
            state.timers.insert(
                TimerKind::StaleRefresh,
                spawn_timer(TimerKind::StaleRefresh, config.stale_check_interval(), move || {
                    t.stale_tick()
                }),
            );
        }

        state.listener = self
            .environment
            .subscribe()
            .map(|rx| self.activity.spawn_listener(rx));
        self.activity.touch();
        state.active = true;

        info!(
            event = "refresh.coordinator.started",
            user_id = user_id,
            org_id = org_id.unwrap_or(""),
            timers = state.timers.len(),
        );
    }

    /// Disarm every timer. Refetches already in flight are left to finish.
    pub fn stop(&self) {
        let mut state = self.lock();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut CoordinatorState) {
        let was_active = state.active;
        for (_, handle) in state.timers.drain() {
            handle.abort();
        }
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        self.activity.cancel_pending();
        state.active = false;
        if was_active {
            info!(event = "refresh.coordinator.stopped");
        }
    }

    async fn refetch_now(&self, key: CacheKey) -> Result<(), RefreshError> {
        self.cache
            .refetch(&key, RefetchType::Active)
            .await
            .map_err(|source| RefreshError {
                key: key.to_string(),
                source,
            })
    }

    pub async fn refresh_user(&self, user_id: &str) -> Result<(), RefreshError> {
        self.refetch_now(CacheKey::user(user_id)).await
    }

    pub async fn refresh_permissions(&self, user_id: &str) -> Result<(), RefreshError> {
        self.refetch_now(CacheKey::permissions(user_id)).await
    }

    pub async fn refresh_organization(&self, org_id: &str) -> Result<(), RefreshError> {
        self.refetch_now(CacheKey::organization(org_id)).await
    }

    /// Refresh user, permissions and (when given) organization concurrently.
    ///
    /// Every refresh runs to completion before this returns; the first
    /// failure, if any, is reported afterwards.
    pub async fn refresh_all(
        &self,
        user_id: &str,
        org_id: Option<&str>,
    ) -> Result<(), RefreshError> {
        let mut keys = vec![CacheKey::user(user_id), CacheKey::permissions(user_id)];
        if let Some(org_id) = org_id {
            keys.push(CacheKey::organization(org_id));
        }

        let results = join_all(keys.into_iter().map(|key| self.refetch_now(key))).await;
        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }

    pub fn status(&self) -> CoordinatorStatus {
        let state = self.lock();
        CoordinatorStatus {
            is_active: state.active,
            active_intervals: state.timers.len(),
            last_activity: self.activity.last_activity(),
            config: self.config.clone(),
        }
    }
}

impl Drop for RefreshCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::cache::CachedAuthEntry;
    use crate::refresh::environment::{
        ChannelEnvironment, EnvironmentEvent, NoopEnvironment, Visibility,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;

    /// Records every refetch; keys in `failing` error out.
    #[derive(Default)]
    struct RecordingCache {
        calls: Mutex<Vec<CacheKey>>,
        data: Mutex<HashMap<CacheKey, Value>>,
        entries: Mutex<Vec<CachedAuthEntry>>,
        failing: HashSet<CacheKey>,
    }

    impl RecordingCache {
        fn failing(keys: &[CacheKey]) -> Self {
            Self {
                failing: keys.iter().cloned().collect(),
                ..Default::default()
            }
        }

        fn count(&self, key: &CacheKey) -> usize {
            self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
        }

        fn total(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn set_data(&self, key: CacheKey, value: Value) {
            self.data.lock().unwrap().insert(key, value);
        }
    }

    #[async_trait]
    impl QueryCache for RecordingCache {
        async fn refetch(
            &self,
            key: &CacheKey,
            _refetch_type: RefetchType,
        ) -> Result<(), CacheError> {
            self.calls.lock().unwrap().push(key.clone());
            if self.failing.contains(key) {
                return Err(CacheError::Status {
                    key: key.to_string(),
                    status: 503,
                });
            }
            Ok(())
        }

        fn query_data(&self, key: &CacheKey) -> Option<Value> {
            self.data.lock().unwrap().get(key).cloned()
        }

        fn entries(&self, namespace: &str) -> Vec<CachedAuthEntry> {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.key.in_namespace(namespace))
                .cloned()
                .collect()
        }
    }

    fn coordinator(cache: &Arc<RecordingCache>, config: RefreshConfig) -> RefreshCoordinator {
        RefreshCoordinator::new(cache.clone(), Arc::new(NoopEnvironment), config)
    }

    fn ticker(cache: &Arc<RecordingCache>, gate_on_activity: bool) -> Ticker {
        Ticker {
            cache: cache.clone(),
            activity: ActivityTracker::new(),
            gate_on_activity,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let cache = Arc::new(RecordingCache::default());
        let c = coordinator(&cache, RefreshConfig::default());
        c.stop();
        c.stop();
        let status = c.status();
        assert!(!status.is_active);
        assert_eq!(status.active_intervals, 0);
    }

    #[tokio::test]
    async fn test_interval_count_follows_config() {
        let cache = Arc::new(RecordingCache::default());

        let c = coordinator(&cache, RefreshConfig::default());
        c.start("user_1", None);
        assert_eq!(c.status().active_intervals, 4);
        c.start("user_1", Some("org_1"));
        assert_eq!(c.status().active_intervals, 5);

        let no_sweep = RefreshConfig {
            enable_stale_data_refresh: false,
            ..Default::default()
        };
        let c = coordinator(&cache, no_sweep);
        c.start("user_1", None);
        assert_eq!(c.status().active_intervals, 3);
        c.start("user_1", Some("org_1"));
        assert_eq!(c.status().active_intervals, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timer_set() {
        let cache = Arc::new(RecordingCache::default());
        let config = RefreshConfig {
            permissions_interval_ms: 100,
            enable_stale_data_refresh: false,
            ..Default::default()
        };
        let c = coordinator(&cache, config);

        c.start("user_1", None);
        c.start("user_2", None);
        assert!(c.status().is_active);

        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;

        assert_eq!(cache.count(&CacheKey::permissions("user_1")), 0);
        assert_eq!(cache.count(&CacheKey::permissions("user_2")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timers() {
        let cache = Arc::new(RecordingCache::default());
        let config = RefreshConfig {
            permissions_interval_ms: 100,
            ..Default::default()
        };
        let c = coordinator(&cache, config);
        c.start("user_1", None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        let before = cache.total();
        assert!(before >= 1);

        c.stop();
        assert!(!c.status().is_active);
        assert_eq!(c.status().active_intervals, 0);

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(cache.total(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_period() {
        let cache = Arc::new(RecordingCache::default());
        let c = coordinator(&cache, RefreshConfig::default());
        c.start("user_1", None);

        tokio::time::sleep(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(cache.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cadence_scenario() {
        let cache = Arc::new(RecordingCache::default());
        let config = RefreshConfig {
            user_data_interval_ms: 1000,
            permissions_interval_ms: 500,
            session_check_interval_ms: 100,
            enable_activity_based_refresh: false,
            ..Default::default()
        };
        let c = coordinator(&cache, config);
        c.start("user_1", None);

        tokio::time::sleep(Duration::from_millis(1010)).await;
        settle().await;

        assert!(cache.count(&CacheKey::user("user_1")) >= 1);
        assert!(cache.count(&CacheKey::permissions("user_1")) >= 2);
        // No session data is cached, so every check triggers a refetch.
        assert!(cache.count(&CacheKey::session("user_1")) >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_org_timer_follows_user_cadence() {
        let cache = Arc::new(RecordingCache::default());
        let config = RefreshConfig {
            user_data_interval_ms: 200,
            enable_activity_based_refresh: false,
            enable_stale_data_refresh: false,
            ..Default::default()
        };
        let c = coordinator(&cache, config);
        c.start("user_1", Some("org_1"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;
        assert_eq!(cache.count(&CacheKey::organization("org_1")), 0);

        tokio::time::sleep(Duration::from_millis(860)).await;
        settle().await;
        assert_eq!(cache.count(&CacheKey::organization("org_1")), 5);
        assert_eq!(cache.count(&CacheKey::user("user_1")), 5);
        assert_eq!(cache.total(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_sweeps_seeded_entries() {
        let cache = Arc::new(RecordingCache::default());
        let seeded = Instant::now();
        tokio::time::advance(Duration::from_secs(120)).await;
        *cache.entries.lock().unwrap() = vec![
            CachedAuthEntry {
                key: CacheKey::organization("org_1"),
                data: Some(json!({"id": "org_1"})),
                updated_at: seeded,
                stale_time: Duration::from_secs(60),
            },
            CachedAuthEntry {
                key: CacheKey::user("user_1"),
                data: Some(json!({"id": "user_1"})),
                updated_at: Instant::now(),
                stale_time: Duration::from_secs(600),
            },
        ];

        let config = RefreshConfig {
            stale_check_interval_ms: 100,
            ..Default::default()
        };
        let c = coordinator(&cache, config);
        c.start("user_1", None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(cache.total(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(cache.count(&CacheKey::organization("org_1")), 2);
        assert_eq!(cache.count(&CacheKey::user("user_1")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_tick_skips_when_idle() {
        let cache = Arc::new(RecordingCache::default());
        let t = ticker(&cache, true);
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        t.activity.set_last_activity(Instant::now() - Duration::from_secs(11 * 60));

        let key = CacheKey::user("user_1");
        for _ in 0..3 {
            t.user_tick(&key);
        }
        settle().await;
        assert_eq!(cache.count(&key), 0);

        t.activity.touch();
        t.user_tick(&key);
        settle().await;
        assert_eq!(cache.count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_tick_without_gating_ignores_idle() {
        let cache = Arc::new(RecordingCache::default());
        let t = ticker(&cache, false);
        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        t.activity.set_last_activity(Instant::now() - Duration::from_secs(60 * 60));

        let key = CacheKey::user("user_1");
        t.user_tick(&key);
        t.user_tick(&key);
        settle().await;
        assert_eq!(cache.count(&key), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permissions_tick_ignores_activity() {
        for gate in [true, false] {
            let cache = Arc::new(RecordingCache::default());
            let t = ticker(&cache, gate);
            tokio::time::advance(Duration::from_secs(60 * 60)).await;
            t.activity.set_last_activity(Instant::now() - Duration::from_secs(60 * 60));

            let key = CacheKey::permissions("user_1");
            t.permissions_tick(&key);
            settle().await;
            assert_eq!(cache.count(&key), 1);
        }
    }

    #[tokio::test]
    async fn test_session_tick_refetches_only_inactive_session() {
        let cache = Arc::new(RecordingCache::default());
        let t = ticker(&cache, true);
        let key = CacheKey::session("user_1");

        cache.set_data(key.clone(), json!({"authenticated": true}));
        t.session_tick(&key);
        settle().await;
        assert_eq!(cache.count(&key), 0);

        cache.set_data(key.clone(), json!({"authenticated": false}));
        t.session_tick(&key);
        settle().await;
        assert_eq!(cache.count(&key), 1);
    }

    #[tokio::test]
    async fn test_session_tick_refetches_missing_session() {
        let cache = Arc::new(RecordingCache::default());
        let t = ticker(&cache, true);
        let key = CacheKey::session("user_1");

        t.session_tick(&key);
        settle().await;
        assert_eq!(cache.count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tick_refetches_stale_entries_with_data() {
        let cache = Arc::new(RecordingCache::default());
        let old = Instant::now();
        tokio::time::advance(Duration::from_secs(300)).await;
        let entry = |key: CacheKey, data: Option<Value>, updated_at: Instant| CachedAuthEntry {
            key,
            data,
            updated_at,
            stale_time: Duration::from_secs(60),
        };
        *cache.entries.lock().unwrap() = vec![
            entry(CacheKey::user("stale"), Some(json!({})), old),
            entry(CacheKey::user("fresh"), Some(json!({})), Instant::now()),
            entry(CacheKey::user("empty"), None, old),
            entry(CacheKey::new(["reports", "r1"]), Some(json!({})), old),
        ];

        ticker(&cache, true).stale_tick();
        settle().await;

        assert_eq!(cache.total(), 1);
        assert_eq!(cache.count(&CacheKey::user("stale")), 1);
    }

    #[tokio::test]
    async fn test_background_failure_is_swallowed() {
        let key = CacheKey::permissions("user_1");
        let cache = Arc::new(RecordingCache::failing(&[key.clone()]));
        let t = ticker(&cache, true);

        t.permissions_tick(&key);
        t.permissions_tick(&key);
        settle().await;
        assert_eq!(cache.count(&key), 2);
    }

    #[tokio::test]
    async fn test_refresh_now_propagates_errors() {
        let cache = Arc::new(RecordingCache::failing(&[CacheKey::user("user_1")]));
        let c = coordinator(&cache, RefreshConfig::default());

        let err = c.refresh_user("user_1").await.unwrap_err();
        assert_eq!(err.key, "auth:user:user_1");
        assert!(c.refresh_permissions("user_1").await.is_ok());
        assert!(c.refresh_organization("org_1").await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_all_attempts_every_key() {
        let cache = Arc::new(RecordingCache::failing(&[CacheKey::user("user_1")]));
        let c = coordinator(&cache, RefreshConfig::default());

        let result = c.refresh_all("user_1", Some("org_1")).await;
        assert!(result.is_err());
        assert_eq!(cache.count(&CacheKey::user("user_1")), 1);
        assert_eq!(cache.count(&CacheKey::permissions("user_1")), 1);
        assert_eq!(cache.count(&CacheKey::organization("org_1")), 1);
    }

    #[tokio::test]
    async fn test_refresh_all_without_org() {
        let cache = Arc::new(RecordingCache::default());
        let c = coordinator(&cache, RefreshConfig::default());

        c.refresh_all("user_1", None).await.unwrap();
        assert_eq!(cache.total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_resets_last_activity() {
        let cache = Arc::new(RecordingCache::default());
        let c = coordinator(&cache, RefreshConfig::default());
        tokio::time::advance(Duration::from_secs(900)).await;

        c.start("user_1", None);
        assert_eq!(c.status().last_activity, Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_environment_activity_reaches_coordinator() {
        let cache = Arc::new(RecordingCache::default());
        let env = Arc::new(ChannelEnvironment::new());
        let c = RefreshCoordinator::new(cache.clone(), env.clone(), RefreshConfig::default());
        c.start("user_1", None);
        let started = c.status().last_activity;

        tokio::time::sleep(Duration::from_secs(120)).await;
        env.emit(EnvironmentEvent::VisibilityChanged(Visibility::Visible));
        settle().await;
        assert!(c.status().last_activity > started);

        c.stop();
        let stopped_at = c.status().last_activity;
        tokio::time::sleep(Duration::from_secs(30)).await;
        env.emit(EnvironmentEvent::VisibilityChanged(Visibility::Visible));
        settle().await;
        assert_eq!(c.status().last_activity, stopped_at);
    }

    #[test]
    fn test_session_is_active_fields() {
        assert!(session_is_active(&json!({"authenticated": true})));
        assert!(session_is_active(&json!({"isActive": true})));
        assert!(!session_is_active(&json!({"authenticated": "yes"})));
        assert!(!session_is_active(&json!({})));
    }
}
