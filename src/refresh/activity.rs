//! Throttled last-activity tracking.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::config::ACTIVITY_THROTTLE;
use super::environment::{EnvironmentEvent, Visibility};

struct ActivityState {
    last_activity: Instant,
    pending: Option<JoinHandle<()>>,
}

/// Approximates "is the user engaged" from environment events.
///
/// The first interaction of a burst schedules one update after
/// [`ACTIVITY_THROTTLE`]; later interactions are dropped while that update is
/// pending. Becoming visible updates the timestamp immediately.
#[derive(Clone)]
pub struct ActivityTracker {
    inner: Arc<Mutex<ActivityState>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ActivityState {
                last_activity: Instant::now(),
                pending: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> std::time::Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    /// Record activity right now.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub(crate) fn set_last_activity(&self, at: Instant) {
        self.lock().last_activity = at;
    }

    pub fn has_pending_update(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Feed one environment event. Must run inside a tokio runtime.
    pub fn observe(&self, event: EnvironmentEvent) {
        match event {
            EnvironmentEvent::VisibilityChanged(Visibility::Visible) => self.touch(),
            EnvironmentEvent::VisibilityChanged(Visibility::Hidden) => {}
            event if event.is_interaction() => {
                let mut state = self.lock();
                if state.pending.is_some() {
                    return;
                }
                let tracker = self.clone();
                state.pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(ACTIVITY_THROTTLE).await;
                    let mut state = tracker.lock();
                    state.last_activity = Instant::now();
                    state.pending = None;
                }));
            }
            _ => {}
        }
    }

    /// Drop any scheduled update without applying it.
    pub fn cancel_pending(&self) {
        if let Some(handle) = self.lock().pending.take() {
            handle.abort();
        }
    }

    /// Consume events from `rx` until the channel closes.
    pub(crate) fn spawn_listener(
        &self,
        mut rx: broadcast::Receiver<EnvironmentEvent>,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => tracker.observe(event),
                    Err(RecvError::Lagged(skipped)) => {
                        trace!(event = "activity.listener.lagged", skipped = skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
