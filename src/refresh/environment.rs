//! Host environment abstraction for interaction events.

use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Interaction signals the activity tracker listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    TouchStart,
    VisibilityChanged(Visibility),
}

impl EnvironmentEvent {
    /// Events that count as user interaction for throttled tracking.
    pub fn is_interaction(&self) -> bool {
        !matches!(self, EnvironmentEvent::VisibilityChanged(_))
    }
}

/// Source of interaction events for the host the coordinator runs in.
pub trait Environment: Send + Sync + 'static {
    /// Subscribe to interaction events. `None` when the host has no input
    /// surface at all.
    fn subscribe(&self) -> Option<broadcast::Receiver<EnvironmentEvent>>;
}

/// Headless host; never produces events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnvironment;

impl Environment for NoopEnvironment {
    fn subscribe(&self) -> Option<broadcast::Receiver<EnvironmentEvent>> {
        None
    }
}

/// Environment fed programmatically by the host.
#[derive(Debug, Clone)]
pub struct ChannelEnvironment {
    tx: broadcast::Sender<EnvironmentEvent>,
}

impl ChannelEnvironment {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish an event. Having no subscriber is fine.
    pub fn emit(&self, event: EnvironmentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ChannelEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for ChannelEnvironment {
    fn subscribe(&self) -> Option<broadcast::Receiver<EnvironmentEvent>> {
        Some(self.tx.subscribe())
    }
}
