//! Session refresh coordination.
//!
//! A [`RefreshCoordinator`] keeps auth-scoped entries of a [`QueryCache`]
//! fresh while a user session is open: periodic user, permission and
//! organization refetches, a session probe that self-heals an inactive
//! cached session, and a sweep over stale `auth` entries. User-data refresh
//! is gated on recent activity reported by an [`Environment`].

pub mod activity;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod environment;
pub mod http_cache;

pub use activity::ActivityTracker;
pub use cache::{CacheError, CacheKey, CachedAuthEntry, QueryCache, RefetchType};
pub use config::{RefreshConfig, ACTIVITY_THROTTLE, AUTH_NAMESPACE, INACTIVITY_CEILING};
pub use coordinator::{CoordinatorStatus, RefreshCoordinator, RefreshError, TimerKind};
pub use environment::{
    ChannelEnvironment, Environment, EnvironmentEvent, NoopEnvironment, Visibility,
};
pub use http_cache::{HttpQueryCache, StaticToken, TokenSource};
