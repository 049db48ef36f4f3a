//! ACS gateway - authenticated API gateway and session refresh coordinator
//! for the exam-report analyzer.
//!
//! Two halves:
//! - [`http_server`]: the gateway in front of the backend API. It forwards
//!   bearer credentials, translates backend failures to a stable error
//!   shape, verifies identity-provider webhooks and applies security and
//!   CORS headers.
//! - [`refresh`]: keeps a signed-in session's cached auth data fresh with
//!   activity-gated background refetches.

pub mod config;
pub mod error;
pub mod http_server;
pub mod middleware;
pub mod proxy;
pub mod rate_limit;
pub mod refresh;
pub mod state;
pub mod webhook;
