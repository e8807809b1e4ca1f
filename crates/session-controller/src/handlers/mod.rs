//! HTTP request handlers for the Session Controller.

pub mod health;
pub mod metrics;
pub mod sessions;

pub use health::{health_check, readiness_check};
pub use metrics::metrics_handler;
pub use sessions::{
    cancel_session, get_session, heartbeat, join_session, start_session, terminate_session,
};
