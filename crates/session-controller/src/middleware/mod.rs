//! Middleware for the Session Controller HTTP surface.

pub mod http_metrics;

pub use http_metrics::http_metrics_middleware;
