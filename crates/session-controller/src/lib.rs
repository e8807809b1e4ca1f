//! Session Controller Library
//!
//! Backend core for live paid video sessions between creators (AI avatar
//! personas) and fans:
//!
//! - Session lifecycle (start, join, heartbeat, terminate, cancel)
//! - Metered usage reconciliation against the payment processor
//! - Durable dispatch of agent-start jobs
//!
//! # Architecture
//!
//! Handler -> Service -> Store, with the lifecycle manager as the only
//! writer of session rows:
//!
//! ```text
//! routes -> handlers -> lifecycle::SessionManager -> store (PgStore | MemoryStore)
//!                              |         |
//!                              |         +-> reconciler (ledger, billing)
//!                              +-> services (room, billing)  dispatcher -> agent launcher
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `models` - Domain and wire types
//! - `store` - Persistence traits and the in-memory implementation
//! - `repositories` - Postgres implementation of the store traits
//! - `services` - Room, billing and agent orchestrator clients
//! - `lifecycle` - Session state machine
//! - `reconciler` - Usage ledger and billing forwarding
//! - `dispatcher` - Job queue front door and worker pool
//! - `handlers`, `routes`, `middleware` - HTTP surface
//! - `observability` - Metrics and tracing setup

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod store;
