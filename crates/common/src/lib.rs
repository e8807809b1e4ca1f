//! Common utilities and types shared across live-session components.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for room join credentials (claims, signing, verification)
pub mod jwt;
