//! # SC Test Utilities
//!
//! Shared test utilities for the Session Controller (SC).
//!
//! This crate provides:
//! - Seed data builders (`fixtures`)
//! - An in-memory wiring of the session manager (`TestHarness`)
//! - Server test harness (`TestScServer` for E2E tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let harness = TestHarness::builder().build();
//!     let seed = harness.seed().await;
//!     let server = TestScServer::spawn(&harness).await?;
//!
//!     let response = reqwest::Client::new()
//!         .post(format!("{}/v1/sessions", server.url()))
//!         .json(&seed.start_body())
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 201);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod server_harness;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
pub use server_harness::*;
