//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types. Use them for the media server API
//! secret, the billing processor key and the database URL.
//!
//! `SecretString` implements `Debug` with redaction, so a config struct that
//! derives `Debug` stays safe to log.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let key = SecretString::from("sk_test_123");
//! assert!(!format!("{key:?}").contains("sk_test_123"));
//! assert_eq!(key.expose_secret(), "sk_test_123");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
