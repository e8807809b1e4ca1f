//! Common data types for live-session components.
//!
//! Every identifier is a UUID newtype so that a `FanId` can never be passed
//! where a `CreatorId` is expected. Serialized form is the bare UUID string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Borrow the underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a billed live session
    SessionId
);

uuid_id!(
    /// Unique identifier for a tenant (the white-label operator)
    TenantId
);

uuid_id!(
    /// Unique identifier for a creator persona
    CreatorId
);

uuid_id!(
    /// Unique identifier for a fan (the paying participant)
    FanId
);

uuid_id!(
    /// Unique identifier for a dispatched job
    JobId
);

uuid_id!(
    /// Unique identifier for a persisted usage record
    UsageEventId
);
