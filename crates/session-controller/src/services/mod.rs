//! Clients for the external collaborators of the session core.
//!
//! # Components
//!
//! - `room_gateway` - media server rooms and join credentials
//! - `billing_gateway` - payment processor customers, pre-authorization, usage
//! - `agent_launcher` - agent orchestrator, driven by the job dispatcher
//!
//! Each client sits behind a trait with a `mock` submodule for tests.

pub mod agent_launcher;
pub mod billing_gateway;
pub mod room_gateway;

pub use agent_launcher::{AgentLauncher, HttpAgentLauncher};
pub use billing_gateway::{BillingGateway, StripeBillingClient};
pub use room_gateway::{LiveRoomClient, RoomGateway};
