//! Session lifecycle on top of the pool, queues and event broadcaster.
//!
//! [`SessionTransport`] is what the rest of the application talks to: it owns
//! the connection state machine, routes transport signals into events, sends
//! or queues outbound messages, and drives automatic reconnection.

mod health;
mod manager;
mod state;

pub use health::{ConnectionHealth, SessionHealth};
pub use manager::SessionTransport;
pub use state::ConnectionState;
