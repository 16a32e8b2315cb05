// Infrastructure layer (shared components)
pub mod infrastructure;

// Re-export infrastructure modules at the crate root
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;

// Transport core
pub mod envelope;
pub mod events;
pub mod pool;
pub mod queue;
pub mod recovery;
pub mod session;
pub mod transport;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod tasks;
pub mod telemetry;

pub use envelope::{Envelope, MessageType};
pub use events::{Event, EventStream, SessionEvent};
pub use session::{ConnectionHealth, ConnectionState, SessionTransport};
