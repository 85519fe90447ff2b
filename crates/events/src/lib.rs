//! Event bridge between workers and the realtime fan-out server.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`PgEventBridge`]: cross-process publisher over Postgres
//!   `LISTEN/NOTIFY`, plus [`pg::relay`] which feeds notifications into a
//!   local [`EventBus`].
//!
//! Both are best-effort. A lost event is compensated by observers polling
//! the progress store.

pub mod bus;
pub mod pg;

pub use bus::{EventBus, EventPublisher};
pub use pg::PgEventBridge;
