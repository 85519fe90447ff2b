//! Job execution for the generation pipeline.
//!
//! - [`JobService`]: submit / status / stats over an injected queue,
//!   progress tracker and event publisher.
//! - [`WorkerPool`]: bounded set of slots running the execution pipeline.
//! - [`maintenance`]: stall watchdog and retention sweeper loops.

pub mod config;
pub mod error;
pub mod maintenance;
pub mod pool;
pub mod service;

pub use config::{QueueSettings, WorkerConfig};
pub use error::WorkerError;
pub use maintenance::{RetentionSweeper, StallWatchdog};
pub use pool::{PoolConfig, WorkerPool};
pub use service::JobService;
