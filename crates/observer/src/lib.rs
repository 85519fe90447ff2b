//! Observer client for the generation pipeline.
//!
//! Submits jobs, remembers them in a local state file, and follows them
//! over the realtime connection with status polling as the fallback.

pub mod client;
pub mod config;
pub mod error;
pub mod local_state;
pub mod status;

pub use client::{ObserverClient, ObserverUpdate, UpdateSource};
pub use config::ObserverConfig;
pub use error::ObserverError;
pub use local_state::{LocalJobStore, TrackedJob};
pub use status::{StatusClient, SubmittedJob};
