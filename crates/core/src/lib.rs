//! Shared domain types for the folio generation pipeline.
//!
//! Plain data and small helpers with no I/O beyond env lookups: the job and progress
//! model, the event envelope carried on the event bridge, the realtime
//! wire messages, the retry/reconnect backoff policy, and env parsing
//! helpers for the binaries' config structs.

pub mod backoff;
pub mod config;
pub mod error;
pub mod job;
pub mod job_events;
pub mod messages;
pub mod types;
