//! Contract between the worker pool and the image-generation routine.
//!
//! The worker treats generation as an opaque, possibly slow, possibly
//! failing async operation. It hands the routine a [`ProgressReporter`]
//! and gets back a [`GenerationOutput`] or a [`GenerationError`].

pub mod generator;
pub mod http;
pub mod reporter;

pub use generator::{GenerationError, GenerationOutput, Generator};
pub use http::HttpGenerator;
pub use reporter::{ProgressReporter, ProgressUpdate};
