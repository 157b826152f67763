//! Spans and logging shared by the RHI crates.

pub mod logger;
pub mod span;

pub use logger::{init, Filter, Logger};
pub use span::{EnteredSpan, Span};
