//! CLI command implementations.

pub mod book;
pub mod queue;
pub mod status;
pub mod sync;
