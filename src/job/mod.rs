//! Job data model shared between the job queue and the coordinator

pub mod document;
pub mod status;

pub use document::*;
pub use status::*;
