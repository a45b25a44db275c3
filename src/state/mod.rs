//! Execution state model for the mission pipeline

pub mod machine;

pub use machine::*;
