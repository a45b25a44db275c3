//! Job coordination: the coordinator actor and the mission task it owns
//!
//! The coordinator is the only place execution state lives. Transport
//! callbacks reach it through a [`CoordinatorHandle`]; the mission task
//! reports back through [`MissionReport`] messages.

pub mod collaborators;
pub mod coordinator;
pub mod mission;
pub mod types;

pub use collaborators::*;
pub use coordinator::*;
pub use mission::*;
pub use types::*;
