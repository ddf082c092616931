//! Payload types and topic rules for the heartrate demo

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
