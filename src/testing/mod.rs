//! Testing utilities and mock implementations
//!
//! Lets the lifecycle controller be exercised without a broker.

pub mod mocks;

pub use mocks::*;
