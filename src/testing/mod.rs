//! Testing utilities
//!
//! An in-memory broker with fault injection, so the client can be exercised
//! without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
