//! Wire protocol for direct messages and presence
//!
//! Defines the identity type, destination naming and the envelope codec shared
//! by every client talking to the same broker.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
