//! Raft engine: durable log, metadata and snapshot stores, TCP transport,
//! and the driver for the `raft` crate's state machine.

pub mod metadata;
pub mod node;
pub mod segment;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use node::{bootstrap, NodeHandle, NodeRequest, NodeStatus};
pub use store::Configuration;
