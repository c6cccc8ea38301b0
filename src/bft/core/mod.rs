//! Contains the replica orchestration: configuration, the message
//! gate, and the wiring between every sub-protocol.

pub mod server;
