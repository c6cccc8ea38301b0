//! This crate, `abraxas`, implements the ordering core of a Byzantine
//! fault tolerant replicated state machine: a PBFT style three phase
//! commit, an ordered execution pipeline, stable checkpoints with log
//! garbage collection, a view change sub-protocol, and a write-ahead
//! log used to rejoin the cluster after a crash.
//!
//! The network transport, the client facing channel and the application
//! executor are external collaborators, reached through the traits in
//! [`bft::communication`], [`bft::response`] and [`bft::executable`].

pub mod bft;
