//! The read-only path: lookups of committed requests and of the
//! replica's own protocol state. Nothing here mutates consensus
//! state.

use std::sync::Arc;

use crate::bft::checkpoint::CheckpointKeeper;
use crate::bft::communication::message::{
    MessageKind, QueryData, QueryResponse, ReplicaStateData, Request,
};
use crate::bft::communication::serialize;
use crate::bft::communication::NodeId;
use crate::bft::core::server::SystemInfo;
use crate::bft::error::*;
use crate::bft::log::TxnStore;

/// Answers `Query` and `ReplicaState` messages.
pub struct Query {
    id: NodeId,
    store: Arc<dyn TxnStore>,
    system_info: Arc<SystemInfo>,
    checkpoint: Arc<CheckpointKeeper>,
}

impl Query {
    pub fn new(
        id: NodeId,
        store: Arc<dyn TxnStore>,
        system_info: Arc<SystemInfo>,
        checkpoint: Arc<CheckpointKeeper>,
    ) -> Self {
        Self {
            id,
            store,
            system_info,
            checkpoint,
        }
    }

    /// Answers a committed-request lookup; the reply echoes the
    /// query's kind and goes back to the caller.
    pub fn process_query(&self, request: &Request) -> Result<Request> {
        let query: QueryData = serialize::deserialize(request.data())?;
        let requests = self.store.range(query.min_seq, query.max_seq);
        let response = QueryResponse { requests };

        let mut reply = Request::new(MessageKind::Query, self.id);
        reply.data = serialize::serialize(&response)?;
        Ok(reply)
    }

    /// Answers a protocol state snapshot request.
    pub fn process_replica_state(&self) -> Result<Request> {
        let state = ReplicaStateData {
            view: self.system_info.view(),
            primary: self.system_info.primary(),
            stable_seq: self.checkpoint.stable_checkpoint(),
            max_seq: self.store.max_seq(),
        };
        let mut reply = Request::new(MessageKind::ReplicaState, self.id);
        reply.data = serialize::serialize(&state)?;
        Ok(reply)
    }
}
