//! Coordinator-to-replica messaging: verbs, wire message enums, the
//! transport contract, and the callback registry that routes replies back
//! to response handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::model::{Commit, Mutation, Partition, RangeReadCommand, ReadCommand};

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Identifier a response handler hands to the transport; replies carry it
/// back so the registry can route them.
pub type CallbackId = u64;

/// Current wire protocol version.
pub const CURRENT_VERSION: u32 = 1;

/// Message verbs, used to pick RPC timeouts and dropped-message counters.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize, GetSize)]
pub enum Verb {
    Mutation,
    CounterMutation,
    Read,
    RangeRead,
    PaxosPrepare,
    PaxosPropose,
    PaxosCommit,
    Truncate,
    SchemaCheck,
    RequestResponse,
}

/// Write classification carried in timeout/failure errors and used to
/// pick timeouts and metrics.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Serialize, Deserialize, GetSize)]
pub enum WriteType {
    Simple,
    UnloggedBatch,
    Batch,
    Counter,
    Cas,
    BatchLog,
}

/// Requests the coordinator sends to replicas.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum ReplicaRequest {
    /// Apply a mutation; `forward_to` carries the forwarding header for
    /// cross-DC relays (other targets in the relay's DC and the callback
    /// IDs their acks should answer).
    Mutation {
        mutation: Mutation,
        forward_to: Vec<(EndpointId, CallbackId)>,
    },

    /// Apply a counter mutation as the leader for it, then replicate the
    /// result at the given consistency.
    CounterMutation {
        mutation: Mutation,
        consistency: ConsistencyLevel,
    },

    /// Single-partition read; `digest_only` asks for a content digest
    /// instead of the rows.
    Read {
        command: ReadCommand,
        digest_only: bool,
    },

    /// Range scan over one sub-range.
    RangeRead { command: RangeReadCommand },

    PaxosPrepare { commit: Commit },
    PaxosPropose { commit: Commit },
    PaxosCommit { commit: Commit },

    /// Drop all data of one table.
    Truncate { keyspace: String, table: String },

    /// Probe for the replica's schema version.
    SchemaCheck,
}

impl ReplicaRequest {
    /// The verb of this request.
    pub fn verb(&self) -> Verb {
        match self {
            ReplicaRequest::Mutation { .. } => Verb::Mutation,
            ReplicaRequest::CounterMutation { .. } => Verb::CounterMutation,
            ReplicaRequest::Read { .. } => Verb::Read,
            ReplicaRequest::RangeRead { .. } => Verb::RangeRead,
            ReplicaRequest::PaxosPrepare { .. } => Verb::PaxosPrepare,
            ReplicaRequest::PaxosPropose { .. } => Verb::PaxosPropose,
            ReplicaRequest::PaxosCommit { .. } => Verb::PaxosCommit,
            ReplicaRequest::Truncate { .. } => Verb::Truncate,
            ReplicaRequest::SchemaCheck => Verb::SchemaCheck,
        }
    }
}

/// Replies replicas send back, routed by callback ID.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum ReplicaReply {
    WriteOk,
    WriteFailed,

    /// `data` is `None` for digest-only reads; `digest` always covers the
    /// replica's local content.
    ReadResponse {
        data: Option<Partition>,
        digest: u64,
    },
    ReadFailed,

    RangeResponse { data: Vec<Partition> },

    PrepareResponse {
        promised: bool,
        in_progress: Option<Commit>,
        most_recent_commit: Option<Commit>,
    },
    ProposeResponse { accepted: bool },

    TruncateOk,

    SchemaVersion { version: String },
}

/// On-wire transport contract. Serialization and delivery are external;
/// the coordinator only addresses endpoints and tags requests with
/// callback IDs.
pub trait MessagingService: Send + Sync {
    /// Fire-and-forget send.
    fn send_one_way(&self, request: ReplicaRequest, to: EndpointId);

    /// Request expecting a reply routed to `callback`.
    fn send_rr(&self, request: ReplicaRequest, to: EndpointId, callback: CallbackId);

    /// Wire protocol version spoken by an endpoint.
    fn version(&self, endpoint: EndpointId) -> u32 {
        let _ = endpoint;
        CURRENT_VERSION
    }

    /// Bookkeeping for messages dropped before first execution.
    fn increment_dropped(&self, verb: Verb);
}

/// Receiver half of a response handler: the registry fans replica replies
/// and failure signals into these.
pub trait ResponseSink: Send + Sync {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply);
    fn on_failure(&self, from: EndpointId);
}

/// Callback-ID-keyed registry of in-flight response handlers. Handlers
/// hold no reference back to the transport; entries are removed on the
/// handler's terminal transition and straggler replies are dropped here.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<CallbackId, Arc<dyn ResponseSink>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink and returns the fresh callback ID to tag the
    /// outgoing request with.
    pub fn register(&self, sink: Arc<dyn ResponseSink>) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.lock().unwrap().insert(id, sink);
        id
    }

    /// Routes a reply to its handler; replies for completed (removed)
    /// callbacks are silently dropped.
    pub fn deliver(&self, from: EndpointId, callback: CallbackId, reply: ReplicaReply) {
        let sink = self.sinks.lock().unwrap().get(&callback).cloned();
        if let Some(sink) = sink {
            sink.on_reply(from, reply);
        }
    }

    /// Routes an explicit failure signal to its handler.
    pub fn deliver_failure(&self, from: EndpointId, callback: CallbackId) {
        let sink = self.sinks.lock().unwrap().get(&callback).cloned();
        if let Some(sink) = sink {
            sink.on_failure(from);
        }
    }

    /// Removes the given callbacks after their handler completed.
    pub fn deregister(&self, callbacks: &[CallbackId]) {
        let mut sinks = self.sinks.lock().unwrap();
        for id in callbacks {
            sinks.remove(id);
        }
    }

    /// Number of in-flight callbacks (for tests and introspection).
    pub fn in_flight(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }
}

#[cfg(test)]
mod messaging_tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        replies: AtomicUsize,
        failures: AtomicUsize,
    }

    impl ResponseSink for CountingSink {
        fn on_reply(&self, _from: EndpointId, _reply: ReplicaReply) {
            self.replies.fetch_add(1, Ordering::SeqCst);
        }
        fn on_failure(&self, _from: EndpointId) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registry_routes_and_drops_stragglers() {
        let registry = CallbackRegistry::new();
        let sink = Arc::new(CountingSink {
            replies: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        });
        let id = registry.register(sink.clone());

        registry.deliver(1, id, ReplicaReply::WriteOk);
        registry.deliver_failure(2, id);
        assert_eq!(sink.replies.load(Ordering::SeqCst), 1);
        assert_eq!(sink.failures.load(Ordering::SeqCst), 1);

        registry.deregister(&[id]);
        registry.deliver(1, id, ReplicaReply::WriteOk);
        assert_eq!(sink.replies.load(Ordering::SeqCst), 1);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn request_verbs() {
        assert_eq!(ReplicaRequest::SchemaCheck.verb(), Verb::SchemaCheck);
        assert_eq!(
            ReplicaRequest::Truncate {
                keyspace: "ks".into(),
                table: "cf".into()
            }
            .verb(),
            Verb::Truncate
        );
    }
}
