//! Coordinator-side request orchestrator of a multi-replica wide-column
//! store. Any node can receive a client operation; this crate turns it
//! into replica fan-outs driven to a consistency-level quorum, with
//! hinted handoff for the unreachable, read repair for the divergent,
//! and leaderless Paxos for conditional updates.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod cluster;
mod coordinator;
mod messaging;
mod model;
mod stage;
mod storage;

pub use cluster::{
    ConsistencyLevel, EndpointId, LivenessDetector, PlacementOracle,
    ReplicationStrategy, Snitch, Token, TopologySnapshot, MIN_TOKEN,
};
pub use coordinator::{
    Admin, CasRequest, CellCondition, Coordinator, CoordinatorConfig,
    CoordinatorSeed, WriteRequest, BATCHLOG_TABLE, SYSTEM_KEYSPACE,
    UNREACHABLE,
};
pub use messaging::{
    CallbackId, CallbackRegistry, MessagingService, ReplicaReply,
    ReplicaRequest, Verb, WriteType, CURRENT_VERSION,
};
pub use model::{
    content_digest, reconcile, repair_rows_for, token_of, AcceptorState,
    Ballot, BallotClock, Cell, Commit, Mutation, Partition,
    RangeReadCommand, ReadCommand, Row, TableUpdate, TokenRange,
};
pub use stage::{Stage, StageTask, Stages};
pub use storage::{HintStore, StorageEngine, StorageError};
pub use utils::{Bitmap, CoordError, LatencyTracker};
