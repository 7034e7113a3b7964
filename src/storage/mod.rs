//! Local storage engine and hint store contracts.

use crate::model::{Mutation, Partition, RangeReadCommand, ReadCommand};

use async_trait::async_trait;

use uuid::Uuid;

/// Failures the local storage engine can raise. Tombstone overruns are
/// kept distinct because the coordinator surfaces them unchanged.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StorageError {
    TombstoneOverwhelming(String),
    Other(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StorageError::TombstoneOverwhelming(m) => {
                write!(f, "tombstone overwhelming: {}", m)
            }
            StorageError::Other(m) => write!(f, "{}", m),
        }
    }
}

/// The node-local mutation/read engine. Apply for a single partition key
/// is serialized internally by the engine.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Applies a mutation locally.
    async fn apply(&self, mutation: &Mutation) -> Result<(), StorageError>;

    /// Applies a counter mutation locally and returns the post-read
    /// result to replicate to peers.
    async fn apply_counter(
        &self,
        mutation: &Mutation,
    ) -> Result<Mutation, StorageError>;

    /// Executes a single-partition read against local data.
    async fn read(&self, command: &ReadCommand) -> Result<Partition, StorageError>;

    /// Executes a token-range scan against local data, partitions ordered
    /// by token then key.
    async fn scan(
        &self,
        command: &RangeReadCommand,
    ) -> Result<Vec<Partition>, StorageError>;

    /// Drops all local data of a table.
    async fn truncate(&self, keyspace: &str, table: &str) -> Result<(), StorageError>;
}

/// The hinted-handoff persistent store. Produces the replayable hint
/// mutation that the coordinator then applies locally.
pub trait HintStore: Send + Sync {
    /// Hint time-to-live in seconds: the smallest gc-grace among the
    /// tables the mutation touches. Non-positive means the hint would
    /// outlive its usefulness and must be skipped.
    fn calculate_hint_ttl(&self, mutation: &Mutation) -> i64;

    /// Materializes the hint row for `mutation` targeted at the host with
    /// the given stable identity.
    fn hint_for(
        &self,
        mutation: &Mutation,
        now_ms: u64,
        ttl_secs: i64,
        host_id: Uuid,
    ) -> Mutation;
}
