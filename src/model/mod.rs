//! Core data model: cells, rows, partitions, mutations, read commands,
//! and cell-level reconciliation.

mod paxos;
mod ring;

pub use paxos::{AcceptorState, Ballot, BallotClock, Commit};
pub use ring::TokenRange;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::cluster::Token;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// One named column value with its write timestamp. A `None` value is a
/// tombstone; `local_deletion_time` is the tombstone's gc clock in
/// seconds.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct Cell {
    pub column: String,
    pub value: Option<String>,
    pub timestamp: i64,
    pub local_deletion_time: i32,
}

impl Cell {
    /// Whether this cell wins reconciliation against `other`. Ordering is
    /// timestamp, then local deletion time, then value bytes.
    pub fn supersedes(&self, other: &Cell) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp > other.timestamp;
        }
        if self.local_deletion_time != other.local_deletion_time {
            return self.local_deletion_time > other.local_deletion_time;
        }
        self.value > other.value
    }
}

/// One clustered row: a clustering key plus its cells.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct Row {
    pub clustering: String,
    pub cells: Vec<Cell>,
}

impl Row {
    /// A row shadowed entirely by tombstones is dead; dead rows do not
    /// count toward read limits.
    pub fn is_live(&self) -> bool {
        self.cells.iter().any(|c| c.value.is_some())
    }
}

/// Rows of one table within a mutation.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct TableUpdate {
    pub table: String,
    pub rows: Vec<Row>,
}

/// A write against a single partition key, possibly touching several
/// tables of the keyspace.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct Mutation {
    pub keyspace: String,
    pub key: String,
    pub updates: Vec<TableUpdate>,
}

impl Mutation {
    /// Ring position of this mutation's partition key.
    #[inline]
    pub fn token(&self) -> Token {
        token_of(&self.key)
    }
}

/// One table's materialized partition contents, rows sorted by
/// clustering.
#[derive(
    Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize, GetSize,
)]
pub struct Partition {
    pub key: String,
    pub rows: Vec<Row>,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single-partition read.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct ReadCommand {
    pub keyspace: String,
    pub table: String,
    pub key: String,
    /// Exclusive clustering lower bound, used by short-read retries.
    pub lower_bound: Option<String>,
    /// Maximum rows to return.
    pub limit: usize,
}

impl ReadCommand {
    /// The same read restarted past the given clustering.
    pub fn with_lower_bound(&self, bound: String, limit: usize) -> Self {
        let mut cmd = self.clone();
        cmd.lower_bound = Some(bound);
        cmd.limit = limit;
        cmd
    }
}

/// A partition-range scan over the token ring.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct RangeReadCommand {
    pub keyspace: String,
    pub table: String,
    pub range: TokenRange,
    pub limit: usize,
}

impl RangeReadCommand {
    /// The same scan restricted to one sub-range.
    pub fn for_sub_range(&self, range: TokenRange) -> Self {
        let mut cmd = self.clone();
        cmd.range = range;
        cmd
    }
}

/// Hashes a partition key onto the ring.
pub fn token_of(key: &str) -> Token {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Content digest of a partition, compared across replicas before
/// shipping full data.
pub fn content_digest(partition: &Partition) -> u64 {
    let mut hasher = DefaultHasher::new();
    partition.key.hash(&mut hasher);
    for row in &partition.rows {
        row.clustering.hash(&mut hasher);
        for cell in &row.cells {
            cell.column.hash(&mut hasher);
            cell.value.hash(&mut hasher);
            cell.timestamp.hash(&mut hasher);
            cell.local_deletion_time.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Merges several replica versions of a partition, keeping the winning
/// cell per (clustering, column).
pub fn reconcile(key: &str, versions: &[&Partition]) -> Partition {
    let mut merged: BTreeMap<String, BTreeMap<String, Cell>> =
        BTreeMap::new();
    for version in versions {
        for row in &version.rows {
            let columns =
                merged.entry(row.clustering.clone()).or_default();
            for cell in &row.cells {
                match columns.get(&cell.column) {
                    Some(existing) if !cell.supersedes(existing) => {}
                    _ => {
                        columns.insert(cell.column.clone(), cell.clone());
                    }
                }
            }
        }
    }

    Partition {
        key: key.to_string(),
        rows: merged
            .into_iter()
            .map(|(clustering, columns)| Row {
                clustering,
                cells: columns.into_values().collect(),
            })
            .collect(),
    }
}

/// Rows of `reconciled` that `version` is missing or has stale cells
/// for; `None` when the version is already up to date. The result is the
/// repair payload for that replica.
pub fn repair_rows_for(
    reconciled: &Partition,
    version: &Partition,
) -> Option<Vec<Row>> {
    let mut stale: Vec<Row> = Vec::new();
    for row in &reconciled.rows {
        let have = version
            .rows
            .iter()
            .find(|r| r.clustering == row.clustering);
        let missing: Vec<Cell> = row
            .cells
            .iter()
            .filter(|cell| match have {
                None => true,
                Some(r) => match r
                    .cells
                    .iter()
                    .find(|c| c.column == cell.column)
                {
                    None => true,
                    Some(c) => cell.supersedes(c),
                },
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            stale.push(Row {
                clustering: row.clustering.clone(),
                cells: missing,
            });
        }
    }
    if stale.is_empty() {
        None
    } else {
        Some(stale)
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;

    fn cell(column: &str, value: &str, ts: i64) -> Cell {
        Cell {
            column: column.into(),
            value: Some(value.into()),
            timestamp: ts,
            local_deletion_time: 0,
        }
    }

    #[test]
    fn cell_reconcile_order() {
        let newer = cell("c", "x", 10);
        let older = cell("c", "y", 5);
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));

        // same timestamp: tombstone (higher deletion time) wins
        let mut tomb = cell("c", "", 10);
        tomb.value = None;
        tomb.local_deletion_time = 100;
        assert!(tomb.supersedes(&newer));

        // full tie broken by value
        let a = cell("c", "a", 10);
        let b = cell("c", "b", 10);
        assert!(b.supersedes(&a));
    }

    #[test]
    fn reconcile_picks_newest_per_column() {
        let v1 = Partition {
            key: "k".into(),
            rows: vec![Row {
                clustering: "r1".into(),
                cells: vec![cell("a", "old", 1), cell("b", "keep", 9)],
            }],
        };
        let v2 = Partition {
            key: "k".into(),
            rows: vec![Row {
                clustering: "r1".into(),
                cells: vec![cell("a", "new", 5)],
            }],
        };
        let merged = reconcile("k", &[&v1, &v2]);
        assert_eq!(merged.rows.len(), 1);
        let row = &merged.rows[0];
        assert_eq!(
            row.cells.iter().find(|c| c.column == "a").unwrap().value,
            Some("new".into())
        );
        assert_eq!(
            row.cells.iter().find(|c| c.column == "b").unwrap().value,
            Some("keep".into())
        );
    }

    #[test]
    fn repair_rows_only_for_stale_versions() {
        let fresh = Partition {
            key: "k".into(),
            rows: vec![Row {
                clustering: "r1".into(),
                cells: vec![cell("a", "new", 5)],
            }],
        };
        let stale = Partition {
            key: "k".into(),
            rows: vec![Row {
                clustering: "r1".into(),
                cells: vec![cell("a", "old", 1)],
            }],
        };
        assert!(repair_rows_for(&fresh, &fresh.clone()).is_none());
        let rows = repair_rows_for(&fresh, &stale).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cells[0].value, Some("new".into()));
    }

    #[test]
    fn digest_tracks_content() {
        let p1 = Partition {
            key: "k".into(),
            rows: vec![Row {
                clustering: "r1".into(),
                cells: vec![cell("a", "x", 1)],
            }],
        };
        let mut p2 = p1.clone();
        assert_eq!(content_digest(&p1), content_digest(&p2));
        p2.rows[0].cells[0].timestamp = 2;
        assert_ne!(content_digest(&p1), content_digest(&p2));
    }
}
