//! Paxos ballots, commits, and the per-key acceptor state machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::model::Mutation;

use get_size::GetSize;

use rand::Rng;

use serde::{Deserialize, Serialize};

/// Paxos proposal number: a microsecond wall-clock timestamp plus
/// node-unique entropy, 16 bytes total, totally ordered, strictly
/// increasing per coordinator.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Copy,
    Clone,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Ballot {
    pub micros: u64,
    pub entropy: u64,
}

impl Ballot {
    /// The null ballot, smaller than every real one.
    pub const fn null() -> Self {
        Ballot {
            micros: 0,
            entropy: 0,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.micros == 0 && self.entropy == 0
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:x}", self.micros, self.entropy)
    }
}

/// Issues ballots whose timestamps never repeat or decrease on this
/// node, even when the wall clock stalls or a floor from an observed
/// in-progress ballot must be respected.
#[derive(Debug)]
pub struct BallotClock {
    /// Node-unique entropy baked into every issued ballot.
    entropy: u64,

    /// Last issued timestamp in microseconds.
    last_micros: AtomicU64,
}

impl BallotClock {
    pub fn new(node_index: u8) -> Self {
        let noise: u64 = rand::thread_rng().gen();
        BallotClock {
            // node index in the top byte keeps concurrent proposers
            // distinct even on timestamp collision
            entropy: ((node_index as u64 + 1) << 56) | (noise >> 8),
            last_micros: AtomicU64::new(0),
        }
    }

    /// Next ballot, at least `floor_micros` and strictly greater than any
    /// ballot issued before on this node.
    pub fn next(&self, floor_micros: u64) -> Ballot {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1).max(floor_micros);
            match self.last_micros.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ballot {
                        micros: next,
                        entropy: self.entropy,
                    }
                }
                Err(seen) => prev = seen,
            }
        }
    }
}

/// A Paxos commit: ballot plus the partition update being agreed on.
/// Prepare commits carry no update.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize,
)]
pub struct Commit {
    pub ballot: Ballot,
    pub key: String,
    pub update: Option<Mutation>,
}

impl Commit {
    /// A prepare-phase commit with an empty update.
    pub fn new_prepare(key: String, ballot: Ballot) -> Self {
        Commit {
            ballot,
            key,
            update: None,
        }
    }

    /// A proposal carrying the update to apply.
    pub fn new_proposal(ballot: Ballot, update: Mutation) -> Self {
        Commit {
            ballot,
            key: update.key.clone(),
            update: Some(update),
        }
    }

    #[inline]
    pub fn is_after(&self, other: &Option<Commit>) -> bool {
        match other {
            None => !self.ballot.is_null(),
            Some(c) => self.ballot > c.ballot,
        }
    }
}

/// Per-partition-key Paxos acceptor state. Maintains
/// `promised >= accepted.ballot >= most_recent_commit.ballot` whenever
/// each exists; never accepts a proposal below the promise.
#[derive(Debug, Default, Clone)]
pub struct AcceptorState {
    pub promised: Ballot,
    pub accepted: Option<Commit>,
    pub most_recent_commit: Option<Commit>,
}

impl AcceptorState {
    pub fn new() -> Self {
        AcceptorState {
            promised: Ballot::null(),
            accepted: None,
            most_recent_commit: None,
        }
    }

    /// Handles a prepare: promise iff the ballot beats the current
    /// promise. The reply always exposes the accepted proposal and the
    /// most recent commit so the coordinator can repair prior rounds.
    pub fn prepare(
        &mut self,
        ballot: Ballot,
    ) -> (bool, Option<Commit>, Option<Commit>) {
        let promised = ballot > self.promised;
        if promised {
            self.promised = ballot;
        }
        (
            promised,
            self.accepted.clone(),
            self.most_recent_commit.clone(),
        )
    }

    /// Handles an accept: succeeds iff the proposal's ballot is not below
    /// the promise.
    pub fn accept(&mut self, proposal: &Commit) -> bool {
        if proposal.ballot >= self.promised {
            self.promised = proposal.ballot;
            self.accepted = Some(proposal.clone());
            true
        } else {
            false
        }
    }

    /// Learns a commit: clears any acceptance the commit supersedes and
    /// advances the most recent commit.
    pub fn learn(&mut self, commit: &Commit) {
        if let Some(accepted) = &self.accepted {
            if commit.ballot >= accepted.ballot {
                self.accepted = None;
            }
        }
        if commit.is_after(&self.most_recent_commit) {
            self.most_recent_commit = Some(commit.clone());
        }
    }
}
