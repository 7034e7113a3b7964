//! Leaderless Paxos driving for lightweight transactions: prepare, a
//! quorum read of current values, propose, and commit, with in-progress
//! round repair and jittered contention retries. Any node may propose
//! for any partition; the cohort is only that partition's replicas.

use std::sync::atomic::Ordering;

use super::collector::{PrepareHandler, ProposeHandler, WriteHandler};
use super::Coordinator;

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::messaging::{ReplicaRequest, Verb, WriteType};
use crate::model::{Ballot, Cell, Commit, Mutation, Partition, ReadCommand, TableUpdate};
use crate::utils::CoordError;

use rand::Rng;

use tokio::time::{self, Duration, Instant};

/// One cell-level precondition of a conditional update. `expected ==
/// None` requires the cell to be absent (or deleted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellCondition {
    pub clustering: String,
    pub column: String,
    pub expected: Option<String>,
}

/// A compare-and-swap: preconditions over the current partition state
/// plus the rows to write when they hold.
#[derive(Debug, Clone)]
pub struct CasRequest {
    /// The read used to fetch current values (and returned to the caller
    /// when the precondition fails).
    pub read: ReadCommand,

    pub conditions: Vec<CellCondition>,

    /// Rows to apply on success; cell timestamps are replaced by the
    /// winning ballot's timestamp.
    pub updates: Vec<TableUpdate>,
}

impl CasRequest {
    /// Evaluates the preconditions against the current partition state.
    pub fn applies_to(&self, current: &Partition) -> bool {
        self.conditions.iter().all(|cond| {
            let cell = current
                .rows
                .iter()
                .find(|r| r.clustering == cond.clustering)
                .and_then(|r| {
                    r.cells.iter().find(|c| c.column == cond.column)
                });
            match (&cond.expected, cell) {
                (None, None) => true,
                (None, Some(c)) => c.value.is_none(),
                (Some(_), None) => false,
                (Some(want), Some(c)) => c.value.as_ref() == Some(want),
            }
        })
    }

    /// The update to propose, stamped with the ballot's timestamp.
    fn make_updates(&self, ballot: Ballot) -> Mutation {
        let updates = self
            .updates
            .iter()
            .map(|tu| TableUpdate {
                table: tu.table.clone(),
                rows: tu
                    .rows
                    .iter()
                    .map(|row| crate::model::Row {
                        clustering: row.clustering.clone(),
                        cells: row
                            .cells
                            .iter()
                            .map(|cell| Cell {
                                timestamp: ballot.micros as i64,
                                ..cell.clone()
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Mutation {
            keyspace: self.read.keyspace.clone(),
            key: self.read.key.clone(),
            updates,
        }
    }
}

/// What one prepare round told the driver to do next. Transitions are
/// data, not control-flow exceptions.
enum PrepareOutcome {
    /// Quorum promised; safe to read and propose under this ballot.
    Promised(Ballot),

    /// A replica had promised a higher ballot; back off and retry above
    /// the observed floor.
    Preempted { floor_micros: u64 },

    /// A prior proposal was accepted but never learned; finish it first.
    FinishPrior(Commit),

    /// Some quorum replicas have not learned the latest commit; repair
    /// them fire-and-forget and re-prepare.
    RepairMrc {
        commit: Commit,
        missing: Vec<EndpointId>,
    },
}

impl Coordinator {
    /// Applies `request.updates` iff the current values match
    /// `request.conditions`, linearized through Paxos. Returns `None` on
    /// success, or the current values when the precondition fails.
    pub async fn cas(
        &self,
        request: CasRequest,
        consistency_paxos: ConsistencyLevel,
        consistency_commit: ConsistencyLevel,
    ) -> Result<Option<Partition>, CoordError> {
        let start = Instant::now();
        let mut contentions: u64 = 0;
        let result = self
            .cas_inner(
                &request,
                consistency_paxos,
                consistency_commit,
                start,
                &mut contentions,
            )
            .await;

        if contentions > 0 {
            self.ctx
                .metrics
                .cas_write
                .contention
                .fetch_add(contentions, Ordering::Relaxed);
        }
        if let Err(e) = &result {
            let counters = &self.ctx.metrics.cas_write.base;
            match e {
                CoordError::WriteTimeout { .. }
                | CoordError::ReadTimeout { .. } => {
                    counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                CoordError::WriteFailure { .. }
                | CoordError::ReadFailure { .. } => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                }
                CoordError::Unavailable { .. } => {
                    counters.unavailables.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        result
    }

    async fn cas_inner(
        &self,
        request: &CasRequest,
        consistency_paxos: ConsistencyLevel,
        consistency_commit: ConsistencyLevel,
        start: Instant,
        contentions: &mut u64,
    ) -> Result<Option<Partition>, CoordError> {
        consistency_paxos.validate_for_cas()?;
        consistency_commit.validate_for_cas_commit()?;

        let ctx = &self.ctx;
        let keyspace = &request.read.keyspace;
        let token = crate::model::token_of(&request.read.key);
        let budget = ctx.rpc_timeout(Verb::PaxosPrepare);

        while start.elapsed() < budget {
            // one liveness snapshot per attempt
            let (participants, required) =
                ctx.paxos_participants(keyspace, token, consistency_paxos)?;

            let ballot = self
                .begin_and_repair_paxos(
                    start,
                    keyspace,
                    &request.read.key,
                    &participants,
                    required,
                    consistency_paxos,
                    consistency_commit,
                    true,
                    contentions,
                )
                .await?;

            // read current values and check the precondition
            pf_trace!(ctx.me; "reading existing values for CAS precondition");
            let read_cl = commit_or_fetch_level(consistency_paxos);
            let current = self
                .single_partition_read(&request.read, read_cl)
                .await?;
            if !request.applies_to(&current) {
                pf_trace!(ctx.me; "CAS precondition does not match current values");
                ctx.metrics
                    .cas_write
                    .condition_not_met
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(Some(current));
            }

            // finish the round with the client-requested updates
            let proposal =
                Commit::new_proposal(ballot, request.make_updates(ballot));
            pf_trace!(ctx.me; "CAS precondition met, proposing under {}",
                              ballot);
            if self
                .propose_paxos(
                    &proposal,
                    &participants,
                    required,
                    true,
                    consistency_paxos,
                )
                .await?
            {
                self.commit_paxos(&proposal, consistency_commit).await?;
                pf_debug!(ctx.me; "CAS successful at {}", ballot);
                return Ok(None);
            }

            pf_trace!(ctx.me; "paxos proposal preempted by a higher ballot");
            *contentions += 1;
            sleep_contention_jitter().await;
        }

        Err(self.cas_timeout(keyspace, consistency_paxos))
    }

    /// The prepare/repair loop: obtains a promised ballot after finishing
    /// any incomplete prior round and repairing replicas that missed the
    /// most recent commit.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn begin_and_repair_paxos(
        &self,
        start: Instant,
        keyspace: &str,
        key: &str,
        participants: &[EndpointId],
        required: usize,
        consistency_paxos: ConsistencyLevel,
        consistency_commit: ConsistencyLevel,
        is_write: bool,
        contentions: &mut u64,
    ) -> Result<Ballot, CoordError> {
        let ctx = &self.ctx;
        let budget = ctx.rpc_timeout(Verb::PaxosPrepare);

        let mut floor_micros: u64 = 0;
        while start.elapsed() < budget {
            let ballot = ctx.ballots.next(floor_micros);
            pf_trace!(ctx.me; "preparing {}", ballot);

            let outcome = self
                .prepare_paxos(key, ballot, participants, required, consistency_paxos)
                .await?;
            match outcome {
                PrepareOutcome::Promised(ballot) => return Ok(ballot),

                PrepareOutcome::Preempted { floor_micros: seen } => {
                    pf_trace!(ctx.me;
                              "some replicas promised a higher ballot, retrying");
                    floor_micros = floor_micros.max(seen + 1);
                    *contentions += 1;
                    sleep_contention_jitter().await;
                }

                PrepareOutcome::FinishPrior(in_progress) => {
                    pf_trace!(ctx.me; "finishing incomplete paxos round {}",
                                      in_progress.ballot);
                    let counter = if is_write {
                        &ctx.metrics.cas_write.unfinished_commit
                    } else {
                        &ctx.metrics.cas_read.unfinished_commit
                    };
                    counter.fetch_add(1, Ordering::Relaxed);

                    let refreshed = Commit::new_proposal(
                        ballot,
                        in_progress.update.clone().unwrap_or_else(|| Mutation {
                            keyspace: String::new(),
                            key: key.to_string(),
                            updates: vec![],
                        }),
                    );
                    // refreshing a prior proposal tolerates partial refusal
                    if self
                        .propose_paxos(
                            &refreshed,
                            participants,
                            required,
                            false,
                            consistency_paxos,
                        )
                        .await?
                    {
                        if let Err(e) =
                            self.commit_paxos(&refreshed, consistency_commit).await
                        {
                            // still preparing the client's round, so a
                            // commit timeout here is a CAS timeout
                            return Err(match e {
                                CoordError::WriteTimeout {
                                    consistency,
                                    received,
                                    block_for,
                                    ..
                                } => CoordError::WriteTimeout {
                                    write_type: WriteType::Cas,
                                    consistency,
                                    received,
                                    block_for,
                                },
                                other => other,
                            });
                        }
                    } else {
                        *contentions += 1;
                        sleep_contention_jitter().await;
                    }
                }

                PrepareOutcome::RepairMrc { commit, missing } => {
                    pf_trace!(ctx.me;
                              "repairing {} replicas that missed the most recent commit",
                              missing.len());
                    // fire-and-forget; the next prepare round re-observes
                    self.send_commit(&commit, &missing);
                }
            }
        }

        Err(self.cas_timeout(keyspace, consistency_paxos))
    }

    async fn prepare_paxos(
        &self,
        key: &str,
        ballot: Ballot,
        participants: &[EndpointId],
        required: usize,
        consistency: ConsistencyLevel,
    ) -> Result<PrepareOutcome, CoordError> {
        let ctx = &self.ctx;
        let prepare = Commit::new_prepare(key.to_string(), ballot);
        let handler = PrepareHandler::new(required as u32);
        for &endpoint in participants {
            let cb = handler.register(ctx);
            ctx.messaging.send_rr(
                ReplicaRequest::PaxosPrepare {
                    commit: prepare.clone(),
                },
                endpoint,
                cb,
            );
        }

        let summary = handler
            .await_summary(ctx.rpc_timeout(Verb::PaxosPrepare), consistency)
            .await;
        handler.conclude(ctx);
        let summary = summary?;

        if !summary.promised {
            let floor = summary
                .in_progress
                .as_ref()
                .map(|c| c.ballot.micros)
                .unwrap_or(ballot.micros);
            return Ok(PrepareOutcome::Preempted {
                floor_micros: floor,
            });
        }

        // an accepted-but-unlearned proposal newer than the quorum's MRC
        // must be finished before anything new is proposed
        if let Some(in_progress) = &summary.in_progress_with_update {
            if in_progress.is_after(&summary.most_recent_commit) {
                return Ok(PrepareOutcome::FinishPrior(in_progress.clone()));
            }
        }

        if !summary.missing_mrc.is_empty() {
            if let Some(commit) = &summary.most_recent_commit {
                return Ok(PrepareOutcome::RepairMrc {
                    commit: commit.clone(),
                    missing: summary.missing_mrc,
                });
            }
        }

        Ok(PrepareOutcome::Promised(ballot))
    }

    /// Sends accept requests; `true` when a quorum accepted. A partial
    /// refusal raises a CAS write-timeout when `timeout_if_partial` (the
    /// client round), but is tolerable when refreshing a prior proposal.
    async fn propose_paxos(
        &self,
        proposal: &Commit,
        participants: &[EndpointId],
        required: usize,
        timeout_if_partial: bool,
        consistency: ConsistencyLevel,
    ) -> Result<bool, CoordError> {
        let ctx = &self.ctx;
        let handler =
            ProposeHandler::new(participants.len() as u32, required as u32);
        for &endpoint in participants {
            let cb = handler.register(ctx);
            ctx.messaging.send_rr(
                ReplicaRequest::PaxosPropose {
                    commit: proposal.clone(),
                },
                endpoint,
                cb,
            );
        }

        let summary = handler
            .await_summary(ctx.rpc_timeout(Verb::PaxosPropose), consistency)
            .await;
        handler.conclude(ctx);
        let summary = summary?;

        if handler.is_accepted(&summary) {
            return Ok(true);
        }
        if timeout_if_partial && !summary.fully_refused() {
            return Err(CoordError::WriteTimeout {
                write_type: WriteType::Cas,
                consistency,
                received: summary.accepts,
                block_for: required as u32,
            });
        }
        Ok(false)
    }

    /// Learns the decided proposal on natural plus pending replicas. At
    /// commit consistency ANY nothing blocks; otherwise acknowledgements
    /// are awaited like a plain write. A timeout leaves a minority
    /// divergent; later Paxos rounds repair them through the MRC check.
    async fn commit_paxos(
        &self,
        proposal: &Commit,
        consistency: ConsistencyLevel,
    ) -> Result<(), CoordError> {
        let ctx = &self.ctx;
        let keyspace = proposal
            .update
            .as_ref()
            .map(|m| m.keyspace.clone())
            .unwrap_or_default();
        let token = crate::model::token_of(&proposal.key);
        let (natural, pending) = ctx.write_endpoints(&keyspace, token);

        let should_block = consistency != ConsistencyLevel::Any;
        let handler = should_block.then(|| {
            WriteHandler::new(
                ctx,
                &keyspace,
                natural.clone(),
                pending.clone(),
                consistency,
                WriteType::Simple,
            )
        });

        for destination in natural.into_iter().chain(pending) {
            if !ctx.liveness.is_alive(destination) {
                continue;
            }
            match &handler {
                Some(handler) => {
                    let cb = handler.register(ctx);
                    ctx.messaging.send_rr(
                        ReplicaRequest::PaxosCommit {
                            commit: proposal.clone(),
                        },
                        destination,
                        cb,
                    );
                }
                None => ctx.messaging.send_one_way(
                    ReplicaRequest::PaxosCommit {
                        commit: proposal.clone(),
                    },
                    destination,
                ),
            }
        }

        if let Some(handler) = handler {
            let outcome = handler
                .await_acks(ctx.rpc_timeout(Verb::Mutation))
                .await;
            handler.conclude(ctx);
            outcome?;
        }
        Ok(())
    }

    /// Fire-and-forget commit used when repairing replicas that missed
    /// the most recent commit.
    fn send_commit(&self, commit: &Commit, replicas: &[EndpointId]) {
        for &endpoint in replicas {
            self.ctx.messaging.send_one_way(
                ReplicaRequest::PaxosCommit {
                    commit: commit.clone(),
                },
                endpoint,
            );
        }
    }

    /// Serial read: completes any in-progress Paxos round, then performs
    /// a quorum read of committed values.
    pub(crate) async fn read_with_paxos(
        &self,
        commands: Vec<ReadCommand>,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Partition>, CoordError> {
        if commands.len() != 1 {
            return Err(CoordError::InvalidRequest(
                "serial consistency may only be requested for one \
                 partition at a time"
                    .into(),
            ));
        }
        let ctx = &self.ctx;
        let command = &commands[0];
        let start = Instant::now();
        let token = crate::model::token_of(&command.key);
        let fetch_cl = commit_or_fetch_level(consistency);

        let (participants, required) = ctx
            .paxos_participants(&command.keyspace, token, consistency)
            .inspect_err(|_| {
                ctx.metrics
                    .cas_read
                    .base
                    .unavailables
                    .fetch_add(1, Ordering::Relaxed);
            })?;

        let mut contentions: u64 = 0;
        let repaired = self
            .begin_and_repair_paxos(
                start,
                &command.keyspace,
                &command.key,
                &participants,
                required,
                consistency,
                fetch_cl,
                false,
                &mut contentions,
            )
            .await;
        if contentions > 0 {
            ctx.metrics
                .cas_read
                .contention
                .fetch_add(contentions, Ordering::Relaxed);
        }
        if let Err(e) = repaired {
            let (rf, local_rf) = ctx.replication_factors(&command.keyspace);
            let block_for = consistency.block_for(rf, local_rf) as u32;
            return Err(match e {
                CoordError::WriteTimeout { .. } => {
                    ctx.metrics
                        .cas_read
                        .base
                        .timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    CoordError::ReadTimeout {
                        consistency,
                        received: 0,
                        block_for,
                        data_present: false,
                    }
                }
                CoordError::WriteFailure {
                    received, failures, ..
                } => {
                    ctx.metrics
                        .cas_read
                        .base
                        .failures
                        .fetch_add(1, Ordering::Relaxed);
                    CoordError::ReadFailure {
                        consistency,
                        received,
                        block_for,
                        failures,
                        data_present: false,
                    }
                }
                other => other,
            });
        }

        self.read_regular(commands, fetch_cl).await
    }

    fn cas_timeout(
        &self,
        keyspace: &str,
        consistency: ConsistencyLevel,
    ) -> CoordError {
        let (rf, local_rf) = self.ctx.replication_factors(keyspace);
        CoordError::WriteTimeout {
            write_type: WriteType::Cas,
            consistency,
            received: 0,
            block_for: consistency.block_for(rf, local_rf) as u32,
        }
    }

}

/// Commit/fetch consistency matching the Paxos level's scope.
fn commit_or_fetch_level(consistency: ConsistencyLevel) -> ConsistencyLevel {
    if consistency == ConsistencyLevel::LocalSerial {
        ConsistencyLevel::LocalQuorum
    } else {
        ConsistencyLevel::Quorum
    }
}

/// Uniform 0..100ms backoff giving a competing proposer room to finish.
async fn sleep_contention_jitter() {
    let ms = rand::thread_rng().gen_range(0..100);
    time::sleep(Duration::from_millis(ms)).await;
}
