//! Single- and multi-partition read execution: closest-replica data plus
//! digest requests, speculative retries, digest-mismatch repair, and
//! short-read protection.

use std::sync::atomic::Ordering;

use super::collector::ReadHandler;
use super::{Coordinator, SYSTEM_KEYSPACE};

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::messaging::{ReplicaRequest, Verb};
use crate::model::{content_digest, reconcile, repair_rows_for, Mutation, Partition, ReadCommand, Row, TableUpdate};
use crate::stage::StageTask;
use crate::storage::StorageError;
use crate::utils::CoordError;

use futures::future;

use tokio::time::{self, Instant};

impl Coordinator {
    /// Reads one partition at the given consistency.
    pub async fn read_one(
        &self,
        command: ReadCommand,
        consistency: ConsistencyLevel,
    ) -> Result<Partition, CoordError> {
        let mut results = self.read(vec![command], consistency, None).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Reads a group of partitions. Serial levels drive a Paxos
    /// prepare/repair round before a quorum read; `group_limit` caps the
    /// total row count across partitions.
    pub async fn read(
        &self,
        commands: Vec<ReadCommand>,
        consistency: ConsistencyLevel,
        group_limit: Option<usize>,
    ) -> Result<Vec<Partition>, CoordError> {
        if self.ctx.bootstrapping.load(Ordering::Acquire)
            && commands.iter().any(|c| c.keyspace != SYSTEM_KEYSPACE)
        {
            self.ctx
                .metrics
                .read
                .unavailables
                .fetch_add(1, Ordering::Relaxed);
            return Err(CoordError::IsBootstrapping);
        }

        let result = if consistency.is_serial() {
            self.read_with_paxos(commands, consistency).await
        } else {
            self.read_regular(commands, consistency).await
        };

        match result {
            Ok(mut partitions) => {
                if let Some(limit) = group_limit {
                    enforce_group_limit(&mut partitions, limit);
                }
                Ok(partitions)
            }
            Err(e) => {
                match &e {
                    CoordError::Unavailable { .. } => {
                        self.ctx
                            .metrics
                            .read
                            .unavailables
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    CoordError::ReadTimeout { .. } => {
                        self.ctx
                            .metrics
                            .read
                            .timeouts
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    CoordError::ReadFailure { .. } => {
                        self.ctx
                            .metrics
                            .read
                            .failures
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn read_regular(
        &self,
        commands: Vec<ReadCommand>,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Partition>, CoordError> {
        let lifecycles = commands
            .iter()
            .map(|command| self.single_partition_read(command, consistency));
        future::try_join_all(lifecycles).await
    }

    /// One partition's full read lifecycle, including short-read retries.
    pub(crate) async fn single_partition_read(
        &self,
        command: &ReadCommand,
        consistency: ConsistencyLevel,
    ) -> Result<Partition, CoordError> {
        let start = Instant::now();
        let limit = command.limit;
        let mut rows: Vec<Row> = Vec::new();
        let mut round = command.clone();

        loop {
            let (partition, replica_page_full) =
                self.execute_read_round(&round, consistency).await?;
            let got_rows = !partition.rows.is_empty();
            // the follow-up bound must advance past dead rows too, or a
            // tombstoned prefix would loop forever
            let last_seen =
                partition.rows.last().map(|r| r.clustering.clone());
            rows.extend(
                partition
                    .rows
                    .into_iter()
                    .filter(Row::is_live)
                    .take(limit.saturating_sub(rows.len())),
            );

            if rows.len() >= limit || !replica_page_full || !got_rows {
                break;
            }
            // a replica filled its page while we are still short of live
            // rows: more may exist past the last clustering we saw
            let bound = last_seen.unwrap_or_default();
            round = command.with_lower_bound(bound, limit - rows.len());
            pf_trace!(self.ctx.me; "short read on {}, refetching past {:?}",
                                   command.key, round.lower_bound);
        }

        self.ctx.latencies.record(
            &command.keyspace,
            &command.table,
            start.elapsed(),
        );
        Ok(Partition {
            key: command.key.clone(),
            rows,
        })
    }

    /// One data+digest round, resolving digest mismatches with a blocking
    /// full-data read and asynchronous repair write-backs. The second
    /// return value reports whether any replica filled its page (a
    /// short-read signal).
    async fn execute_read_round(
        &self,
        command: &ReadCommand,
        consistency: ConsistencyLevel,
    ) -> Result<(Partition, bool), CoordError> {
        let ctx = &self.ctx;
        let token = crate::model::token_of(&command.key);
        let live = ctx.live_sorted_endpoints(&command.keyspace, token);
        let filtered = ctx.filter_for_query(&live, consistency);

        let (rf, local_rf) = ctx.replication_factors(&command.keyspace);
        let block_for = consistency.block_for(rf, local_rf) as u32;
        if (filtered.len() as u32) < block_for {
            return Err(CoordError::Unavailable {
                consistency,
                required: block_for,
                alive: filtered.len() as u32,
            });
        }

        let contacted: Vec<EndpointId> =
            filtered.iter().copied().take(block_for as usize).collect();
        let handler =
            ReadHandler::new(contacted.clone(), consistency, block_for);

        // closest replica gets the data request, the rest digests
        for (i, &endpoint) in contacted.iter().enumerate() {
            self.dispatch_read(command, endpoint, i > 0, &handler).await?;
        }

        self.maybe_speculative_retry(command, &filtered, &contacted, &handler);

        let outcome = handler
            .await_responses(ctx.rpc_timeout(Verb::Read))
            .await;
        if let Err(e) = outcome {
            handler.conclude(ctx);
            return Err(e);
        }

        if handler.digests_consistent() {
            handler.conclude(ctx);
            let responses = handler.data_responses();
            let page_full = responses
                .iter()
                .any(|(_, p)| p.rows.len() >= command.limit);
            let data = responses
                .into_iter()
                .next()
                .map(|(_, p)| p)
                .unwrap_or_default();
            return Ok((data, page_full));
        }

        // digest mismatch: full data read from every contacted replica,
        // blocking only on the reconciled result; repairs flow back
        // asynchronously
        pf_debug!(ctx.me; "digest mismatch on key {}, repairing", command.key);
        handler.conclude(ctx);
        ctx.metrics
            .read_repair_attempted
            .fetch_add(1, Ordering::Relaxed);
        self.repair_on_digest_mismatch(command, consistency, &contacted, block_for)
            .await
    }

    async fn repair_on_digest_mismatch(
        &self,
        command: &ReadCommand,
        consistency: ConsistencyLevel,
        contacted: &[EndpointId],
        block_for: u32,
    ) -> Result<(Partition, bool), CoordError> {
        let ctx = &self.ctx;
        let repair_handler = ReadHandler::new(
            contacted.to_vec(),
            consistency,
            contacted.len() as u32,
        );
        for &endpoint in contacted {
            self.dispatch_read(command, endpoint, false, &repair_handler)
                .await?;
        }

        let outcome = repair_handler
            .await_responses(ctx.rpc_timeout(Verb::Read))
            .await;
        repair_handler.conclude(ctx);
        if let Err(e) = outcome {
            return Err(match e {
                // report at the original consistency; the repair round's
                // widened blockFor would mislead the client
                CoordError::ReadTimeout { .. } => CoordError::ReadTimeout {
                    consistency,
                    received: block_for.saturating_sub(1),
                    block_for,
                    data_present: true,
                },
                other => other,
            });
        }
        ctx.metrics
            .read_repair_repaired_blocking
            .fetch_add(1, Ordering::Relaxed);

        let responses = repair_handler.data_responses();
        let page_full = responses
            .iter()
            .any(|(_, p)| p.rows.len() >= command.limit);
        let versions: Vec<&Partition> =
            responses.iter().map(|(_, p)| p).collect();
        let reconciled = reconcile(&command.key, &versions);

        // write back to the replicas that were behind, without blocking
        // the client response on their acknowledgements
        for (endpoint, version) in &responses {
            if let Some(rows) = repair_rows_for(&reconciled, version) {
                let repair = Mutation {
                    keyspace: command.keyspace.clone(),
                    key: command.key.clone(),
                    updates: vec![TableUpdate {
                        table: command.table.clone(),
                        rows,
                    }],
                };
                if ctx.is_me(*endpoint) {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = ctx.storage.apply(&repair).await {
                            pf_warn!(ctx.me; "local repair apply failed: {}", e);
                        }
                    });
                } else {
                    ctx.messaging.send_one_way(
                        ReplicaRequest::Mutation {
                            mutation: repair,
                            forward_to: vec![],
                        },
                        *endpoint,
                    );
                }
                ctx.metrics
                    .read_repair_repaired_background
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok((reconciled, page_full))
    }

    /// Sends one read request, executing locally on the read stage when
    /// the target is this node.
    async fn dispatch_read(
        &self,
        command: &ReadCommand,
        endpoint: EndpointId,
        digest_only: bool,
        handler: &ReadHandler,
    ) -> Result<(), CoordError> {
        let ctx = &self.ctx;
        if ctx.is_me(endpoint) {
            let job_ctx = ctx.clone();
            let job_command = command.clone();
            let job_handler = handler.clone();
            let timeout = ctx.rpc_timeout(Verb::Read);
            let drop_ctx = ctx.clone();
            let task = StageTask::new(Verb::Read, timeout, async move {
                match job_ctx.storage.read(&job_command).await {
                    Ok(partition) => {
                        if digest_only {
                            let digest = content_digest(&partition);
                            job_handler.record_digest(job_ctx.me, digest);
                        } else {
                            job_handler.record_data(job_ctx.me, partition);
                        }
                    }
                    Err(StorageError::TombstoneOverwhelming(m)) => {
                        pf_error!(job_ctx.me; "tombstone overwhelming: {}", m);
                        job_handler
                            .record_fatal(CoordError::TombstoneOverwhelming(m));
                    }
                    Err(e) => {
                        pf_error!(job_ctx.me; "local read failed: {}", e);
                        job_handler.record_failure(job_ctx.me);
                    }
                }
            })
            .with_on_drop(move |verb| {
                drop_ctx.messaging.increment_dropped(verb);
            });
            ctx.stages.read.submit(task).await
        } else {
            let cb = handler.register(ctx);
            ctx.messaging.send_rr(
                ReplicaRequest::Read {
                    command: command.clone(),
                    digest_only,
                },
                endpoint,
                cb,
            );
            Ok(())
        }
    }

    /// Arms one extra data request that fires if the initial quorum is
    /// still pending after the table's latency percentile.
    fn maybe_speculative_retry(
        &self,
        command: &ReadCommand,
        filtered: &[EndpointId],
        contacted: &[EndpointId],
        handler: &ReadHandler,
    ) {
        let ctx = &self.ctx;
        let (enabled, percentile) = {
            let config = ctx.config.read().unwrap();
            (
                config.speculative_retry_enabled,
                config.speculative_retry_percentile,
            )
        };
        if !enabled || filtered.len() <= contacted.len() {
            return;
        }
        let extra = filtered[contacted.len()];
        let delay = ctx
            .latencies
            .percentile(&command.keyspace, &command.table, percentile)
            .unwrap_or_else(|| ctx.rpc_timeout(Verb::Read) / 2);

        let this = self.clone();
        let command = command.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if handler.is_finished() {
                return;
            }
            pf_trace!(this.ctx.me; "speculating read retry to {}", extra);
            handler.note_extra_contact(extra);
            if let Err(e) = this
                .dispatch_read(&command, extra, false, &handler)
                .await
            {
                pf_warn!(this.ctx.me; "speculative retry failed: {}", e);
            }
        });
    }
}

/// Truncates partitions so their total row count honors the group limit.
fn enforce_group_limit(partitions: &mut Vec<Partition>, limit: usize) {
    let mut budget = limit;
    for partition in partitions.iter_mut() {
        let keep = budget.min(partition.rows.len());
        partition.rows.truncate(keep);
        budget -= keep;
    }
    partitions.retain(|p| !p.is_empty());
}
