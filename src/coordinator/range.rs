//! Range scan driving: splitting the query range at every ring boundary,
//! merging adjacent pieces that share enough live replicas, and tuning
//! the batch concurrency from observed row counts.

use std::sync::atomic::Ordering;

use super::collector::RangeHandler;
use super::endpoints::intersection;
use super::Coordinator;

use crate::cluster::{ConsistencyLevel, EndpointId, Token};
use crate::messaging::{ReplicaRequest, Verb};
use crate::model::{Partition, RangeReadCommand, TokenRange};
use crate::stage::StageTask;
use crate::utils::CoordError;

use futures::future;

/// One scan piece and the replicas the consistency level may use for it,
/// nearest first.
#[derive(Debug, Clone)]
struct RangeForQuery {
    range: TokenRange,
    filtered: Vec<EndpointId>,
}

impl Coordinator {
    /// Scans a token range at the given consistency, returning reconciled
    /// partitions in sub-range order up to the command's limit.
    pub async fn range_scan(
        &self,
        command: RangeReadCommand,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Partition>, CoordError> {
        let result = self.range_scan_inner(&command, consistency).await;
        match &result {
            Err(CoordError::Unavailable { .. }) => {
                self.ctx
                    .metrics
                    .range
                    .unavailables
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(CoordError::ReadTimeout { .. }) => {
                self.ctx
                    .metrics
                    .range
                    .timeouts
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(CoordError::ReadFailure { .. }) => {
                self.ctx
                    .metrics
                    .range
                    .failures
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        result
    }

    async fn range_scan_inner(
        &self,
        command: &RangeReadCommand,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<Partition>, CoordError> {
        pf_trace!(self.ctx.me; "computing ranges to query");
        let ctx = &self.ctx;

        let pieces = restricted_ranges(
            command.range,
            &ctx.placement.sorted_tokens(),
        );
        let ranges = self.merge_ranges(command, consistency, pieces);
        let total_range_count = ranges.len();

        let (margin, estimated) = {
            let config = ctx.config.read().unwrap();
            (
                config.range_subrequest_margin,
                config.estimated_results_per_range,
            )
        };
        // underestimate rows per range so the first batch more likely
        // fetches enough
        let results_per_range = estimated * (1.0 - margin);
        let mut concurrency = if results_per_range <= 0.0 {
            1
        } else {
            ((command.limit as f64 / results_per_range).ceil() as usize)
                .clamp(1, total_range_count)
        };
        pf_debug!(ctx.me;
                  "scanning {} ranges with initial concurrency {}",
                  total_range_count, concurrency);

        let mut results: Vec<Partition> = Vec::new();
        let mut live_returned = 0usize;
        let mut ranges_queried = 0usize;
        let mut next = 0usize;

        while next < ranges.len() {
            let batch: Vec<&RangeForQuery> =
                ranges[next..].iter().take(concurrency).collect();
            next += batch.len();
            ranges_queried += batch.len();

            let queries = batch
                .iter()
                .map(|piece| self.query_range(command, consistency, piece));
            let batch_results = future::try_join_all(queries).await?;

            for partitions in batch_results {
                live_returned +=
                    partitions.iter().map(|p| p.rows.len()).sum::<usize>();
                results.extend(partitions);
            }

            let total_rows: usize =
                results.iter().map(|p| p.rows.len()).sum();
            if total_rows >= command.limit {
                break;
            }

            // re-tune concurrency from what this batch actually returned
            let remaining_ranges = ranges.len() - next;
            if remaining_ranges == 0 {
                break;
            }
            if live_returned == 0 {
                concurrency = remaining_ranges;
            } else {
                let rows_per_range =
                    live_returned as f64 / ranges_queried as f64;
                let remaining_rows = command.limit - total_rows;
                concurrency = ((remaining_rows as f64 / rows_per_range)
                    .round() as usize)
                    .clamp(1, remaining_ranges);
            }
            pf_debug!(ctx.me;
                      "range scan continuing: {} rows so far, next concurrency {}",
                      total_rows, concurrency);
        }

        enforce_row_limit(&mut results, command.limit);
        Ok(results)
    }

    /// Scans the split pieces in order, merging a piece into its
    /// successor while the intersection of their filtered endpoints
    /// still meets the CL and the snitch judges the merge worthwhile.
    /// Never merges across the ring wrap point.
    fn merge_ranges(
        &self,
        command: &RangeReadCommand,
        consistency: ConsistencyLevel,
        pieces: Vec<TokenRange>,
    ) -> Vec<RangeForQuery> {
        let ctx = &self.ctx;
        let (rf, local_rf) = ctx.replication_factors(&command.keyspace);
        let block_for = consistency.block_for(rf, local_rf) as usize;

        let mut queue: Vec<RangeForQuery> = pieces
            .into_iter()
            .map(|range| {
                let live =
                    ctx.live_sorted_endpoints(&command.keyspace, range.right);
                let filtered = ctx.filter_for_query(&live, consistency);
                RangeForQuery { range, filtered }
            })
            .collect();

        let mut merged: Vec<RangeForQuery> = Vec::with_capacity(queue.len());
        let mut iter = queue.drain(..).peekable();
        while let Some(mut current) = iter.next() {
            loop {
                // the storage engines cannot serve a wrapped scan, so a
                // piece ending at the ring minimum is never extended
                if current.range.right_is_minimum() {
                    break;
                }
                let Some(peeked) = iter.peek() else { break };

                // the CL check runs on the filtered (DC-restricted)
                // replica overlap; the raw live overlap may span DCs a
                // datacenter-local level cannot count
                let filtered_shared =
                    intersection(&current.filtered, &peeked.filtered);
                if filtered_shared.len() < block_for {
                    break;
                }
                if !self.ctx.snitch.is_worth_merging_for_range_query(
                    &filtered_shared,
                    &current.filtered,
                    &peeked.filtered,
                ) {
                    break;
                }

                let consumed = iter.next().unwrap();
                current = RangeForQuery {
                    range: current.range.with_new_right(consumed.range.right),
                    filtered: filtered_shared,
                };
            }
            merged.push(current);
        }
        merged
    }

    /// Executes one sub-range: full-data requests to the closest
    /// blockFor filtered endpoints, reconciled cell-wise by the handler.
    async fn query_range(
        &self,
        command: &RangeReadCommand,
        consistency: ConsistencyLevel,
        piece: &RangeForQuery,
    ) -> Result<Vec<Partition>, CoordError> {
        let ctx = &self.ctx;
        let (rf, local_rf) = ctx.replication_factors(&command.keyspace);
        let block_for = consistency.block_for(rf, local_rf) as u32;
        if (piece.filtered.len() as u32) < block_for {
            return Err(CoordError::Unavailable {
                consistency,
                required: block_for,
                alive: piece.filtered.len() as u32,
            });
        }

        let sub_command = command.for_sub_range(piece.range);
        let contacted: Vec<EndpointId> = piece
            .filtered
            .iter()
            .copied()
            .take(block_for as usize)
            .collect();
        let handler =
            RangeHandler::new(contacted.len() as u32, consistency, block_for);

        for &endpoint in &contacted {
            if ctx.is_me(endpoint) {
                let job_ctx = ctx.clone();
                let job_command = sub_command.clone();
                let job_handler = handler.clone();
                let timeout = ctx.rpc_timeout(Verb::RangeRead);
                let drop_ctx = ctx.clone();
                ctx.stages
                    .read
                    .submit(
                        StageTask::new(Verb::RangeRead, timeout, async move {
                            match job_ctx.storage.scan(&job_command).await {
                                Ok(partitions) => job_handler
                                    .record_data(job_ctx.me, partitions),
                                Err(e) => {
                                    pf_error!(job_ctx.me;
                                              "local range read failed: {}", e);
                                    job_handler.record_failure(job_ctx.me);
                                }
                            }
                        })
                        .with_on_drop(move |verb| {
                            drop_ctx.messaging.increment_dropped(verb);
                        }),
                    )
                    .await?;
            } else {
                let cb = handler.register(ctx);
                ctx.messaging.send_rr(
                    ReplicaRequest::RangeRead {
                        command: sub_command.clone(),
                    },
                    endpoint,
                    cb,
                );
            }
        }

        let outcome = handler
            .await_partitions(ctx.rpc_timeout(Verb::RangeRead))
            .await;
        handler.conclude(ctx);
        outcome
    }
}

/// Breaks the query range at every ring token inside it, so each piece
/// targets exactly one replica set. The union of pieces equals the query
/// range and no two pieces overlap.
pub(crate) fn restricted_ranges(
    query: TokenRange,
    ring: &[Token],
) -> Vec<TokenRange> {
    if ring.is_empty() {
        return vec![query];
    }

    let mut ranges = Vec::new();
    let mut remainder = query;
    let start = ring.partition_point(|&t| t <= query.left);
    let walk = ring[start..].iter().chain(ring[..start].iter()).copied();

    for token in walk {
        if remainder.left != token && !remainder.contains(token) {
            break; // no more splits
        }
        if let Some((head, tail)) = remainder.split(token) {
            ranges.push(head);
            remainder = tail;
        }
    }
    ranges.push(remainder);
    ranges
}

fn enforce_row_limit(partitions: &mut Vec<Partition>, limit: usize) {
    let mut budget = limit;
    for partition in partitions.iter_mut() {
        let keep = budget.min(partition.rows.len());
        partition.rows.truncate(keep);
        budget -= keep;
    }
    partitions.retain(|p| !p.is_empty());
}
