//! Atomic batches: a synchronous batchlog write on two local-DC peers,
//! then the member mutations at the user's consistency, then an
//! asynchronous batchlog delete. If the coordinator dies mid-batch the
//! surviving batchlog entry is replayed by the batchlog service.

use std::sync::atomic::Ordering;

use super::collector::WriteHandler;
use super::{Coordinator, BATCHLOG_TABLE, SYSTEM_KEYSPACE};

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::messaging::{ReplicaRequest, Verb, WriteType};
use crate::model::{Cell, Mutation, Row, TableUpdate};
use crate::utils::CoordError;

use rand::seq::SliceRandom;

use uuid::Uuid;

impl Coordinator {
    /// Applies the mutations atomically: either the batch eventually
    /// reaches every row's replicas, or the client gets an error before
    /// any replica write started.
    pub async fn mutate_atomically(
        &self,
        mutations: Vec<Mutation>,
        consistency: ConsistencyLevel,
    ) -> Result<(), CoordError> {
        let result = self
            .mutate_atomically_inner(&mutations, consistency)
            .await;
        if let Err(e) = &result {
            let counters = &self.ctx.metrics.write;
            match e {
                CoordError::Unavailable { .. } | CoordError::Overloaded(_) => {
                    counters.unavailables.fetch_add(1, Ordering::Relaxed);
                }
                CoordError::WriteTimeout { .. } => {
                    counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                CoordError::WriteFailure { .. } => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
        result
    }

    async fn mutate_atomically_inner(
        &self,
        mutations: &[Mutation],
        consistency: ConsistencyLevel,
    ) -> Result<(), CoordError> {
        pf_trace!(self.ctx.me; "determining replicas for atomic batch");
        let ctx = &self.ctx;

        // availability check for every row before anything is written
        let mut wrapped: Vec<(Mutation, WriteHandler)> =
            Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let (natural, pending) =
                ctx.write_endpoints(&mutation.keyspace, mutation.token());
            let handler = WriteHandler::new(
                ctx,
                &mutation.keyspace,
                natural,
                pending,
                consistency,
                WriteType::Batch,
            );
            handler.assure_sufficient_live_nodes(ctx)?;
            wrapped.push((mutation.clone(), handler));
        }

        let batch_id = Uuid::new_v4();
        let batchlog_endpoints = self.batchlog_endpoints(consistency)?;
        self.sync_write_to_batchlog(mutations, &batchlog_endpoints, batch_id)
            .await?;

        // now the writes themselves, then wait on all of them
        for (mutation, handler) in &wrapped {
            self.send_to_hinted_endpoints(
                mutation,
                &handler.all_targets(),
                handler,
            )
            .await?;
        }
        for (_, handler) in &wrapped {
            let outcome = handler
                .await_acks(ctx.rpc_timeout(Verb::Mutation))
                .await;
            handler.conclude(ctx);
            outcome?;
        }

        self.async_remove_from_batchlog(&batchlog_endpoints, batch_id);
        Ok(())
    }

    /// Picks the batchlog replicas: two live local-DC members, preferring
    /// racks other than ours (distinct racks when possible). Self is a
    /// valid target only in a single-node DC; with no candidates at all,
    /// CL=ANY falls back to self and anything else is unavailable.
    fn batchlog_endpoints(
        &self,
        consistency: ConsistencyLevel,
    ) -> Result<Vec<EndpointId>, CoordError> {
        let ctx = &self.ctx;
        let topology = ctx.placement.topology();
        let local_rack = ctx.snitch.rack(ctx.me);
        let mut racks: Vec<(String, Vec<EndpointId>)> = topology
            .racks_of(&ctx.local_dc)
            .into_iter()
            .map(|(rack, members)| {
                let live: Vec<EndpointId> = members
                    .into_iter()
                    .filter(|&ep| !ctx.is_me(ep) && ctx.liveness.is_alive(ep))
                    .collect();
                (rack, live)
            })
            .filter(|(_, live)| !live.is_empty())
            .collect();

        // other racks win over ours when any exist
        if racks.len() > 1 {
            racks.retain(|(rack, _)| *rack != local_rack);
        }

        let mut rng = rand::thread_rng();
        let mut chosen: Vec<EndpointId> = Vec::with_capacity(2);
        racks.shuffle(&mut rng);
        for (_, live) in &racks {
            if chosen.len() == 2 {
                break;
            }
            if let Some(&pick) = live.choose(&mut rng) {
                chosen.push(pick);
            }
        }
        // single usable rack: take a second member from it if one exists
        if chosen.len() == 1 {
            if let Some((_, live)) = racks.first() {
                if let Some(&extra) =
                    live.iter().find(|&&ep| ep != chosen[0])
                {
                    chosen.push(extra);
                }
            }
        }

        if chosen.is_empty() {
            if consistency == ConsistencyLevel::Any {
                return Ok(vec![ctx.me]);
            }
            return Err(CoordError::Unavailable {
                consistency: ConsistencyLevel::One,
                required: 1,
                alive: 0,
            });
        }
        Ok(chosen)
    }

    /// Writes the serialized batch to the batchlog endpoints at CL=ONE
    /// and blocks for the acknowledgement.
    async fn sync_write_to_batchlog(
        &self,
        mutations: &[Mutation],
        endpoints: &[EndpointId],
        batch_id: Uuid,
    ) -> Result<(), CoordError> {
        let ctx = &self.ctx;
        // CL=ONE: a single surviving batchlog copy is enough to replay
        let handler = WriteHandler::with_block_for(
            endpoints.to_vec(),
            ConsistencyLevel::One,
            1,
            WriteType::BatchLog,
        );

        let batch_mutation = batchlog_mutation(mutations, batch_id)?;
        for &target in endpoints {
            if ctx.is_me(target) {
                self.insert_local(batch_mutation.clone(), handler.clone())
                    .await?;
            } else {
                if ctx.messaging.version(target)
                    != crate::messaging::CURRENT_VERSION
                {
                    pf_trace!(ctx.me;
                              "batchlog target {} speaks older protocol",
                              target);
                }
                let cb = handler.register(ctx);
                ctx.messaging.send_rr(
                    ReplicaRequest::Mutation {
                        mutation: batch_mutation.clone(),
                        forward_to: vec![],
                    },
                    target,
                    cb,
                );
            }
        }

        let outcome = handler
            .await_acks(ctx.rpc_timeout(Verb::Mutation))
            .await;
        handler.conclude(ctx);
        outcome
    }

    /// Deletes the batchlog entry once the member writes completed; never
    /// awaited, the replay service tolerates leftovers.
    fn async_remove_from_batchlog(
        &self,
        endpoints: &[EndpointId],
        batch_id: Uuid,
    ) {
        let ctx = &self.ctx;
        let delete = batchlog_delete_mutation(batch_id);
        for &target in endpoints {
            if ctx.is_me(target) {
                let ctx = ctx.clone();
                let delete = delete.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctx.storage.apply(&delete).await {
                        pf_warn!(ctx.me;
                                 "local batchlog delete failed: {}", e);
                    }
                });
            } else {
                ctx.messaging.send_one_way(
                    ReplicaRequest::Mutation {
                        mutation: delete.clone(),
                        forward_to: vec![],
                    },
                    target,
                );
            }
        }
    }
}

/// The batchlog row: the whole batch serialized into one cell of the
/// system batchlog table, keyed by the batch UUID.
fn batchlog_mutation(
    mutations: &[Mutation],
    batch_id: Uuid,
) -> Result<Mutation, CoordError> {
    let serialized = rmp_serde::to_vec(mutations)?;
    Ok(Mutation {
        keyspace: SYSTEM_KEYSPACE.into(),
        key: batch_id.to_string(),
        updates: vec![TableUpdate {
            table: BATCHLOG_TABLE.into(),
            rows: vec![Row {
                clustering: String::new(),
                cells: vec![Cell {
                    column: "data".into(),
                    value: Some(hex_encode(&serialized)),
                    timestamp: now_micros(),
                    local_deletion_time: 0,
                }],
            }],
        }],
    })
}

fn batchlog_delete_mutation(batch_id: Uuid) -> Mutation {
    Mutation {
        keyspace: SYSTEM_KEYSPACE.into(),
        key: batch_id.to_string(),
        updates: vec![TableUpdate {
            table: BATCHLOG_TABLE.into(),
            rows: vec![Row {
                clustering: String::new(),
                cells: vec![Cell {
                    column: "data".into(),
                    value: None,
                    timestamp: now_micros(),
                    local_deletion_time: now_secs(),
                }],
            }],
        }],
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn now_secs() -> i32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i32)
        .unwrap_or(0)
}
