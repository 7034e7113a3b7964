//! Write dispatch: routes mutations to local apply plus remote sends with
//! per-datacenter bundled forwarding, hints the unreachable, and drives
//! counter writes through their leader replica.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use super::collector::WriteHandler;
use super::Coordinator;

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::messaging::{ReplicaRequest, Verb, WriteType};
use crate::model::Mutation;
use crate::stage::StageTask;
use crate::utils::CoordError;

use get_size::GetSize;

use rand::Rng;

/// A client write: either a regular mutation or a counter update.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    Standard(Mutation),
    Counter(Mutation),
}

/// How a write's fan-out is performed. Replaces per-performer dynamic
/// dispatch on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritePerformer {
    /// Plain mutation delivery to every target.
    Standard,

    /// Counter apply on a node already running on the counter-mutation
    /// stage (the leader got the mutation over the wire).
    CounterLocal,

    /// Counter apply on the coordinator itself; must hop onto the
    /// counter-mutation stage first.
    CounterOnCoordinator,
}

impl Coordinator {
    /// Applies the given writes across their replicas at the requested
    /// consistency. Counter updates route through a leader replica;
    /// everything else fans out directly. A timeout at CL=ANY degrades to
    /// hint submission and reports success.
    pub async fn mutate(
        &self,
        writes: Vec<WriteRequest>,
        consistency: ConsistencyLevel,
    ) -> Result<(), CoordError> {
        pf_trace!(self.ctx.me; "determining replicas for {} mutation(s)",
                               writes.len());
        let standard_count = writes
            .iter()
            .filter(|w| matches!(w, WriteRequest::Standard(_)))
            .count();
        let write_type = if writes.len() <= 1 {
            WriteType::Simple
        } else {
            WriteType::UnloggedBatch
        };

        let result = self
            .mutate_inner(&writes, consistency, write_type)
            .await;

        match result {
            Err(
                e @ (CoordError::WriteTimeout { .. }
                | CoordError::WriteFailure { .. }),
            ) => {
                if consistency == ConsistencyLevel::Any && standard_count > 0 {
                    // no replica answered, but a durable hint satisfies ANY
                    let standard: Vec<Mutation> = writes
                        .iter()
                        .filter_map(|w| match w {
                            WriteRequest::Standard(m) => Some(m.clone()),
                            WriteRequest::Counter(_) => None,
                        })
                        .collect();
                    self.hint_mutations(&standard).await?;
                    Ok(())
                } else {
                    match &e {
                        CoordError::WriteFailure { .. } => {
                            self.ctx
                                .metrics
                                .write
                                .failures
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            self.ctx
                                .metrics
                                .write
                                .timeouts
                                .fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e)
                }
            }
            Err(e @ CoordError::Unavailable { .. })
            | Err(e @ CoordError::Overloaded(_)) => {
                self.ctx
                    .metrics
                    .write
                    .unavailables
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            other => other,
        }
    }

    async fn mutate_inner(
        &self,
        writes: &[WriteRequest],
        consistency: ConsistencyLevel,
        write_type: WriteType,
    ) -> Result<(), CoordError> {
        let mut handlers = Vec::with_capacity(writes.len());
        for write in writes {
            match write {
                WriteRequest::Counter(cm) => {
                    handlers.push(self.mutate_counter(cm.clone(), consistency).await?);
                }
                WriteRequest::Standard(m) => {
                    handlers.push(
                        self.perform_write(
                            m.clone(),
                            consistency,
                            WritePerformer::Standard,
                            write_type,
                        )
                        .await?,
                    );
                }
            }
        }

        for handler in &handlers {
            let verb = match handler.write_type() {
                WriteType::Counter => Verb::CounterMutation,
                _ => Verb::Mutation,
            };
            let outcome = handler.await_acks(self.ctx.rpc_timeout(verb)).await;
            handler.conclude(&self.ctx);
            outcome?;
        }
        Ok(())
    }

    /// Resolves a mutation's targets, checks availability, and launches
    /// its fan-out through the given performer. Returns the handler to
    /// await.
    pub(crate) async fn perform_write(
        &self,
        mutation: Mutation,
        consistency: ConsistencyLevel,
        performer: WritePerformer,
        write_type: WriteType,
    ) -> Result<WriteHandler, CoordError> {
        let token = mutation.token();
        let (natural, pending) =
            self.ctx.write_endpoints(&mutation.keyspace, token);

        let handler = WriteHandler::new(
            &self.ctx,
            &mutation.keyspace,
            natural,
            pending,
            consistency,
            write_type,
        );
        // exit early if we can't fulfill the CL at this time
        handler.assure_sufficient_live_nodes(&self.ctx)?;

        let targets = handler.all_targets();
        match performer {
            WritePerformer::Standard => {
                self.send_to_hinted_endpoints(&mutation, &targets, &handler)
                    .await?;
            }
            WritePerformer::CounterLocal => {
                self.counter_write_task(mutation, targets, handler.clone())
                    .await;
            }
            WritePerformer::CounterOnCoordinator => {
                let this = self.clone();
                let h = handler.clone();
                let timeout = self.ctx.rpc_timeout(Verb::CounterMutation);
                self.ctx
                    .stages
                    .counter_mutation
                    .submit(StageTask::new(
                        Verb::CounterMutation,
                        timeout,
                        async move {
                            this.counter_write_task(mutation, targets, h).await;
                        },
                    ))
                    .await?;
            }
        }
        Ok(handler)
    }

    /// Sends a mutation to its targets: local apply for self, direct
    /// sends within the local DC, one relayed message per remote DC, and
    /// hints for the dead. The hint backpressure check runs per
    /// destination even for live nodes.
    pub(crate) async fn send_to_hinted_endpoints(
        &self,
        mutation: &Mutation,
        targets: &[EndpointId],
        handler: &WriteHandler,
    ) -> Result<(), CoordError> {
        let ctx = &self.ctx;
        let mut dc_groups: HashMap<String, Vec<EndpointId>> = HashMap::new();
        let mut insert_local = false;

        for &destination in targets {
            ctx.check_hint_overload(destination)?;

            if ctx.liveness.is_alive(destination) {
                if ctx.is_me(destination) {
                    insert_local = true;
                } else {
                    let dc = ctx.snitch.datacenter(destination);
                    if dc == ctx.local_dc {
                        let cb = handler.register(ctx);
                        ctx.messaging.send_rr(
                            ReplicaRequest::Mutation {
                                mutation: mutation.clone(),
                                forward_to: vec![],
                            },
                            destination,
                            cb,
                        );
                    } else {
                        dc_groups.entry(dc).or_default().push(destination);
                    }
                }
            } else if ctx.should_hint(destination) {
                self.submit_hint(
                    mutation.clone(),
                    destination,
                    Some(handler.clone()),
                )
                .await?;
            }
        }

        if insert_local {
            self.insert_local(mutation.clone(), handler.clone()).await?;
        }

        // one relayed message per remote datacenter
        for (dc, dc_targets) in dc_groups {
            pf_trace!(ctx.me; "relaying {} byte mutation to {} targets in {}",
                              mutation.get_size(), dc_targets.len(), dc);
            self.send_to_nonlocal_dc(mutation, &dc_targets, handler);
        }
        Ok(())
    }

    /// Picks the first target of a remote DC as relay and attaches the
    /// rest as a forwarding header, bounding cross-DC bandwidth at one
    /// message per DC per write.
    fn send_to_nonlocal_dc(
        &self,
        mutation: &Mutation,
        targets: &[EndpointId],
        handler: &WriteHandler,
    ) {
        let ctx = &self.ctx;
        let relay = targets[0];
        let forward_to: Vec<_> = targets[1..]
            .iter()
            .map(|&ep| (ep, handler.register(ctx)))
            .collect();
        let cb = handler.register(ctx);
        ctx.messaging.send_rr(
            ReplicaRequest::Mutation {
                mutation: mutation.clone(),
                forward_to,
            },
            relay,
            cb,
        );
    }

    /// Schedules the local apply on the mutation stage. An apply that
    /// ages out of the queue re-runs under hint accounting instead of
    /// being lost; an apply that fails marks the handler failed for self.
    pub(crate) async fn insert_local(
        &self,
        mutation: Mutation,
        handler: WriteHandler,
    ) -> Result<(), CoordError> {
        let ctx = self.ctx.clone();
        let timeout = ctx.rpc_timeout(Verb::Mutation);

        let job_ctx = ctx.clone();
        let job_mutation = mutation.clone();
        let job_handler = handler.clone();
        let job = async move {
            match job_ctx.storage.apply(&job_mutation).await {
                Ok(()) => job_handler.signal_success(Some(job_ctx.me)),
                Err(e) => {
                    pf_error!(job_ctx.me;
                              "failed to apply mutation locally: {}", e);
                    job_handler.signal_failure(job_ctx.me);
                }
            }
        };

        let drop_ctx = ctx.clone();
        let task = StageTask::new(Verb::Mutation, timeout, job).with_on_drop(
            move |verb| {
                drop_ctx.messaging.increment_dropped(verb);
                // local writes must not be lost: re-run under hint
                // accounting so the backpressure cap still sees them
                let guard = drop_ctx.hints.begin(drop_ctx.me);
                let ctx = drop_ctx.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    match ctx.storage.apply(&mutation).await {
                        Ok(()) => handler.signal_success(Some(ctx.me)),
                        Err(e) => {
                            pf_error!(ctx.me;
                                      "failed late local apply: {}", e);
                            handler.signal_failure(ctx.me);
                        }
                    }
                });
            },
        );

        self.ctx.stages.mutation.submit(task).await
    }

    /// Leader-side entry for a counter mutation that arrived over the
    /// wire: the verb handler already runs on the counter-mutation
    /// stage, so the apply happens inline rather than hopping stages
    /// again (which could deadlock a full pool).
    pub async fn apply_counter_mutation_on_leader(
        &self,
        mutation: Mutation,
        consistency: ConsistencyLevel,
    ) -> Result<(), CoordError> {
        let handler = self
            .perform_write(
                mutation,
                consistency,
                WritePerformer::CounterLocal,
                WriteType::Counter,
            )
            .await?;
        let outcome = handler
            .await_acks(self.ctx.rpc_timeout(Verb::CounterMutation))
            .await;
        handler.conclude(&self.ctx);
        outcome
    }

    /// Counter write entry: apply on this node if it is a replica,
    /// otherwise verify the CL is satisfiable and forward to a chosen
    /// leader replica.
    pub(crate) async fn mutate_counter(
        &self,
        mutation: Mutation,
        consistency: ConsistencyLevel,
    ) -> Result<WriteHandler, CoordError> {
        let leader = self.find_counter_leader(&mutation, consistency)?;

        if self.ctx.is_me(leader) {
            return self
                .perform_write(
                    mutation,
                    consistency,
                    WritePerformer::CounterOnCoordinator,
                    WriteType::Counter,
                )
                .await;
        }

        // exit now if the CL can't be met, rather than after forwarding
        let token = mutation.token();
        let (natural, pending) =
            self.ctx.write_endpoints(&mutation.keyspace, token);
        WriteHandler::new(
            &self.ctx,
            &mutation.keyspace,
            natural,
            pending,
            consistency,
            WriteType::Counter,
        )
        .assure_sufficient_live_nodes(&self.ctx)?;

        pf_trace!(self.ctx.me; "enqueuing counter update to {}", leader);
        let handler = WriteHandler::for_single(leader, WriteType::Counter);
        let cb = handler.register(&self.ctx);
        self.ctx.messaging.send_rr(
            ReplicaRequest::CounterMutation {
                mutation,
                consistency,
            },
            leader,
            cb,
        );
        Ok(handler)
    }

    /// Leader election for one counter update: a random live replica of
    /// the local DC, else the closest live replica overall.
    fn find_counter_leader(
        &self,
        mutation: &Mutation,
        consistency: ConsistencyLevel,
    ) -> Result<EndpointId, CoordError> {
        let ctx = &self.ctx;
        let token = mutation.token();
        let live: Vec<EndpointId> = ctx
            .placement
            .natural_endpoints(&mutation.keyspace, token)
            .into_iter()
            .filter(|&ep| ctx.liveness.is_alive(ep))
            .collect();
        if live.is_empty() {
            let (rf, local_rf) = ctx.replication_factors(&mutation.keyspace);
            return Err(CoordError::Unavailable {
                consistency,
                required: consistency.block_for(rf, local_rf) as u32,
                alive: 0,
            });
        }

        let local: Vec<EndpointId> = live
            .iter()
            .copied()
            .filter(|&ep| ctx.snitch.datacenter(ep) == ctx.local_dc)
            .collect();
        if local.is_empty() {
            let mut sorted = live;
            ctx.snitch.sort_by_proximity(ctx.me, &mut sorted);
            Ok(sorted[0])
        } else {
            Ok(local[rand::thread_rng().gen_range(0..local.len())])
        }
    }

    /// Leader-side counter execution: apply locally (the counter read
    /// happens inside the engine), acknowledge, then replicate the
    /// post-read result to the remaining targets through the standard
    /// dispatcher.
    pub(crate) async fn counter_write_task(
        &self,
        mutation: Mutation,
        targets: Vec<EndpointId>,
        handler: WriteHandler,
    ) {
        let ctx = &self.ctx;
        let result = match ctx.storage.apply_counter(&mutation).await {
            Ok(result) => result,
            Err(e) => {
                pf_error!(ctx.me; "counter apply failed: {}", e);
                handler.signal_failure(ctx.me);
                return;
            }
        };
        handler.signal_success(Some(ctx.me));

        let remotes: Vec<EndpointId> = targets
            .into_iter()
            .filter(|&ep| !ctx.is_me(ep))
            .collect();
        if !remotes.is_empty() {
            if let Err(e) = self
                .send_to_hinted_endpoints(&result, &remotes, &handler)
                .await
            {
                pf_warn!(ctx.me; "counter replication fan-out failed: {}", e);
            }
        }
    }
}
