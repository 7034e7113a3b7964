//! Cluster-wide truncation: requires every token owner reachable, then
//! broadcasts and blocks for full acknowledgement.

use super::collector::WriteHandler;
use super::Coordinator;

use crate::cluster::ConsistencyLevel;
use crate::messaging::{ReplicaRequest, Verb, WriteType};
use crate::utils::CoordError;

impl Coordinator {
    /// Deletes all data of a table on every token owner. Truncation is
    /// aggressive and admin-driven, so any unreachable owner aborts the
    /// whole operation up front.
    pub async fn truncate_blocking(
        &self,
        keyspace: &str,
        table: &str,
    ) -> Result<(), CoordError> {
        let ctx = &self.ctx;
        pf_debug!(ctx.me; "starting blocking truncate of {}.{}",
                          keyspace, table);

        if !ctx.liveness.unreachable_token_owners().is_empty() {
            pf_info!(ctx.me; "cannot truncate, some hosts are down");
            let live = ctx.liveness.live_members().len() as u32;
            let unreachable = ctx.liveness.unreachable_members().len() as u32;
            return Err(CoordError::Unavailable {
                consistency: ConsistencyLevel::All,
                required: live + unreachable,
                alive: live,
            });
        }

        let mut owners: Vec<_> =
            ctx.liveness.live_token_owners().into_iter().collect();
        owners.sort_unstable();
        pf_trace!(ctx.me; "enqueuing truncate messages to {:?}", owners);

        let handler = WriteHandler::with_block_for(
            owners.clone(),
            ConsistencyLevel::All,
            owners.len() as u32,
            WriteType::Simple,
        );
        for &owner in &owners {
            if ctx.is_me(owner) {
                let ctx = ctx.clone();
                let handler = handler.clone();
                let keyspace = keyspace.to_string();
                let table = table.to_string();
                tokio::spawn(async move {
                    match ctx.storage.truncate(&keyspace, &table).await {
                        Ok(()) => handler.signal_success(Some(ctx.me)),
                        Err(e) => {
                            pf_error!(ctx.me; "local truncate failed: {}", e);
                            handler.signal_failure(ctx.me);
                        }
                    }
                });
            } else {
                let cb = handler.register(ctx);
                ctx.messaging.send_rr(
                    ReplicaRequest::Truncate {
                        keyspace: keyspace.to_string(),
                        table: table.to_string(),
                    },
                    owner,
                    cb,
                );
            }
        }

        let outcome = handler
            .await_acks(ctx.rpc_timeout(Verb::Truncate))
            .await;
        handler.conclude(ctx);
        if outcome.is_err() {
            pf_trace!(ctx.me; "truncate timed out or failed");
        }
        outcome
    }
}
