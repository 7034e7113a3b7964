//! Hinted-handoff submission: durably records intent for unreachable
//! replicas, under a global in-flight soft cap that doubles as the write
//! path's only backpressure signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::collector::WriteHandler;
use super::{Coordinator, CoordinatorContext};

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::messaging::Verb;
use crate::model::Mutation;
use crate::stage::StageTask;
use crate::utils::CoordError;

/// Hints-in-flight accounting: a global counter plus lazily created
/// per-endpoint counters. The invariant `total == sum(per-endpoint)`
/// holds outside the paired increment/decrement windows.
pub(crate) struct HintBacklog {
    total: Arc<AtomicI64>,
    per_endpoint: Mutex<HashMap<EndpointId, Arc<AtomicI64>>>,
}

impl HintBacklog {
    pub(crate) fn new() -> Self {
        HintBacklog {
            total: Arc::new(AtomicI64::new(0)),
            per_endpoint: Mutex::new(HashMap::new()),
        }
    }

    fn counter_for(&self, endpoint: EndpointId) -> Arc<AtomicI64> {
        self.per_endpoint
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }

    pub(crate) fn total_in_progress(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn in_progress_for(&self, endpoint: EndpointId) -> i64 {
        self.counter_for(endpoint).load(Ordering::Relaxed)
    }

    /// Accounts one hint as in flight; the returned guard decrements
    /// exactly once however the hint task exits.
    pub(crate) fn begin(&self, endpoint: EndpointId) -> HintGuard {
        let per = self.counter_for(endpoint);
        self.total.fetch_add(1, Ordering::AcqRel);
        per.fetch_add(1, Ordering::AcqRel);
        HintGuard {
            total: self.total.clone(),
            per,
        }
    }
}

/// Drop guard pairing the in-flight increments with their decrements.
pub(crate) struct HintGuard {
    total: Arc<AtomicI64>,
    per: Arc<AtomicI64>,
}

impl Drop for HintGuard {
    fn drop(&mut self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.per.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CoordinatorContext {
    /// Whether a hint should be written for this endpoint at all.
    pub(crate) fn should_hint(&self, endpoint: EndpointId) -> bool {
        let config = self.config.read().unwrap();
        if !config.hinted_handoff_enabled {
            return false;
        }
        if !config.hinted_handoff_disabled_dcs.is_empty() {
            let dc = self.snitch.datacenter(endpoint);
            if config.hinted_handoff_disabled_dcs.contains(&dc) {
                pf_trace!(self.me; "not hinting {} in disabled dc {}",
                                   endpoint, dc);
                return false;
            }
        }
        let downtime = self.liveness.downtime_ms(endpoint);
        if downtime > config.max_hint_window_ms {
            pf_trace!(self.me; "not hinting {} down for {} ms",
                               endpoint, downtime);
            return false;
        }
        true
    }

    /// Admission check run per write destination. The cap is advisory:
    /// we only refuse when the backlog is over the cap AND this
    /// destination is itself accumulating hints, so a few sick nodes
    /// cannot shut down writes to healthy ones.
    pub(crate) fn check_hint_overload(
        &self,
        destination: EndpointId,
    ) -> Result<(), CoordError> {
        let total = self.hints.total_in_progress();
        let cap = self.config.read().unwrap().max_hints_in_progress as i64;
        if total > cap
            && self.hints.in_progress_for(destination) > 0
            && self.should_hint(destination)
        {
            return Err(CoordError::Overloaded(format!(
                "too many in flight hints: {}",
                total
            )));
        }
        Ok(())
    }
}

impl Coordinator {
    /// Enqueues a hint for `target` on the mutation stage. When the
    /// originating consistency is ANY, the written hint satisfies the
    /// response handler in place of a replica acknowledgement.
    pub(crate) async fn submit_hint(
        &self,
        mutation: Mutation,
        target: EndpointId,
        handler: Option<WriteHandler>,
    ) -> Result<(), CoordError> {
        debug_assert!(!self.ctx.is_me(target));
        let ctx = self.ctx.clone();
        let guard = ctx.hints.begin(target);
        let timeout = ctx.rpc_timeout(Verb::Mutation);

        let job = async move {
            let _guard = guard;
            let ttl = ctx.hint_store.calculate_hint_ttl(&mutation);
            if ttl <= 0 {
                pf_debug!(ctx.me; "skipped hint for {} (ttl {})", target, ttl);
                return;
            }
            if let Err(e) = write_hint(&ctx, &mutation, target, ttl).await {
                pf_error!(ctx.me; "failed writing hint for {}: {}", target, e);
                return;
            }
            if let Some(handler) = handler {
                if handler.consistency() == ConsistencyLevel::Any {
                    handler.signal_success(None);
                }
            }
        };

        self.ctx
            .stages
            .mutation
            .submit(StageTask::new(Verb::Mutation, timeout, job))
            .await
    }

    /// Hints every mutation of a batch whose write timed out at CL=ANY
    /// (counters excluded, they cannot be safely replayed). Re-hinting a
    /// mutation that some replica did apply is harmless.
    pub(crate) async fn hint_mutations(
        &self,
        mutations: &[Mutation],
    ) -> Result<(), CoordError> {
        for mutation in mutations {
            let token = mutation.token();
            let (natural, pending) =
                self.ctx.write_endpoints(&mutation.keyspace, token);
            for target in natural.into_iter().chain(pending) {
                // local applies time out but are never dropped, so self
                // needs no hint
                if !self.ctx.is_me(target) && self.ctx.should_hint(target) {
                    self.submit_hint(mutation.clone(), target, None).await?;
                }
            }
        }
        pf_debug!(self.ctx.me;
                  "wrote hints to satisfy CL.ANY after no replica acked");
        Ok(())
    }
}

async fn write_hint(
    ctx: &CoordinatorContext,
    mutation: &Mutation,
    target: EndpointId,
    ttl: i64,
) -> Result<(), CoordError> {
    let host_id = ctx.placement.host_id(target).ok_or_else(|| {
        CoordError::msg(format!("missing host id for endpoint {}", target))
    })?;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let hint = ctx.hint_store.hint_for(mutation, now_ms, ttl, host_id);
    ctx.storage
        .apply(&hint)
        .await
        .map_err(|e| CoordError::msg(e))?;
    ctx.metrics.total_hints.fetch_add(1, Ordering::Relaxed);
    pf_debug!(ctx.me; "added hint for {}", target);
    Ok(())
}
