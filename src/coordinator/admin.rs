//! Fixed, versioned admin surface over the coordinator context: the
//! operational knobs and counters an operator can touch at runtime. All
//! config writes funnel through here, under the single config writer
//! lock.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Coordinator, CoordinatorContext};

use crate::utils::CoordError;

/// Admin façade; cheap to clone and hand to an RPC/console binding.
#[derive(Clone)]
pub struct Admin {
    ctx: Arc<CoordinatorContext>,
}

macro_rules! config_accessors {
    ($($getter:ident / $setter:ident: $field:ident -> $ty:ty),+ $(,)?) => {
        $(
            pub fn $getter(&self) -> $ty {
                self.ctx.config.read().unwrap().$field
            }

            pub fn $setter(&self, value: $ty) {
                self.ctx.config.write().unwrap().$field = value;
            }
        )+
    };
}

impl Admin {
    pub(crate) fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Admin { ctx }
    }

    config_accessors! {
        get_hinted_handoff_enabled / set_hinted_handoff_enabled:
            hinted_handoff_enabled -> bool,
        get_max_hint_window_ms / set_max_hint_window_ms:
            max_hint_window_ms -> u64,
        get_max_hints_in_progress / set_max_hints_in_progress:
            max_hints_in_progress -> u64,
        get_read_rpc_timeout_ms / set_read_rpc_timeout_ms:
            read_rpc_timeout_ms -> u64,
        get_write_rpc_timeout_ms / set_write_rpc_timeout_ms:
            write_rpc_timeout_ms -> u64,
        get_counter_write_rpc_timeout_ms / set_counter_write_rpc_timeout_ms:
            counter_write_rpc_timeout_ms -> u64,
        get_cas_contention_timeout_ms / set_cas_contention_timeout_ms:
            cas_contention_timeout_ms -> u64,
        get_range_rpc_timeout_ms / set_range_rpc_timeout_ms:
            range_rpc_timeout_ms -> u64,
        get_truncate_rpc_timeout_ms / set_truncate_rpc_timeout_ms:
            truncate_rpc_timeout_ms -> u64,
        get_request_rpc_timeout_ms / set_request_rpc_timeout_ms:
            request_rpc_timeout_ms -> u64,
        get_native_transport_max_concurrent_connections /
            set_native_transport_max_concurrent_connections:
            native_transport_max_concurrent_connections -> i64,
        get_native_transport_max_concurrent_connections_per_ip /
            set_native_transport_max_concurrent_connections_per_ip:
            native_transport_max_concurrent_connections_per_ip -> i64,
    }

    pub fn enable_hints_for_dc(&self, dc: &str) {
        self.ctx
            .config
            .write()
            .unwrap()
            .hinted_handoff_disabled_dcs
            .remove(dc);
    }

    pub fn disable_hints_for_dc(&self, dc: &str) {
        self.ctx
            .config
            .write()
            .unwrap()
            .hinted_handoff_disabled_dcs
            .insert(dc.to_string());
    }

    pub fn get_hinted_handoff_disabled_dcs(&self) -> Vec<String> {
        let mut dcs: Vec<String> = self
            .ctx
            .config
            .read()
            .unwrap()
            .hinted_handoff_disabled_dcs
            .iter()
            .cloned()
            .collect();
        dcs.sort();
        dcs
    }

    // counters

    pub fn get_total_hints(&self) -> u64 {
        self.ctx.metrics.total_hints.load(Ordering::Relaxed)
    }

    pub fn get_hints_in_progress(&self) -> i64 {
        self.ctx.hints.total_in_progress()
    }

    pub fn get_read_repair_attempted(&self) -> u64 {
        self.ctx
            .metrics
            .read_repair_attempted
            .load(Ordering::Relaxed)
    }

    pub fn get_read_repair_repaired_blocking(&self) -> u64 {
        self.ctx
            .metrics
            .read_repair_repaired_blocking
            .load(Ordering::Relaxed)
    }

    pub fn get_read_repair_repaired_background(&self) -> u64 {
        self.ctx
            .metrics
            .read_repair_repaired_background
            .load(Ordering::Relaxed)
    }

    pub fn get_cas_write_contention(&self) -> u64 {
        self.ctx
            .metrics
            .cas_write
            .contention
            .load(Ordering::Relaxed)
    }

    pub fn get_cas_write_condition_not_met(&self) -> u64 {
        self.ctx
            .metrics
            .cas_write
            .condition_not_met
            .load(Ordering::Relaxed)
    }

    pub fn get_cas_write_unfinished_commit(&self) -> u64 {
        self.ctx
            .metrics
            .cas_write
            .unfinished_commit
            .load(Ordering::Relaxed)
    }

    pub fn get_cas_read_contention(&self) -> u64 {
        self.ctx
            .metrics
            .cas_read
            .contention
            .load(Ordering::Relaxed)
    }

    /// Logged at shutdown; leftover in-flight hints point at a bug or an
    /// unclean stop.
    pub fn verify_no_hints_in_progress(&self) {
        let in_progress = self.get_hints_in_progress();
        if in_progress > 0 {
            pf_warn!(self.ctx.me;
                     "{} hints were not written before shutdown; run \
                      repair and file a bug report",
                     in_progress);
        }
    }

    /// Schema agreement probe, see
    /// [`Coordinator::describe_schema_versions`].
    pub async fn describe_schema_versions(
        &self,
    ) -> Result<HashMap<String, Vec<String>>, CoordError> {
        Coordinator {
            ctx: self.ctx.clone(),
        }
        .describe_schema_versions()
        .await
    }
}
