//! The coordinator orchestration layer: every client-facing read, write,
//! scan, CAS, and truncate is translated here into replica operations and
//! driven to a consistency-level quorum.

mod admin;
mod batchlog;
mod collector;
mod endpoints;
mod hints;
mod paxos;
mod range;
mod read;
mod schema;
mod truncate;
mod write;

pub use admin::Admin;
pub use paxos::{CasRequest, CellCondition};
pub use schema::UNREACHABLE;
pub use write::WriteRequest;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::cluster::{
    EndpointId, LivenessDetector, PlacementOracle, ReplicationStrategy, Snitch,
};
use crate::messaging::{CallbackId, CallbackRegistry, MessagingService, ReplicaReply, Verb};
use crate::model::BallotClock;
use crate::stage::Stages;
use crate::storage::{HintStore, StorageEngine};
use crate::utils::{CoordError, LatencyTracker};

use hints::HintBacklog;

use serde::Deserialize;

use tokio::time::Duration;

/// Name of the system keyspace; reads against it bypass the bootstrap
/// guard, and batchlog rows live in it.
pub const SYSTEM_KEYSPACE: &str = "system";

/// Table holding batchlog rows, keyed by batch UUID.
pub const BATCHLOG_TABLE: &str = "batchlog";

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Read RPC timeout in millisecs.
    pub read_rpc_timeout_ms: u64,

    /// Write RPC timeout in millisecs.
    pub write_rpc_timeout_ms: u64,

    /// Counter write RPC timeout in millisecs.
    pub counter_write_rpc_timeout_ms: u64,

    /// Total budget for one CAS attempt, across its contention retries,
    /// in millisecs.
    pub cas_contention_timeout_ms: u64,

    /// Range scan RPC timeout in millisecs.
    pub range_rpc_timeout_ms: u64,

    /// Truncate RPC timeout in millisecs.
    pub truncate_rpc_timeout_ms: u64,

    /// Generic request-response timeout (e.g. schema probes) in millisecs.
    pub request_rpc_timeout_ms: u64,

    /// Whether hinted handoff is enabled at all.
    pub hinted_handoff_enabled: bool,

    /// Datacenters for which hints are disabled.
    pub hinted_handoff_disabled_dcs: HashSet<String>,

    /// Hints are not written for endpoints down longer than this.
    pub max_hint_window_ms: u64,

    /// Soft cap on hints in flight; admission control, not a hard fence.
    pub max_hints_in_progress: u64,

    /// Whether reads fire a speculative extra data request.
    pub speculative_retry_enabled: bool,

    /// Latency percentile after which the speculative request fires.
    pub speculative_retry_percentile: f64,

    /// Underestimation margin of the range-scan concurrency estimate.
    pub range_subrequest_margin: f64,

    /// Estimated result rows per ring range for the initial scan
    /// concurrency (refined adaptively from the first batch onwards).
    pub estimated_results_per_range: f64,

    /// Workers per named stage.
    pub stage_workers: usize,

    /// Queue capacity per named stage.
    pub stage_queue_capacity: usize,

    /// Native transport connection cap; negative means unlimited.
    pub native_transport_max_concurrent_connections: i64,

    /// Native transport per-client connection cap; negative means
    /// unlimited.
    pub native_transport_max_concurrent_connections_per_ip: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            read_rpc_timeout_ms: 5000,
            write_rpc_timeout_ms: 2000,
            counter_write_rpc_timeout_ms: 5000,
            cas_contention_timeout_ms: 1000,
            range_rpc_timeout_ms: 10000,
            truncate_rpc_timeout_ms: 60000,
            request_rpc_timeout_ms: 10000,
            hinted_handoff_enabled: true,
            hinted_handoff_disabled_dcs: HashSet::new(),
            max_hint_window_ms: 3 * 3600 * 1000,
            max_hints_in_progress: 1024,
            speculative_retry_enabled: true,
            speculative_retry_percentile: 99.0,
            range_subrequest_margin: 0.10,
            estimated_results_per_range: 10.0,
            stage_workers: 4,
            stage_queue_capacity: 1024,
            native_transport_max_concurrent_connections: -1,
            native_transport_max_concurrent_connections_per_ip: -1,
        }
    }
}

impl CoordinatorConfig {
    /// Parses a config from its defaults overlaid with a TOML string.
    pub fn parsed(config_str: Option<&str>) -> Result<Self, CoordError> {
        parsed_config!(config_str => CoordinatorConfig;
                       read_rpc_timeout_ms, write_rpc_timeout_ms,
                       counter_write_rpc_timeout_ms,
                       cas_contention_timeout_ms, range_rpc_timeout_ms,
                       truncate_rpc_timeout_ms, request_rpc_timeout_ms,
                       hinted_handoff_enabled,
                       hinted_handoff_disabled_dcs,
                       max_hint_window_ms, max_hints_in_progress,
                       speculative_retry_enabled,
                       speculative_retry_percentile,
                       range_subrequest_margin,
                       estimated_results_per_range,
                       stage_workers, stage_queue_capacity,
                       native_transport_max_concurrent_connections,
                       native_transport_max_concurrent_connections_per_ip)
    }

    /// RPC timeout of a verb.
    pub fn rpc_timeout(&self, verb: Verb) -> Duration {
        let ms = match verb {
            Verb::Read => self.read_rpc_timeout_ms,
            Verb::Mutation => self.write_rpc_timeout_ms,
            Verb::CounterMutation => self.counter_write_rpc_timeout_ms,
            Verb::RangeRead => self.range_rpc_timeout_ms,
            Verb::Truncate => self.truncate_rpc_timeout_ms,
            Verb::PaxosPrepare | Verb::PaxosPropose | Verb::PaxosCommit => {
                self.cas_contention_timeout_ms
            }
            Verb::SchemaCheck | Verb::RequestResponse => {
                self.request_rpc_timeout_ms
            }
        };
        Duration::from_millis(ms)
    }
}

/// Triple of terminal-outcome counters kept per request kind.
#[derive(Debug, Default)]
pub struct RequestCounters {
    pub timeouts: AtomicU64,
    pub unavailables: AtomicU64,
    pub failures: AtomicU64,
}

/// CAS paths additionally track contention and precondition outcomes.
#[derive(Debug, Default)]
pub struct CasCounters {
    pub base: RequestCounters,
    pub contention: AtomicU64,
    pub condition_not_met: AtomicU64,
    pub unfinished_commit: AtomicU64,
}

/// Observable coordinator counters, exposed through the admin surface.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub read: RequestCounters,
    pub write: RequestCounters,
    pub range: RequestCounters,
    pub cas_read: CasCounters,
    pub cas_write: CasCounters,

    /// Hints durably written since startup.
    pub total_hints: AtomicU64,

    pub read_repair_attempted: AtomicU64,
    pub read_repair_repaired_blocking: AtomicU64,
    pub read_repair_repaired_background: AtomicU64,
}

/// Everything a coordinator operation needs, threaded explicitly instead
/// of living in globals. The admin surface is the single writer of the
/// config.
pub struct CoordinatorContext {
    /// My endpoint ID in the cluster.
    pub(crate) me: EndpointId,

    /// My datacenter, per the snitch.
    pub(crate) local_dc: String,

    /// My schema version string.
    pub(crate) schema_version: String,

    pub(crate) config: RwLock<CoordinatorConfig>,

    pub(crate) placement: Arc<dyn PlacementOracle>,
    pub(crate) liveness: Arc<dyn LivenessDetector>,
    pub(crate) snitch: Arc<dyn Snitch>,
    pub(crate) strategy: Arc<dyn ReplicationStrategy>,
    pub(crate) messaging: Arc<dyn MessagingService>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) hint_store: Arc<dyn HintStore>,

    pub(crate) callbacks: Arc<CallbackRegistry>,
    pub(crate) metrics: CoordinatorMetrics,
    pub(crate) hints: HintBacklog,
    pub(crate) stages: Stages,
    pub(crate) latencies: LatencyTracker,
    pub(crate) ballots: BallotClock,

    /// True while this node bootstraps; non-system reads are refused.
    pub(crate) bootstrapping: AtomicBool,
}

impl CoordinatorContext {
    #[inline]
    pub(crate) fn is_me(&self, endpoint: EndpointId) -> bool {
        endpoint == self.me
    }

    pub(crate) fn rpc_timeout(&self, verb: Verb) -> Duration {
        self.config.read().unwrap().rpc_timeout(verb)
    }

    /// Total and local-DC replication factors of a keyspace.
    pub(crate) fn replication_factors(&self, keyspace: &str) -> (u8, u8) {
        (
            self.strategy.replication_factor(keyspace),
            self.strategy
                .local_replication_factor(keyspace, &self.local_dc),
        )
    }
}

/// External collaborators and identity needed to stand up a coordinator.
pub struct CoordinatorSeed {
    pub me: EndpointId,
    pub schema_version: String,
    pub config: CoordinatorConfig,
    pub placement: Arc<dyn PlacementOracle>,
    pub liveness: Arc<dyn LivenessDetector>,
    pub snitch: Arc<dyn Snitch>,
    pub strategy: Arc<dyn ReplicationStrategy>,
    pub messaging: Arc<dyn MessagingService>,
    pub storage: Arc<dyn StorageEngine>,
    pub hint_store: Arc<dyn HintStore>,
    pub callbacks: Arc<CallbackRegistry>,
}

/// The coordinator node role: translates client operations into replica
/// fan-outs. Cheap to clone; all state lives in the shared context.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) ctx: Arc<CoordinatorContext>,
}

impl Coordinator {
    /// Stands up a coordinator from its collaborators and spawns the
    /// named stages.
    pub fn new_and_setup(seed: CoordinatorSeed) -> Result<Self, CoordError> {
        if seed.config.stage_workers == 0 || seed.config.stage_queue_capacity == 0 {
            return logged_err!(seed.me; "invalid stage config {}x{}",
                               seed.config.stage_workers,
                               seed.config.stage_queue_capacity);
        }

        let local_dc = seed.snitch.datacenter(seed.me);
        let stages =
            Stages::new(seed.config.stage_workers, seed.config.stage_queue_capacity);

        Ok(Coordinator {
            ctx: Arc::new(CoordinatorContext {
                me: seed.me,
                local_dc,
                schema_version: seed.schema_version,
                config: RwLock::new(seed.config),
                placement: seed.placement,
                liveness: seed.liveness,
                snitch: seed.snitch,
                strategy: seed.strategy,
                messaging: seed.messaging,
                storage: seed.storage,
                hint_store: seed.hint_store,
                callbacks: seed.callbacks,
                metrics: CoordinatorMetrics::default(),
                hints: HintBacklog::new(),
                stages,
                latencies: LatencyTracker::new(),
                ballots: BallotClock::new(seed.me),
                bootstrapping: AtomicBool::new(false),
            }),
        })
    }

    /// My endpoint ID.
    #[inline]
    pub fn id(&self) -> EndpointId {
        self.ctx.me
    }

    /// The fixed admin surface over this coordinator.
    pub fn admin(&self) -> Admin {
        Admin::new(self.ctx.clone())
    }

    /// Marks the node as bootstrapping (or done bootstrapping).
    pub fn set_bootstrapping(&self, flag: bool) {
        self.ctx.bootstrapping.store(flag, Ordering::Release);
    }

    /// Entry point for the transport's receive loop: routes a replica
    /// reply to the handler registered under `callback`.
    pub fn deliver_reply(
        &self,
        from: EndpointId,
        callback: CallbackId,
        reply: ReplicaReply,
    ) {
        self.ctx.callbacks.deliver(from, callback, reply);
    }

    /// Entry point for explicit replica failure signals.
    pub fn deliver_failure(&self, from: EndpointId, callback: CallbackId) {
        self.ctx.callbacks.deliver_failure(from, callback);
    }
}
