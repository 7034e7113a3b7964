//! Reusable quorum barriers: per-fanout response handlers that count
//! acknowledgements idempotently, detect unreachability up front, and
//! bound every wait by the verb's RPC timeout.
//!
//! Handlers own their completion state; the transport only ever sees
//! callback IDs. Stragglers arriving after the terminal transition are
//! dropped by the registry or by the per-sender bitmaps here.

use std::pin::pin;
use std::sync::{Arc, Mutex};

use super::CoordinatorContext;

use crate::cluster::{ConsistencyLevel, EndpointId};
use crate::messaging::{CallbackId, ReplicaReply, ResponseSink, WriteType};
use crate::model::{content_digest, reconcile, Commit, Partition};
use crate::utils::{Bitmap, CoordError};

use tokio::sync::Notify;
use tokio::time::{self, Duration, Instant};

/// Endpoint-indexed bitmaps cover the whole ID space.
const ID_SPACE: u8 = u8::MAX;

/// Callback IDs a handler registered with the transport registry, removed
/// in one sweep on the handler's terminal transition.
#[derive(Default)]
struct Registration {
    ids: Mutex<Vec<CallbackId>>,
}

impl Registration {
    fn push(&self, id: CallbackId) {
        self.ids.lock().unwrap().push(id);
    }

    fn take(&self) -> Vec<CallbackId> {
        std::mem::take(&mut *self.ids.lock().unwrap())
    }
}

macro_rules! impl_registration {
    ($handler:ty) => {
        impl $handler {
            /// Registers this handler for one more expected reply and
            /// returns the callback ID to tag the request with.
            pub(crate) fn register(
                &self,
                ctx: &CoordinatorContext,
            ) -> CallbackId {
                let id = ctx.callbacks.register(Arc::new(self.clone()));
                self.shared.registration.push(id);
                id
            }

            /// Removes this handler's registry entries; late replies are
            /// dropped from here on.
            pub(crate) fn conclude(&self, ctx: &CoordinatorContext) {
                ctx.callbacks.deregister(&self.shared.registration.take());
            }
        }
    };
}

// ---------------------------------------------------------------------
// write acknowledgements
// ---------------------------------------------------------------------

struct WriteCore {
    received: Bitmap,
    failed: Bitmap,
    /// Acknowledgements with no attributable sender (hints at CL=ANY).
    anonymous: u32,
    /// Terminal outcome; set exactly once.
    finished: Option<Result<(), u32>>,
}

struct WriteShared {
    consistency: ConsistencyLevel,
    write_type: WriteType,
    block_for: u32,
    targets: u32,
    registration: Registration,
    core: Mutex<WriteCore>,
    done: Notify,
}

/// Write-path quorum barrier over natural plus pending targets.
#[derive(Clone)]
pub(crate) struct WriteHandler {
    shared: Arc<WriteShared>,
    natural: Vec<EndpointId>,
    pending: Vec<EndpointId>,
}

impl WriteHandler {
    /// Builds a handler for the given targets. `block_for` is the
    /// consistency level's requirement plus one per pending target (a
    /// pending write must not weaken the quorum).
    pub(crate) fn new(
        ctx: &CoordinatorContext,
        keyspace: &str,
        natural: Vec<EndpointId>,
        pending: Vec<EndpointId>,
        consistency: ConsistencyLevel,
        write_type: WriteType,
    ) -> Self {
        let (rf, local_rf) = ctx.replication_factors(keyspace);
        let block_for =
            consistency.block_for(rf, local_rf) as u32 + pending.len() as u32;
        let targets = (natural.len() + pending.len()) as u32;

        WriteHandler {
            shared: Arc::new(WriteShared {
                registration: Registration::default(),
                consistency,
                write_type,
                block_for,
                targets,
                core: Mutex::new(WriteCore {
                    received: Bitmap::new(ID_SPACE, false),
                    failed: Bitmap::new(ID_SPACE, false),
                    anonymous: 0,
                    finished: None,
                }),
                done: Notify::new(),
            }),
            natural,
            pending,
        }
    }

    /// A handler expecting a single explicit acknowledger (e.g. the
    /// counter leader).
    pub(crate) fn for_single(
        endpoint: EndpointId,
        write_type: WriteType,
    ) -> Self {
        WriteHandler {
            shared: Arc::new(WriteShared {
                registration: Registration::default(),
                consistency: ConsistencyLevel::One,
                write_type,
                block_for: 1,
                targets: 1,
                core: Mutex::new(WriteCore {
                    received: Bitmap::new(ID_SPACE, false),
                    failed: Bitmap::new(ID_SPACE, false),
                    anonymous: 0,
                    finished: None,
                }),
                done: Notify::new(),
            }),
            natural: vec![endpoint],
            pending: vec![],
        }
    }

    /// A handler over explicit targets with an explicit `block_for`
    /// (batchlog writes, truncation).
    pub(crate) fn with_block_for(
        targets: Vec<EndpointId>,
        consistency: ConsistencyLevel,
        block_for: u32,
        write_type: WriteType,
    ) -> Self {
        WriteHandler {
            shared: Arc::new(WriteShared {
                registration: Registration::default(),
                consistency,
                write_type,
                block_for,
                targets: targets.len() as u32,
                core: Mutex::new(WriteCore {
                    received: Bitmap::new(ID_SPACE, false),
                    failed: Bitmap::new(ID_SPACE, false),
                    anonymous: 0,
                    finished: None,
                }),
                done: Notify::new(),
            }),
            natural: targets,
            pending: vec![],
        }
    }

    /// All write targets, natural then pending.
    pub(crate) fn all_targets(&self) -> Vec<EndpointId> {
        self.natural
            .iter()
            .chain(self.pending.iter())
            .copied()
            .collect()
    }

    pub(crate) fn consistency(&self) -> ConsistencyLevel {
        self.shared.consistency
    }

    pub(crate) fn write_type(&self) -> WriteType {
        self.shared.write_type
    }

    pub(crate) fn received(&self) -> u32 {
        let core = self.shared.core.lock().unwrap();
        core.received.count() as u32 + core.anonymous
    }

    /// Fails fast with *unavailable* when fewer live targets exist than
    /// the level blocks for. Datacenter-local levels only count the local
    /// DC.
    pub(crate) fn assure_sufficient_live_nodes(
        &self,
        ctx: &CoordinatorContext,
    ) -> Result<(), CoordError> {
        let alive = self
            .natural
            .iter()
            .chain(self.pending.iter())
            .filter(|&&ep| ctx.liveness.is_alive(ep))
            .filter(|&&ep| {
                !self.shared.consistency.is_datacenter_local()
                    || ctx.snitch.datacenter(ep) == ctx.local_dc
            })
            .count() as u32;
        if alive < self.shared.block_for {
            return Err(CoordError::Unavailable {
                consistency: self.shared.consistency,
                required: self.shared.block_for,
                alive,
            });
        }
        Ok(())
    }

    /// Records a successful acknowledgement. `from == None` is an
    /// anonymous signal (a hint standing in for a replica at CL=ANY);
    /// attributed signals are idempotent per sender.
    pub(crate) fn signal_success(&self, from: Option<EndpointId>) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished.is_some() {
            return;
        }
        match from {
            Some(ep) => {
                if core.received.get(ep) {
                    return; // duplicate response
                }
                let _ = core.received.set(ep, true);
            }
            None => core.anonymous += 1,
        }
        if core.received.count() as u32 + core.anonymous
            >= self.shared.block_for
        {
            core.finished = Some(Ok(()));
            self.shared.done.notify_waiters();
        }
    }

    /// Records an explicit replica failure, idempotent per sender.
    pub(crate) fn signal_failure(&self, from: EndpointId) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished.is_some() || core.failed.get(from) {
            return;
        }
        let _ = core.failed.set(from, true);
        let failed = core.failed.count() as u32;
        if failed > self.shared.targets - self.shared.block_for {
            core.finished = Some(Err(failed));
            self.shared.done.notify_waiters();
        }
    }

    /// Blocks until the quorum is met, a failure becomes unavoidable, or
    /// the timeout expires. Outstanding messages are never cancelled;
    /// their late responses are dropped.
    pub(crate) async fn await_acks(
        &self,
        timeout: Duration,
    ) -> Result<(), CoordError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.done.notified());
            notified.as_mut().enable();

            {
                let core = self.shared.core.lock().unwrap();
                match core.finished {
                    Some(Ok(())) => return Ok(()),
                    Some(Err(failures)) => {
                        return Err(CoordError::WriteFailure {
                            write_type: self.shared.write_type,
                            consistency: self.shared.consistency,
                            received: core.received.count() as u32
                                + core.anonymous,
                            block_for: self.shared.block_for,
                            failures,
                        })
                    }
                    None => {}
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoordError::WriteTimeout {
                    write_type: self.shared.write_type,
                    consistency: self.shared.consistency,
                    received: self.received(),
                    block_for: self.shared.block_for,
                });
            }
        }
    }
}

impl ResponseSink for WriteHandler {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply) {
        match reply {
            ReplicaReply::WriteOk | ReplicaReply::TruncateOk => {
                self.signal_success(Some(from))
            }
            ReplicaReply::WriteFailed => self.signal_failure(from),
            _ => {}
        }
    }

    fn on_failure(&self, from: EndpointId) {
        self.signal_failure(from);
    }
}

// ---------------------------------------------------------------------
// single-partition reads
// ---------------------------------------------------------------------

struct ReadCore {
    /// (endpoint, rows if a data response, content digest).
    responses: Vec<(EndpointId, Option<Partition>, u64)>,
    responded: Bitmap,
    failed: Bitmap,
    contacted: Vec<EndpointId>,
    finished: bool,
    /// An error that must preempt quorum accounting (e.g. a local
    /// tombstone overrun, surfaced to the client unchanged).
    fatal: Option<CoordError>,
}

struct ReadShared {
    consistency: ConsistencyLevel,
    block_for: u32,
    registration: Registration,
    core: Mutex<ReadCore>,
    done: Notify,
}

/// Read-path barrier: waits for `block_for` responses including at least
/// one carrying data, then exposes the responses for resolution.
#[derive(Clone)]
pub(crate) struct ReadHandler {
    shared: Arc<ReadShared>,
}

impl ReadHandler {
    pub(crate) fn new(
        contacted: Vec<EndpointId>,
        consistency: ConsistencyLevel,
        block_for: u32,
    ) -> Self {
        ReadHandler {
            shared: Arc::new(ReadShared {
                registration: Registration::default(),
                consistency,
                block_for,
                core: Mutex::new(ReadCore {
                    responses: Vec::new(),
                    responded: Bitmap::new(ID_SPACE, false),
                    failed: Bitmap::new(ID_SPACE, false),
                    contacted,
                    finished: false,
                    fatal: None,
                }),
                done: Notify::new(),
            }),
        }
    }

    /// Notes a speculative extra contact so failure accounting keeps up.
    pub(crate) fn note_extra_contact(&self, endpoint: EndpointId) {
        self.shared.core.lock().unwrap().contacted.push(endpoint);
    }

    pub(crate) fn record_data(&self, from: EndpointId, partition: Partition) {
        let digest = content_digest(&partition);
        self.record(from, Some(partition), digest);
    }

    pub(crate) fn record_digest(&self, from: EndpointId, digest: u64) {
        self.record(from, None, digest);
    }

    fn record(
        &self,
        from: EndpointId,
        data: Option<Partition>,
        digest: u64,
    ) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished || core.responded.get(from) {
            return;
        }
        let _ = core.responded.set(from, true);
        core.responses.push((from, data, digest));

        let data_present = core.responses.iter().any(|(_, d, _)| d.is_some());
        if core.responses.len() as u32 >= self.shared.block_for && data_present
        {
            core.finished = true;
            self.shared.done.notify_waiters();
        }
    }

    pub(crate) fn record_failure(&self, from: EndpointId) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished || core.failed.get(from) {
            return;
        }
        let _ = core.failed.set(from, true);
        let contacted = core.contacted.len() as u32;
        if core.failed.count() as u32 > contacted - self.shared.block_for.min(contacted) {
            core.finished = true;
            self.shared.done.notify_waiters();
        }
    }

    /// Terminates the read with an error that bypasses quorum accounting.
    pub(crate) fn record_fatal(&self, error: CoordError) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished {
            return;
        }
        core.finished = true;
        core.fatal = Some(error);
        self.shared.done.notify_waiters();
    }

    /// Whether the handler already reached a terminal state.
    pub(crate) fn is_finished(&self) -> bool {
        self.shared.core.lock().unwrap().finished
    }

    /// Waits for enough responses. On success the handler holds at least
    /// `block_for` responses, one of them with data.
    pub(crate) async fn await_responses(
        &self,
        timeout: Duration,
    ) -> Result<(), CoordError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.done.notified());
            notified.as_mut().enable();

            {
                let core = self.shared.core.lock().unwrap();
                if let Some(fatal) = &core.fatal {
                    return Err(fatal.clone());
                }
                let received = core.responses.len() as u32;
                let data_present =
                    core.responses.iter().any(|(_, d, _)| d.is_some());
                if received >= self.shared.block_for && data_present {
                    return Ok(());
                }
                let contacted = core.contacted.len() as u32;
                let failed = core.failed.count() as u32;
                if failed > contacted - self.shared.block_for.min(contacted) {
                    return Err(CoordError::ReadFailure {
                        consistency: self.shared.consistency,
                        received,
                        block_for: self.shared.block_for,
                        failures: failed,
                        data_present,
                    });
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                let core = self.shared.core.lock().unwrap();
                return Err(CoordError::ReadTimeout {
                    consistency: self.shared.consistency,
                    received: core.responses.len() as u32,
                    block_for: self.shared.block_for,
                    data_present: core
                        .responses
                        .iter()
                        .any(|(_, d, _)| d.is_some()),
                });
            }
        }
    }

    /// Whether every digest agrees with the data responses.
    pub(crate) fn digests_consistent(&self) -> bool {
        let core = self.shared.core.lock().unwrap();
        let mut digests = core.responses.iter().map(|(_, _, d)| *d);
        match digests.next() {
            None => true,
            Some(first) => digests.all(|d| d == first),
        }
    }

    /// All full-data responses received so far.
    pub(crate) fn data_responses(&self) -> Vec<(EndpointId, Partition)> {
        let core = self.shared.core.lock().unwrap();
        core.responses
            .iter()
            .filter_map(|(ep, d, _)| d.clone().map(|p| (*ep, p)))
            .collect()
    }
}

impl ResponseSink for ReadHandler {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply) {
        match reply {
            ReplicaReply::ReadResponse { data: Some(p), .. } => {
                self.record_data(from, p)
            }
            ReplicaReply::ReadResponse { data: None, digest } => {
                self.record_digest(from, digest)
            }
            ReplicaReply::ReadFailed => self.record_failure(from),
            _ => {}
        }
    }

    fn on_failure(&self, from: EndpointId) {
        self.record_failure(from);
    }
}

// ---------------------------------------------------------------------
// range scans
// ---------------------------------------------------------------------

struct RangeCore {
    responses: Vec<(EndpointId, Vec<Partition>)>,
    responded: Bitmap,
    failed: Bitmap,
    finished: bool,
}

struct RangeShared {
    consistency: ConsistencyLevel,
    block_for: u32,
    contacted: u32,
    registration: Registration,
    core: Mutex<RangeCore>,
    done: Notify,
}

/// Per-subrange barrier. Range responses always carry full data; replica
/// versions reconcile cell-wise at resolve time.
#[derive(Clone)]
pub(crate) struct RangeHandler {
    shared: Arc<RangeShared>,
}

impl RangeHandler {
    pub(crate) fn new(
        contacted: u32,
        consistency: ConsistencyLevel,
        block_for: u32,
    ) -> Self {
        RangeHandler {
            shared: Arc::new(RangeShared {
                registration: Registration::default(),
                consistency,
                block_for,
                contacted,
                core: Mutex::new(RangeCore {
                    responses: Vec::new(),
                    responded: Bitmap::new(ID_SPACE, false),
                    failed: Bitmap::new(ID_SPACE, false),
                    finished: false,
                }),
                done: Notify::new(),
            }),
        }
    }

    pub(crate) fn record_data(
        &self,
        from: EndpointId,
        partitions: Vec<Partition>,
    ) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished || core.responded.get(from) {
            return;
        }
        let _ = core.responded.set(from, true);
        core.responses.push((from, partitions));
        if core.responses.len() as u32 >= self.shared.block_for {
            core.finished = true;
            self.shared.done.notify_waiters();
        }
    }

    pub(crate) fn record_failure(&self, from: EndpointId) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished || core.failed.get(from) {
            return;
        }
        let _ = core.failed.set(from, true);
        if core.failed.count() as u32
            > self.shared.contacted - self.shared.block_for.min(self.shared.contacted)
        {
            core.finished = true;
            self.shared.done.notify_waiters();
        }
    }

    /// Waits for `block_for` responses, then reconciles replica versions
    /// per partition and returns the merged rows sorted by key.
    pub(crate) async fn await_partitions(
        &self,
        timeout: Duration,
    ) -> Result<Vec<Partition>, CoordError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.done.notified());
            notified.as_mut().enable();

            {
                let core = self.shared.core.lock().unwrap();
                if core.responses.len() as u32 >= self.shared.block_for {
                    return Ok(Self::resolve(&core.responses));
                }
                let failed = core.failed.count() as u32;
                if failed
                    > self.shared.contacted
                        - self.shared.block_for.min(self.shared.contacted)
                {
                    return Err(CoordError::ReadFailure {
                        consistency: self.shared.consistency,
                        received: core.responses.len() as u32,
                        block_for: self.shared.block_for,
                        failures: failed,
                        data_present: !core.responses.is_empty(),
                    });
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                let core = self.shared.core.lock().unwrap();
                return Err(CoordError::ReadTimeout {
                    consistency: self.shared.consistency,
                    received: core.responses.len() as u32,
                    block_for: self.shared.block_for,
                    data_present: !core.responses.is_empty(),
                });
            }
        }
    }

    fn resolve(responses: &[(EndpointId, Vec<Partition>)]) -> Vec<Partition> {
        use std::collections::BTreeMap;
        let mut by_key: BTreeMap<String, Vec<&Partition>> = BTreeMap::new();
        for (_, partitions) in responses {
            for p in partitions {
                by_key.entry(p.key.clone()).or_default().push(p);
            }
        }
        by_key
            .into_iter()
            .map(|(key, versions)| {
                let mut merged = reconcile(&key, &versions);
                merged.rows.retain(crate::model::Row::is_live);
                merged
            })
            .filter(|p| !p.is_empty())
            .collect()
    }
}

impl ResponseSink for RangeHandler {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply) {
        match reply {
            ReplicaReply::RangeResponse { data } => {
                self.record_data(from, data)
            }
            ReplicaReply::ReadFailed => self.record_failure(from),
            _ => {}
        }
    }

    fn on_failure(&self, from: EndpointId) {
        self.record_failure(from);
    }
}

// ---------------------------------------------------------------------
// paxos prepare / propose
// ---------------------------------------------------------------------

/// Digest of a prepare round once a quorum has answered.
pub(crate) struct PrepareSummary {
    /// Every answering replica promised our ballot.
    pub promised: bool,

    /// Highest in-progress ballot seen, update-carrying or not. Refusals
    /// report the replica's promise here, making this the floor for the
    /// next ballot after a preemption.
    pub in_progress: Option<Commit>,

    /// Highest-ballot accepted-but-uncommitted proposal that actually
    /// carries an update (the round that may need finishing).
    pub in_progress_with_update: Option<Commit>,

    /// Highest most-recent-commit across the quorum.
    pub most_recent_commit: Option<Commit>,

    /// Replicas whose most-recent-commit lags the quorum's.
    pub missing_mrc: Vec<EndpointId>,
}

struct PrepareCore {
    responses: Vec<(EndpointId, bool, Option<Commit>, Option<Commit>)>,
    responded: Bitmap,
    finished: bool,
}

struct PrepareShared {
    required: u32,
    registration: Registration,
    core: Mutex<PrepareCore>,
    done: Notify,
}

#[derive(Clone)]
pub(crate) struct PrepareHandler {
    shared: Arc<PrepareShared>,
}

impl PrepareHandler {
    pub(crate) fn new(required: u32) -> Self {
        PrepareHandler {
            shared: Arc::new(PrepareShared {
                registration: Registration::default(),
                required,
                core: Mutex::new(PrepareCore {
                    responses: Vec::new(),
                    responded: Bitmap::new(ID_SPACE, false),
                    finished: false,
                }),
                done: Notify::new(),
            }),
        }
    }

    fn record(
        &self,
        from: EndpointId,
        promised: bool,
        in_progress: Option<Commit>,
        mrc: Option<Commit>,
    ) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished || core.responded.get(from) {
            return;
        }
        let _ = core.responded.set(from, true);
        core.responses.push((from, promised, in_progress, mrc));
        if core.responses.len() as u32 >= self.shared.required {
            core.finished = true;
            self.shared.done.notify_waiters();
        }
    }

    /// Waits for a quorum of prepare responses and summarizes them.
    pub(crate) async fn await_summary(
        &self,
        timeout: Duration,
        consistency: ConsistencyLevel,
    ) -> Result<PrepareSummary, CoordError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.done.notified());
            notified.as_mut().enable();

            {
                let core = self.shared.core.lock().unwrap();
                if core.responses.len() as u32 >= self.shared.required {
                    return Ok(Self::summarize(&core.responses));
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                let core = self.shared.core.lock().unwrap();
                return Err(CoordError::WriteTimeout {
                    write_type: WriteType::Cas,
                    consistency,
                    received: core.responses.len() as u32,
                    block_for: self.shared.required,
                });
            }
        }
    }

    fn summarize(
        responses: &[(EndpointId, bool, Option<Commit>, Option<Commit>)],
    ) -> PrepareSummary {
        let promised = responses.iter().all(|(_, p, _, _)| *p);

        let in_progress = responses
            .iter()
            .filter_map(|(_, _, ip, _)| ip.clone())
            .max_by_key(|c| c.ballot);

        let in_progress_with_update = responses
            .iter()
            .filter_map(|(_, _, ip, _)| ip.clone())
            .filter(|c| c.update.is_some())
            .max_by_key(|c| c.ballot);

        let most_recent_commit = responses
            .iter()
            .filter_map(|(_, _, _, mrc)| mrc.clone())
            .max_by_key(|c| c.ballot);

        let missing_mrc = match &most_recent_commit {
            None => vec![],
            Some(latest) => responses
                .iter()
                .filter(|(_, _, _, mrc)| match mrc {
                    None => true,
                    Some(c) => c.ballot < latest.ballot,
                })
                .map(|(ep, _, _, _)| *ep)
                .collect(),
        };

        PrepareSummary {
            promised,
            in_progress,
            in_progress_with_update,
            most_recent_commit,
            missing_mrc,
        }
    }
}

impl ResponseSink for PrepareHandler {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply) {
        if let ReplicaReply::PrepareResponse {
            promised,
            in_progress,
            most_recent_commit,
        } = reply
        {
            self.record(from, promised, in_progress, most_recent_commit);
        }
    }

    fn on_failure(&self, _from: EndpointId) {
        // prepare failures surface as a missing response; the round
        // times out and retries under a fresh ballot
    }
}

/// Tally of one propose round.
pub(crate) struct ProposeSummary {
    pub accepts: u32,
    pub refusals: u32,
}

impl ProposeSummary {
    pub(crate) fn fully_refused(&self) -> bool {
        self.accepts == 0 && self.refusals > 0
    }
}

struct ProposeCore {
    accepts: u32,
    refusals: u32,
    responded: Bitmap,
    finished: bool,
}

struct ProposeShared {
    required: u32,
    targets: u32,
    registration: Registration,
    core: Mutex<ProposeCore>,
    done: Notify,
}

#[derive(Clone)]
pub(crate) struct ProposeHandler {
    shared: Arc<ProposeShared>,
}

impl ProposeHandler {
    pub(crate) fn new(targets: u32, required: u32) -> Self {
        ProposeHandler {
            shared: Arc::new(ProposeShared {
                registration: Registration::default(),
                required,
                targets,
                core: Mutex::new(ProposeCore {
                    accepts: 0,
                    refusals: 0,
                    responded: Bitmap::new(ID_SPACE, false),
                    finished: false,
                }),
                done: Notify::new(),
            }),
        }
    }

    fn record(&self, from: EndpointId, accepted: bool) {
        let mut core = self.shared.core.lock().unwrap();
        if core.finished || core.responded.get(from) {
            return;
        }
        let _ = core.responded.set(from, true);
        if accepted {
            core.accepts += 1;
        } else {
            core.refusals += 1;
        }
        if core.accepts >= self.shared.required
            || core.accepts + core.refusals >= self.shared.targets
        {
            core.finished = true;
            self.shared.done.notify_waiters();
        }
    }

    /// Waits until the proposal is decided (quorum accepted or everyone
    /// answered). Missing responses at the deadline are a CAS timeout.
    pub(crate) async fn await_summary(
        &self,
        timeout: Duration,
        consistency: ConsistencyLevel,
    ) -> Result<ProposeSummary, CoordError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.done.notified());
            notified.as_mut().enable();

            {
                let core = self.shared.core.lock().unwrap();
                if core.finished {
                    return Ok(ProposeSummary {
                        accepts: core.accepts,
                        refusals: core.refusals,
                    });
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                let core = self.shared.core.lock().unwrap();
                return Err(CoordError::WriteTimeout {
                    write_type: WriteType::Cas,
                    consistency,
                    received: core.accepts,
                    block_for: self.shared.required,
                });
            }
        }
    }

    pub(crate) fn is_accepted(&self, summary: &ProposeSummary) -> bool {
        summary.accepts >= self.shared.required
    }
}

impl ResponseSink for ProposeHandler {
    fn on_reply(&self, from: EndpointId, reply: ReplicaReply) {
        if let ReplicaReply::ProposeResponse { accepted } = reply {
            self.record(from, accepted);
        }
    }

    fn on_failure(&self, from: EndpointId) {
        self.record(from, false);
    }
}

impl_registration!(WriteHandler);
impl_registration!(ReadHandler);
impl_registration!(RangeHandler);
impl_registration!(PrepareHandler);
impl_registration!(ProposeHandler);

#[cfg(test)]
mod collector_tests {
    use super::*;

    fn write_handler(
        targets: u32,
        block_for: u32,
        natural: Vec<EndpointId>,
    ) -> WriteHandler {
        WriteHandler {
            shared: Arc::new(WriteShared {
                registration: Registration::default(),
                consistency: ConsistencyLevel::Quorum,
                write_type: WriteType::Simple,
                block_for,
                targets,
                core: Mutex::new(WriteCore {
                    received: Bitmap::new(ID_SPACE, false),
                    failed: Bitmap::new(ID_SPACE, false),
                    anonymous: 0,
                    finished: None,
                }),
                done: Notify::new(),
            }),
            natural,
            pending: vec![],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_quorum_met() -> Result<(), CoordError> {
        let handler = write_handler(3, 2, vec![0, 1, 2]);
        handler.signal_success(Some(0));
        handler.signal_success(Some(1));
        handler.await_acks(Duration::from_millis(100)).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_duplicate_responses_count_once() {
        let handler = write_handler(3, 2, vec![0, 1, 2]);
        handler.signal_success(Some(1));
        handler.signal_success(Some(1));
        assert_eq!(handler.received(), 1);
        let err = handler
            .await_acks(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::WriteTimeout {
                received: 1,
                block_for: 2,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_failure_when_quorum_impossible() {
        let handler = write_handler(3, 2, vec![0, 1, 2]);
        handler.signal_failure(0);
        handler.signal_failure(1);
        let err = handler
            .await_acks(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::WriteFailure { failures: 2, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn anonymous_signals_satisfy_cl_any() -> Result<(), CoordError> {
        let handler = write_handler(3, 1, vec![0, 1, 2]);
        handler.signal_success(None);
        handler.await_acks(Duration::from_millis(100)).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_waits_for_data_response() {
        let handler =
            ReadHandler::new(vec![0, 1], ConsistencyLevel::Quorum, 2);
        handler.record_digest(0, 7);
        handler.record_digest(1, 7);
        // two digests but no data: must not complete
        let err = handler
            .await_responses(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordError::ReadTimeout {
                data_present: false,
                ..
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_detects_digest_mismatch() -> Result<(), CoordError> {
        let handler =
            ReadHandler::new(vec![0, 1], ConsistencyLevel::Quorum, 2);
        let partition = Partition {
            key: "k".into(),
            rows: vec![],
        };
        handler.record_data(0, partition);
        handler.record_digest(1, 12345);
        handler.await_responses(Duration::from_millis(100)).await?;
        assert!(!handler.digests_consistent());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn propose_partial_acceptance() -> Result<(), CoordError> {
        let handler = ProposeHandler::new(3, 2);
        handler.record(0, true);
        handler.record(1, false);
        handler.record(2, false);
        let summary = handler
            .await_summary(Duration::from_millis(100), ConsistencyLevel::Serial)
            .await?;
        assert!(!handler.is_accepted(&summary));
        assert!(!summary.fully_refused());
        Ok(())
    }

    #[test]
    fn prepare_summary_finds_missing_mrc() {
        let clock = crate::model::BallotClock::new(0);
        let old = clock.next(0);
        let new = clock.next(0);
        let mrc_old = Commit::new_prepare("k".into(), old);
        let mrc_new = Commit::new_prepare("k".into(), new);

        let summary = PrepareHandler::summarize(&[
            (0, true, None, Some(mrc_new.clone())),
            (1, true, None, Some(mrc_old)),
            (2, true, None, None),
        ]);
        assert!(summary.promised);
        assert_eq!(summary.missing_mrc, vec![1, 2]);
        assert_eq!(summary.most_recent_commit.unwrap().ballot, new);
    }
}
