//! In-memory mock cluster backing the coordinator scenario tests: every
//! external collaborator (placement, liveness, snitch, strategy,
//! messaging, storage, hint store) implemented over shared state, with a
//! real Paxos acceptor per replica.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use colonnade::{
    token_of, AcceptorState, CallbackRegistry, Cell, Commit, CoordError,
    Coordinator, CoordinatorConfig, CoordinatorSeed, EndpointId, HintStore,
    LivenessDetector, MessagingService, Mutation, Partition, PlacementOracle,
    RangeReadCommand, ReadCommand, ReplicaReply, ReplicaRequest,
    ReplicationStrategy, Row, Snitch, StorageEngine, StorageError,
    TableUpdate, Token, TopologySnapshot, Verb,
};

use uuid::Uuid;

// ---------------------------------------------------------------------
// replica state
// ---------------------------------------------------------------------

pub struct MockReplica {
    pub id: EndpointId,
    pub schema_version: String,
    /// (keyspace, table) -> key -> partition contents.
    pub data: Mutex<HashMap<(String, String), BTreeMap<String, Partition>>>,
    /// Per-partition-key Paxos acceptor state.
    pub paxos: Mutex<HashMap<String, AcceptorState>>,
}

impl MockReplica {
    fn new(id: EndpointId, schema_version: &str) -> Self {
        MockReplica {
            id,
            schema_version: schema_version.to_string(),
            data: Mutex::new(HashMap::new()),
            paxos: Mutex::new(HashMap::new()),
        }
    }

    pub fn apply(&self, mutation: &Mutation) {
        let mut data = self.data.lock().unwrap();
        for update in &mutation.updates {
            let table = data
                .entry((mutation.keyspace.clone(), update.table.clone()))
                .or_default();
            let incoming = Partition {
                key: mutation.key.clone(),
                rows: update.rows.clone(),
            };
            let merged = match table.get(&mutation.key) {
                Some(existing) => colonnade::reconcile(
                    &mutation.key,
                    &[existing, &incoming],
                ),
                None => incoming,
            };
            table.insert(mutation.key.clone(), merged);
        }
    }

    pub fn read(&self, command: &ReadCommand) -> Partition {
        let data = self.data.lock().unwrap();
        let partition = data
            .get(&(command.keyspace.clone(), command.table.clone()))
            .and_then(|t| t.get(&command.key))
            .cloned()
            .unwrap_or(Partition {
                key: command.key.clone(),
                rows: vec![],
            });
        let rows: Vec<Row> = partition
            .rows
            .into_iter()
            .filter(|r| match &command.lower_bound {
                Some(bound) => r.clustering > *bound,
                None => true,
            })
            .take(command.limit)
            .collect();
        Partition {
            key: command.key.clone(),
            rows,
        }
    }

    pub fn scan(&self, command: &RangeReadCommand) -> Vec<Partition> {
        let data = self.data.lock().unwrap();
        let mut hits: Vec<(Token, Partition)> = data
            .get(&(command.keyspace.clone(), command.table.clone()))
            .map(|t| {
                t.values()
                    .filter(|p| command.range.contains(token_of(&p.key)))
                    .map(|p| (token_of(&p.key), p.clone()))
                    .collect()
            })
            .unwrap_or_default();
        hits.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.key.cmp(&b.1.key)));
        hits.into_iter().map(|(_, p)| p).collect()
    }

    pub fn truncate(&self, keyspace: &str, table: &str) {
        self.data
            .lock()
            .unwrap()
            .remove(&(keyspace.to_string(), table.to_string()));
    }

    /// The partition a test wants to inspect directly.
    pub fn partition(
        &self,
        keyspace: &str,
        table: &str,
        key: &str,
    ) -> Option<Partition> {
        self.data
            .lock()
            .unwrap()
            .get(&(keyspace.to_string(), table.to_string()))
            .and_then(|t| t.get(key))
            .cloned()
    }

    /// Most recent commit ballot this replica learned for a key.
    pub fn learned_ballot(&self, key: &str) -> Option<colonnade::Ballot> {
        self.paxos
            .lock()
            .unwrap()
            .get(key)
            .and_then(|s| s.most_recent_commit.as_ref().map(|c| c.ballot))
    }

    fn handle(&self, request: &ReplicaRequest) -> Option<ReplicaReply> {
        match request {
            ReplicaRequest::Mutation { mutation, .. } => {
                self.apply(mutation);
                Some(ReplicaReply::WriteOk)
            }
            ReplicaRequest::CounterMutation { mutation, .. } => {
                self.apply(mutation);
                Some(ReplicaReply::WriteOk)
            }
            ReplicaRequest::Read {
                command,
                digest_only,
            } => {
                let partition = self.read(command);
                let digest = colonnade::content_digest(&partition);
                Some(ReplicaReply::ReadResponse {
                    data: if *digest_only {
                        None
                    } else {
                        Some(partition)
                    },
                    digest,
                })
            }
            ReplicaRequest::RangeRead { command } => {
                Some(ReplicaReply::RangeResponse {
                    data: self.scan(command),
                })
            }
            ReplicaRequest::PaxosPrepare { commit } => {
                let mut paxos = self.paxos.lock().unwrap();
                let state = paxos.entry(commit.key.clone()).or_default();
                let (promised, accepted, mrc) = state.prepare(commit.ballot);
                // a refusal reports the winning promise so the proposer
                // can pick a higher ballot next time
                let in_progress = if promised {
                    accepted
                } else {
                    accepted.or_else(|| {
                        Some(Commit::new_prepare(
                            commit.key.clone(),
                            state.promised,
                        ))
                    })
                };
                Some(ReplicaReply::PrepareResponse {
                    promised,
                    in_progress,
                    most_recent_commit: mrc,
                })
            }
            ReplicaRequest::PaxosPropose { commit } => {
                let mut paxos = self.paxos.lock().unwrap();
                let state = paxos.entry(commit.key.clone()).or_default();
                Some(ReplicaReply::ProposeResponse {
                    accepted: state.accept(commit),
                })
            }
            ReplicaRequest::PaxosCommit { commit } => {
                {
                    let mut paxos = self.paxos.lock().unwrap();
                    paxos
                        .entry(commit.key.clone())
                        .or_default()
                        .learn(commit);
                }
                if let Some(update) = &commit.update {
                    self.apply(update);
                }
                Some(ReplicaReply::WriteOk)
            }
            ReplicaRequest::Truncate { keyspace, table } => {
                self.truncate(keyspace, table);
                Some(ReplicaReply::TruncateOk)
            }
            ReplicaRequest::SchemaCheck => {
                Some(ReplicaReply::SchemaVersion {
                    version: self.schema_version.clone(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------
// shared cluster state
// ---------------------------------------------------------------------

pub struct SharedState {
    pub replicas: HashMap<EndpointId, Arc<MockReplica>>,
    pub ring: Vec<(Token, EndpointId)>,
    pub dc_of: HashMap<EndpointId, String>,
    pub rack_of: HashMap<EndpointId, String>,
    pub down: Mutex<HashSet<EndpointId>>,
    pub pending: Mutex<Vec<EndpointId>>,
    pub merge_worthwhile: AtomicBool,
    /// Every request the coordinator handed to the transport.
    pub sent: Mutex<Vec<(EndpointId, ReplicaRequest)>>,
    pub dropped: Mutex<HashMap<Verb, u64>>,
}

impl SharedState {
    pub fn set_down(&self, endpoint: EndpointId) {
        self.down.lock().unwrap().insert(endpoint);
    }

    pub fn set_up(&self, endpoint: EndpointId) {
        self.down.lock().unwrap().remove(&endpoint);
    }

    pub fn is_down(&self, endpoint: EndpointId) -> bool {
        self.down.lock().unwrap().contains(&endpoint)
    }

    pub fn sent_to(&self, endpoint: EndpointId) -> Vec<ReplicaRequest> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == endpoint)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Seeds a partition directly on every replica, bypassing the
    /// coordinator.
    pub fn seed_all(
        &self,
        keyspace: &str,
        table: &str,
        key: &str,
        rows: Vec<Row>,
    ) {
        let mutation = Mutation {
            keyspace: keyspace.into(),
            key: key.into(),
            updates: vec![TableUpdate {
                table: table.into(),
                rows,
            }],
        };
        for replica in self.replicas.values() {
            replica.apply(&mutation);
        }
    }

    pub fn replica(&self, endpoint: EndpointId) -> Arc<MockReplica> {
        self.replicas[&endpoint].clone()
    }
}

// ---------------------------------------------------------------------
// collaborator implementations
// ---------------------------------------------------------------------

pub struct MockPlacement {
    shared: Arc<SharedState>,
    rf: u8,
}

impl PlacementOracle for MockPlacement {
    fn natural_endpoints(
        &self,
        _keyspace: &str,
        token: Token,
    ) -> Vec<EndpointId> {
        let ring = &self.shared.ring;
        if ring.is_empty() {
            return vec![];
        }
        let start = ring.partition_point(|&(t, _)| t < token);
        let mut out = Vec::new();
        for i in 0..ring.len() {
            let (_, ep) = ring[(start + i) % ring.len()];
            if !out.contains(&ep) {
                out.push(ep);
            }
            if out.len() == self.rf as usize {
                break;
            }
        }
        out
    }

    fn pending_endpoints(
        &self,
        _token: Token,
        _keyspace: &str,
    ) -> Vec<EndpointId> {
        self.shared.pending.lock().unwrap().clone()
    }

    fn host_id(&self, endpoint: EndpointId) -> Option<Uuid> {
        Some(Uuid::from_u128(endpoint as u128 + 1))
    }

    fn sorted_tokens(&self) -> Vec<Token> {
        self.shared.ring.iter().map(|&(t, _)| t).collect()
    }

    fn topology(&self) -> TopologySnapshot {
        let mut dcs: HashMap<String, HashMap<String, Vec<EndpointId>>> =
            HashMap::new();
        for (&ep, dc) in &self.shared.dc_of {
            dcs.entry(dc.clone())
                .or_default()
                .entry(self.shared.rack_of[&ep].clone())
                .or_default()
                .push(ep);
        }
        TopologySnapshot { dcs }
    }
}

pub struct MockLiveness {
    shared: Arc<SharedState>,
}

impl LivenessDetector for MockLiveness {
    fn is_alive(&self, endpoint: EndpointId) -> bool {
        !self.shared.is_down(endpoint)
    }

    fn downtime_ms(&self, endpoint: EndpointId) -> u64 {
        if self.shared.is_down(endpoint) {
            1000
        } else {
            0
        }
    }

    fn live_members(&self) -> HashSet<EndpointId> {
        self.shared
            .replicas
            .keys()
            .copied()
            .filter(|&ep| !self.shared.is_down(ep))
            .collect()
    }

    fn unreachable_members(&self) -> HashSet<EndpointId> {
        self.shared.down.lock().unwrap().clone()
    }

    fn live_token_owners(&self) -> HashSet<EndpointId> {
        self.live_members()
    }

    fn unreachable_token_owners(&self) -> HashSet<EndpointId> {
        self.unreachable_members()
    }
}

pub struct MockSnitch {
    shared: Arc<SharedState>,
}

impl Snitch for MockSnitch {
    fn datacenter(&self, endpoint: EndpointId) -> String {
        self.shared.dc_of[&endpoint].clone()
    }

    fn rack(&self, endpoint: EndpointId) -> String {
        self.shared.rack_of[&endpoint].clone()
    }

    fn sort_by_proximity(
        &self,
        me: EndpointId,
        endpoints: &mut Vec<EndpointId>,
    ) {
        let my_dc = self.shared.dc_of[&me].clone();
        endpoints.sort_by_key(|&ep| {
            let same_dc = self.shared.dc_of[&ep] == my_dc;
            let distance = (ep as i16 - me as i16).unsigned_abs();
            (!same_dc, distance, ep)
        });
    }

    fn is_worth_merging_for_range_query(
        &self,
        _merged: &[EndpointId],
        _left: &[EndpointId],
        _right: &[EndpointId],
    ) -> bool {
        self.shared.merge_worthwhile.load(Ordering::Relaxed)
    }
}

pub struct MockStrategy {
    rf: u8,
    rf_local: u8,
}

impl ReplicationStrategy for MockStrategy {
    fn replication_factor(&self, _keyspace: &str) -> u8 {
        self.rf
    }

    fn local_replication_factor(&self, _keyspace: &str, _dc: &str) -> u8 {
        self.rf_local
    }
}

/// Transport mock: processes requests against the target replica on a
/// spawned task and routes replies through the registry. Down endpoints
/// swallow their messages.
pub struct MockMessaging {
    shared: Arc<SharedState>,
    registry: Arc<CallbackRegistry>,
}

impl MessagingService for MockMessaging {
    fn send_one_way(&self, request: ReplicaRequest, to: EndpointId) {
        self.shared.sent.lock().unwrap().push((to, request.clone()));
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if shared.is_down(to) {
                return;
            }
            let _ = shared.replica(to).handle(&request);
        });
    }

    fn send_rr(
        &self,
        request: ReplicaRequest,
        to: EndpointId,
        callback: colonnade::CallbackId,
    ) {
        self.shared.sent.lock().unwrap().push((to, request.clone()));
        let shared = self.shared.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if shared.is_down(to) {
                return; // silence; the handler times out
            }
            let replica = shared.replica(to);
            // forwarding header: the relay fans the mutation out within
            // its own datacenter and acks flow back per callback id
            if let ReplicaRequest::Mutation { forward_to, .. } = &request {
                for &(peer, peer_cb) in forward_to {
                    if shared.is_down(peer) {
                        continue;
                    }
                    let peer_replica = shared.replica(peer);
                    if let Some(reply) = peer_replica.handle(&request) {
                        registry.deliver(peer, peer_cb, reply);
                    }
                }
            }
            if let Some(reply) = replica.handle(&request) {
                registry.deliver(to, callback, reply);
            }
        });
    }

    fn increment_dropped(&self, verb: Verb) {
        *self.shared.dropped.lock().unwrap().entry(verb).or_insert(0) += 1;
    }
}

/// The coordinator's own storage is its mock replica's.
pub struct MockStorage {
    replica: Arc<MockReplica>,
}

#[async_trait]
impl StorageEngine for MockStorage {
    async fn apply(&self, mutation: &Mutation) -> Result<(), StorageError> {
        self.replica.apply(mutation);
        Ok(())
    }

    async fn apply_counter(
        &self,
        mutation: &Mutation,
    ) -> Result<Mutation, StorageError> {
        self.replica.apply(mutation);
        // the post-read result of the counter apply
        Ok(mutation.clone())
    }

    async fn read(
        &self,
        command: &ReadCommand,
    ) -> Result<Partition, StorageError> {
        Ok(self.replica.read(command))
    }

    async fn scan(
        &self,
        command: &RangeReadCommand,
    ) -> Result<Vec<Partition>, StorageError> {
        Ok(self.replica.scan(command))
    }

    async fn truncate(
        &self,
        keyspace: &str,
        table: &str,
    ) -> Result<(), StorageError> {
        self.replica.truncate(keyspace, table);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockHintStore {
    pub recorded: Mutex<Vec<(Uuid, Mutation)>>,
}

impl MockHintStore {
    pub fn hints_for(&self, host_id: Uuid) -> usize {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == host_id)
            .count()
    }

    pub fn total(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }
}

impl HintStore for MockHintStore {
    fn calculate_hint_ttl(&self, _mutation: &Mutation) -> i64 {
        600
    }

    fn hint_for(
        &self,
        mutation: &Mutation,
        _now_ms: u64,
        _ttl_secs: i64,
        host_id: Uuid,
    ) -> Mutation {
        self.recorded
            .lock()
            .unwrap()
            .push((host_id, mutation.clone()));
        Mutation {
            keyspace: "system".into(),
            key: host_id.to_string(),
            updates: vec![TableUpdate {
                table: "hints".into(),
                rows: vec![Row {
                    clustering: mutation.key.clone(),
                    cells: vec![Cell {
                        column: "mutation".into(),
                        value: Some(mutation.key.clone()),
                        timestamp: 0,
                        local_deletion_time: 0,
                    }],
                }],
            }],
        }
    }
}

// ---------------------------------------------------------------------
// cluster assembly
// ---------------------------------------------------------------------

pub struct TestCluster {
    pub coordinator: Coordinator,
    pub shared: Arc<SharedState>,
    pub hint_store: Arc<MockHintStore>,
}

/// Evenly spaced ring token of endpoint `i` in an `n`-node cluster.
pub fn ring_token(i: u8, n: u8) -> Token {
    let step = u64::MAX / (n as u64 + 1);
    (i as u64 + 1) * step
}

/// Single-DC cluster of `n` nodes (each its own rack) at the given
/// replication factor, with node 0 as coordinator.
pub fn build_cluster(n: u8, rf: u8) -> TestCluster {
    let layout: Vec<(EndpointId, String, String)> = (0..n)
        .map(|i| (i, "dc1".to_string(), format!("rack{}", i)))
        .collect();
    build_cluster_with(&layout, rf, rf, CoordinatorConfig::default())
}

/// Fully custom cluster layout; node `layout[0].0` is the coordinator.
pub fn build_cluster_with(
    layout: &[(EndpointId, String, String)],
    rf: u8,
    rf_local: u8,
    config: CoordinatorConfig,
) -> TestCluster {
    let n = layout.len() as u8;
    let replicas: HashMap<EndpointId, Arc<MockReplica>> = layout
        .iter()
        .map(|&(id, _, _)| (id, Arc::new(MockReplica::new(id, "v1"))))
        .collect();
    let ring: Vec<(Token, EndpointId)> = layout
        .iter()
        .enumerate()
        .map(|(i, &(id, _, _))| (ring_token(i as u8, n), id))
        .collect();

    let shared = Arc::new(SharedState {
        replicas,
        ring,
        dc_of: layout
            .iter()
            .map(|(id, dc, _)| (*id, dc.clone()))
            .collect(),
        rack_of: layout
            .iter()
            .map(|(id, _, rack)| (*id, rack.clone()))
            .collect(),
        down: Mutex::new(HashSet::new()),
        pending: Mutex::new(Vec::new()),
        merge_worthwhile: AtomicBool::new(false),
        sent: Mutex::new(Vec::new()),
        dropped: Mutex::new(HashMap::new()),
    });

    let hint_store = Arc::new(MockHintStore::default());
    let coordinator =
        coordinator_at(&shared, &hint_store, layout[0].0, rf, rf_local, config);

    TestCluster {
        coordinator,
        shared,
        hint_store,
    }
}

/// A second coordinator over the same cluster (for contention tests).
pub fn coordinator_at(
    shared: &Arc<SharedState>,
    hint_store: &Arc<MockHintStore>,
    me: EndpointId,
    rf: u8,
    rf_local: u8,
    config: CoordinatorConfig,
) -> Coordinator {
    let registry = Arc::new(CallbackRegistry::new());
    let seed = CoordinatorSeed {
        me,
        schema_version: "v1".into(),
        config,
        placement: Arc::new(MockPlacement {
            shared: shared.clone(),
            rf,
        }),
        liveness: Arc::new(MockLiveness {
            shared: shared.clone(),
        }),
        snitch: Arc::new(MockSnitch {
            shared: shared.clone(),
        }),
        strategy: Arc::new(MockStrategy { rf, rf_local }),
        messaging: Arc::new(MockMessaging {
            shared: shared.clone(),
            registry: registry.clone(),
        }),
        storage: Arc::new(MockStorage {
            replica: shared.replica(me),
        }),
        hint_store: hint_store.clone(),
        callbacks: registry,
    };
    Coordinator::new_and_setup(seed).expect("coordinator setup")
}

// ---------------------------------------------------------------------
// data helpers
// ---------------------------------------------------------------------

pub fn cell(column: &str, value: &str, timestamp: i64) -> Cell {
    Cell {
        column: column.into(),
        value: Some(value.into()),
        timestamp,
        local_deletion_time: 0,
    }
}

pub fn row(clustering: &str, cells: Vec<Cell>) -> Row {
    Row {
        clustering: clustering.into(),
        cells,
    }
}

pub fn mutation(keyspace: &str, table: &str, key: &str, rows: Vec<Row>) -> Mutation {
    Mutation {
        keyspace: keyspace.into(),
        key: key.into(),
        updates: vec![TableUpdate {
            table: table.into(),
            rows,
        }],
    }
}

pub fn read_command(keyspace: &str, table: &str, key: &str, limit: usize) -> ReadCommand {
    ReadCommand {
        keyspace: keyspace.into(),
        table: table.into(),
        key: key.into(),
        lower_bound: None,
        limit,
    }
}

/// Polls an assertion until it holds or the budget runs out; for effects
/// that complete asynchronously (hints, background repair).
pub async fn eventually(
    what: &str,
    mut check: impl FnMut() -> bool,
) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
    }
    panic!("condition never held: {}", what);
}

/// Convenience: error is the unavailable kind.
pub fn is_unavailable(result: &Result<(), CoordError>) -> bool {
    matches!(result, Err(CoordError::Unavailable { .. }))
}
