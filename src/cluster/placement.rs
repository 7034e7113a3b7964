//! Replica placement oracle contract.

use std::collections::HashMap;

use crate::cluster::{EndpointId, Token};

use uuid::Uuid;

/// Immutable snapshot of the cluster's datacenter/rack layout:
/// dc name -> rack name -> member endpoints.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    pub dcs: HashMap<String, HashMap<String, Vec<EndpointId>>>,
}

impl TopologySnapshot {
    /// Racks of one datacenter, or an empty map if the DC is unknown.
    pub fn racks_of(&self, dc: &str) -> HashMap<String, Vec<EndpointId>> {
        self.dcs.get(dc).cloned().unwrap_or_default()
    }
}

/// Maps keys to replicas. Implemented outside this crate by the token
/// ring / replica placement subsystem; the coordinator only ever reads a
/// consistent snapshot.
pub trait PlacementOracle: Send + Sync {
    /// Replicas the placement assigns to a token, in stable preference
    /// order.
    fn natural_endpoints(&self, keyspace: &str, token: Token) -> Vec<EndpointId>;

    /// Additional endpoints receiving writes for this token during a
    /// range movement.
    fn pending_endpoints(&self, token: Token, keyspace: &str) -> Vec<EndpointId>;

    /// Stable host identity of an endpoint (hint rows are keyed by it).
    fn host_id(&self, endpoint: EndpointId) -> Option<Uuid>;

    /// All ring tokens in ascending order.
    fn sorted_tokens(&self) -> Vec<Token>;

    /// Current datacenter/rack layout.
    fn topology(&self) -> TopologySnapshot;
}
