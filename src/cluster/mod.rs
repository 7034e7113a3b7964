//! Cluster topology view: endpoint identifiers, the ring token space, and
//! the narrow contracts through which the coordinator consumes the
//! placement oracle, the liveness detector, and the snitch.

mod liveness;
mod placement;
mod snitch;
mod strategy;

pub use liveness::LivenessDetector;
pub use placement::{PlacementOracle, TopologySnapshot};
pub use snitch::Snitch;
pub use strategy::{ConsistencyLevel, ReplicationStrategy};

/// Cluster-local endpoint index. Kept small so that per-endpoint quorum
/// accounting fits a bitmap.
pub type EndpointId = u8;

/// Ring position. Partition keys hash onto this space; replica ownership
/// is delimited by the sorted node tokens.
pub type Token = u64;

/// The minimum ring token. A scan piece whose right bound is the minimum
/// token wraps around the ring end.
pub const MIN_TOKEN: Token = 0;
