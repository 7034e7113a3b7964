//! Endpoint snitch contract: datacenter/rack topology and proximity.

use crate::cluster::EndpointId;

/// Topology oracle. Implementations range from static config files to
/// latency-adaptive snitches; the coordinator only asks these four
/// questions.
pub trait Snitch: Send + Sync {
    /// Datacenter name of an endpoint.
    fn datacenter(&self, endpoint: EndpointId) -> String;

    /// Rack name of an endpoint.
    fn rack(&self, endpoint: EndpointId) -> String;

    /// Reorders `endpoints` in place from nearest to farthest as seen
    /// from `me`.
    fn sort_by_proximity(&self, me: EndpointId, endpoints: &mut Vec<EndpointId>);

    /// Judges whether merging two adjacent scan ranges into one request
    /// is a win, given the endpoints each side would contact and the
    /// intersection that would serve the merged range.
    fn is_worth_merging_for_range_query(
        &self,
        merged: &[EndpointId],
        left: &[EndpointId],
        right: &[EndpointId],
    ) -> bool;
}
