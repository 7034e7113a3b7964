//! Endpoint resolution: mapping keys to natural/pending replicas and
//! filtering them by liveness, proximity, and datacenter. Pure over a
//! topology snapshot; no mutation.

use super::CoordinatorContext;

use crate::cluster::{ConsistencyLevel, EndpointId, Token};
use crate::utils::CoordError;

impl CoordinatorContext {
    /// Natural and pending write endpoints for a token.
    pub(crate) fn write_endpoints(
        &self,
        keyspace: &str,
        token: Token,
    ) -> (Vec<EndpointId>, Vec<EndpointId>) {
        let natural = self.placement.natural_endpoints(keyspace, token);
        let pending = self.placement.pending_endpoints(token, keyspace);
        (natural, pending)
    }

    /// Natural endpoints that are alive, nearest first.
    pub(crate) fn live_sorted_endpoints(
        &self,
        keyspace: &str,
        token: Token,
    ) -> Vec<EndpointId> {
        let mut live: Vec<EndpointId> = self
            .placement
            .natural_endpoints(keyspace, token)
            .into_iter()
            .filter(|&ep| self.liveness.is_alive(ep))
            .collect();
        self.snitch.sort_by_proximity(self.me, &mut live);
        live
    }

    /// Restricts candidate read endpoints to what the consistency level
    /// may contact (datacenter-local levels only talk to the local DC).
    pub(crate) fn filter_for_query(
        &self,
        endpoints: &[EndpointId],
        consistency: ConsistencyLevel,
    ) -> Vec<EndpointId> {
        if consistency.is_datacenter_local() {
            endpoints
                .iter()
                .copied()
                .filter(|&ep| self.snitch.datacenter(ep) == self.local_dc)
                .collect()
        } else {
            endpoints.to_vec()
        }
    }

    /// Live Paxos participants for a key and the quorum size over them.
    ///
    /// Participants are natural plus pending endpoints, restricted to the
    /// local DC for LocalSerial. More than one pending endpoint makes the
    /// operation impossible (reported with an unmeetable `required`);
    /// fewer live participants than the quorum is plain unavailability.
    pub(crate) fn paxos_participants(
        &self,
        keyspace: &str,
        token: Token,
        consistency: ConsistencyLevel,
    ) -> Result<(Vec<EndpointId>, usize), CoordError> {
        let (mut natural, mut pending) = self.write_endpoints(keyspace, token);
        if consistency == ConsistencyLevel::LocalSerial {
            natural.retain(|&ep| self.snitch.datacenter(ep) == self.local_dc);
            pending.retain(|&ep| self.snitch.datacenter(ep) == self.local_dc);
        }

        let participants = natural.len() + pending.len();
        let required = participants / 2 + 1;

        let live: Vec<EndpointId> = natural
            .iter()
            .chain(pending.iter())
            .copied()
            .filter(|&ep| self.liveness.is_alive(ep))
            .collect();
        if live.len() < required {
            return Err(CoordError::Unavailable {
                consistency,
                required: required as u32,
                alive: live.len() as u32,
            });
        }

        if pending.len() > 1 {
            // conditional updates cannot run with two or more pending
            // range movements; required is set past the participant count
            // to make the impossibility explicit
            return Err(CoordError::Unavailable {
                consistency,
                required: (participants + 1) as u32,
                alive: live.len() as u32,
            });
        }

        Ok((live, required))
    }
}

/// Order-preserving intersection of two endpoint lists. Both sides are
/// replica sets for a range (< RF entries), so the quadratic walk is the
/// fast path; proximity order of `left` survives into the result.
pub(crate) fn intersection(
    left: &[EndpointId],
    right: &[EndpointId],
) -> Vec<EndpointId> {
    left.iter()
        .copied()
        .filter(|ep| right.contains(ep))
        .collect()
}

#[cfg(test)]
mod endpoints_tests {
    use super::*;

    #[test]
    fn intersection_keeps_left_order() {
        assert_eq!(intersection(&[3, 1, 2], &[2, 3]), vec![3, 2]);
        assert_eq!(intersection(&[1, 2], &[3]), Vec::<EndpointId>::new());
    }
}
