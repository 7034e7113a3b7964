//! Consistency levels and the replication strategy contract.

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Per-keyspace replication policy, consumed from the schema subsystem.
pub trait ReplicationStrategy: Send + Sync {
    /// Total replication factor of a keyspace.
    fn replication_factor(&self, keyspace: &str) -> u8;

    /// Replication factor of a keyspace within one datacenter.
    fn local_replication_factor(&self, keyspace: &str, dc: &str) -> u8;
}

/// Client-requested consistency level.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Copy,
    Clone,
    Hash,
    Serialize,
    Deserialize,
    GetSize,
)]
pub enum ConsistencyLevel {
    /// A hint alone satisfies the write.
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    /// Linearizable, cluster-wide Paxos.
    Serial,
    /// Linearizable within the local datacenter.
    LocalSerial,
}

impl ConsistencyLevel {
    /// Minimum replica acknowledgements required for this level given a
    /// keyspace's total and local-DC replication factors.
    pub fn block_for(&self, rf: u8, local_rf: u8) -> u8 {
        match self {
            ConsistencyLevel::Any | ConsistencyLevel::One => 1,
            ConsistencyLevel::Two => 2,
            ConsistencyLevel::Three => 3,
            ConsistencyLevel::Quorum | ConsistencyLevel::Serial => {
                rf / 2 + 1
            }
            ConsistencyLevel::All => rf,
            ConsistencyLevel::LocalQuorum | ConsistencyLevel::LocalSerial => {
                local_rf / 2 + 1
            }
        }
    }

    /// Serial levels drive the Paxos path instead of regular quorums.
    #[inline]
    pub fn is_serial(&self) -> bool {
        matches!(
            self,
            ConsistencyLevel::Serial | ConsistencyLevel::LocalSerial
        )
    }

    /// Levels whose scope is a single datacenter.
    #[inline]
    pub fn is_datacenter_local(&self) -> bool {
        matches!(
            self,
            ConsistencyLevel::LocalQuorum | ConsistencyLevel::LocalSerial
        )
    }

    /// Validates this level as the Paxos round consistency of a CAS.
    pub fn validate_for_cas(&self) -> Result<(), crate::utils::CoordError> {
        if self.is_serial() {
            Ok(())
        } else {
            Err(crate::utils::CoordError::InvalidRequest(format!(
                "invalid consistency {:?} for conditional update, use \
                 Serial or LocalSerial",
                self
            )))
        }
    }

    /// Validates this level as the commit consistency of a CAS.
    pub fn validate_for_cas_commit(
        &self,
    ) -> Result<(), crate::utils::CoordError> {
        if self.is_serial() {
            Err(crate::utils::CoordError::InvalidRequest(format!(
                "invalid commit consistency {:?}, serial levels apply to \
                 the Paxos round only",
                self
            )))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod strategy_tests {
    use super::*;

    #[test]
    fn block_for_levels() {
        assert_eq!(ConsistencyLevel::Any.block_for(3, 3), 1);
        assert_eq!(ConsistencyLevel::One.block_for(3, 3), 1);
        assert_eq!(ConsistencyLevel::Quorum.block_for(3, 3), 2);
        assert_eq!(ConsistencyLevel::Quorum.block_for(5, 5), 3);
        assert_eq!(ConsistencyLevel::All.block_for(3, 3), 3);
        assert_eq!(ConsistencyLevel::LocalQuorum.block_for(6, 3), 2);
        assert_eq!(ConsistencyLevel::Serial.block_for(3, 3), 2);
    }

    #[test]
    fn cas_validation() {
        assert!(ConsistencyLevel::Serial.validate_for_cas().is_ok());
        assert!(ConsistencyLevel::Quorum.validate_for_cas().is_err());
        assert!(ConsistencyLevel::Quorum.validate_for_cas_commit().is_ok());
        assert!(ConsistencyLevel::LocalSerial
            .validate_for_cas_commit()
            .is_err());
    }
}
