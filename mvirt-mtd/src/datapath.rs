//! Datapath (switch) abstraction consumed by the controller.
//!
//! The wire transport to real switches lives outside this crate; anything
//! that can install rules, clear its table and emit packets implements
//! [`Datapath`].

use crate::flow::{FlowRule, PacketOut};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Opaque datapath identifier (OpenFlow dpid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapathId(pub u64);

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Datapath errors.
#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("Datapath {0} disconnected")]
    Disconnected(DatapathId),

    #[error("Datapath {0} not registered")]
    UnknownDatapath(DatapathId),
}

pub type Result<T> = std::result::Result<T, DatapathError>;

/// A connected forwarding element.
///
/// `install_rule` replaces any rule with the same match and priority.
#[async_trait]
pub trait Datapath: Send + Sync {
    fn id(&self) -> DatapathId;

    async fn install_rule(&self, rule: &FlowRule) -> Result<()>;

    /// Remove every installed rule.
    async fn clear_rules(&self) -> Result<()>;

    async fn send_packet(&self, packet: &PacketOut) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datapath_id_display() {
        assert_eq!(DatapathId(0x1a).to_string(), "000000000000001a");
        assert_eq!(
            DatapathError::Disconnected(DatapathId(1)).to_string(),
            "Datapath 0000000000000001 disconnected"
        );
    }
}
