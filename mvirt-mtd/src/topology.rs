//! Topology tracking: which datapath each real host hangs off, and
//! per-datapath MAC learning.

use crate::datapath::DatapathId;
use crate::flow::PortNo;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Host locations and learned ports.
///
/// The two tables are locked independently so MAC learning on one datapath
/// never waits on location lookups.
#[derive(Default)]
pub struct TopologyTracker {
    /// First datapath a real host was seen on.
    locations: RwLock<HashMap<Ipv4Addr, DatapathId>>,
    /// MAC → ingress port, partitioned by datapath.
    ports: RwLock<HashMap<DatapathId, HashMap<EthernetAddress, PortNo>>>,
}

impl TopologyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where a host was first seen. Later sightings are ignored.
    ///
    /// Returns true if the location was newly recorded.
    pub fn record_location(&self, addr: Ipv4Addr, datapath: DatapathId) -> bool {
        let mut locations = self.locations.write().unwrap_or_else(PoisonError::into_inner);
        if locations.contains_key(&addr) {
            return false;
        }
        locations.insert(addr, datapath);
        debug!(host = %addr, datapath = %datapath, "Host location recorded");
        true
    }

    pub fn location_of(&self, addr: Ipv4Addr) -> Option<DatapathId> {
        self.locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
    }

    /// Unknown hosts are reachable from everywhere; known hosts only from
    /// the datapath they are attached to.
    pub fn is_reachable(&self, datapath: DatapathId, addr: Ipv4Addr) -> bool {
        self.location_of(addr)
            .is_none_or(|location| location == datapath)
    }

    pub fn update_port(&self, datapath: DatapathId, mac: EthernetAddress, port: PortNo) {
        self.ports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(datapath)
            .or_default()
            .insert(mac, port);
    }

    pub fn lookup_port(&self, datapath: DatapathId, mac: EthernetAddress) -> Option<PortNo> {
        self.ports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&datapath)
            .and_then(|table| table.get(&mac))
            .copied()
    }
}
