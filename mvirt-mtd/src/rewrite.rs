//! Packet rewrite engine.
//!
//! For each packet-in the engine decides, against one consistent view of the
//! address mapping:
//! - whether the source is a protected host (rewrite it to its virtual
//!   address and remember which datapath it sits behind),
//! - whether the destination is a virtual address (translate it back, or
//!   drop when the host is attached to a different datapath),
//! - where the frame goes (learned port or flood),
//! - and which persistent rule, if any, to install for the flow.
//!
//! The engine performs no I/O; the controller executes the decision.

use crate::datapath::DatapathId;
use crate::flow::{
    Action, BufferId, ETH_TYPE_ARP, ETH_TYPE_IPV4, FLOW_PRIORITY, FlowMatch, FlowRule, OutputPort,
    PacketOut, PacketPayload, PortNo,
};
use crate::packet::{InboundPacket, PacketKind};
use crate::store::{AddressState, MappingStore, RealIp, VirtualIp};
use crate::topology::TopologyTracker;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Which protocol fields carry the L3 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressFields {
    Arp,
    Ipv4,
}

impl AddressFields {
    fn set_src(self, addr: Ipv4Addr) -> Action {
        match self {
            AddressFields::Arp => Action::SetArpSpa(addr),
            AddressFields::Ipv4 => Action::SetIpv4Src(addr),
        }
    }

    fn set_dst(self, addr: Ipv4Addr) -> Action {
        match self {
            AddressFields::Arp => Action::SetArpTpa(addr),
            AddressFields::Ipv4 => Action::SetIpv4Dst(addr),
        }
    }

    fn flow_match(self, in_port: PortNo, src: Ipv4Addr, dst: Ipv4Addr) -> FlowMatch {
        match self {
            AddressFields::Arp => FlowMatch {
                in_port: Some(in_port),
                eth_type: Some(ETH_TYPE_ARP),
                arp_spa: Some(src),
                arp_tpa: Some(dst),
                ..FlowMatch::default()
            },
            AddressFields::Ipv4 => FlowMatch {
                in_port: Some(in_port),
                eth_type: Some(ETH_TYPE_IPV4),
                ipv4_src: Some(src),
                ipv4_dst: Some(dst),
                ..FlowMatch::default()
            },
        }
    }
}

/// Outcome of processing one packet-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketDecision {
    /// Set-field actions followed by the output action, unless dropped.
    pub actions: Vec<Action>,
    /// Learned port, or flood if the destination MAC is unknown.
    pub egress: OutputPort,
    /// The destination is not reachable from this datapath.
    pub dropped: bool,
    /// Persistent rule to install; never set when flooding.
    pub flow: Option<FlowRule>,
    /// Mapping generation the decision was made against.
    pub generation: u64,
}

impl PacketDecision {
    /// The one-shot packet-out for this packet.
    ///
    /// `None` when the installed rule already releases the buffered packet.
    pub fn packet_out(
        &self,
        in_port: PortNo,
        frame: &[u8],
        buffer_id: Option<BufferId>,
    ) -> Option<PacketOut> {
        if self.flow.as_ref().is_some_and(|rule| rule.buffer_id.is_some()) {
            return None;
        }
        Some(self.one_shot(in_port, frame, buffer_id))
    }

    /// Packet-out carrying the decided actions, regardless of any rule.
    pub fn one_shot(&self, in_port: PortNo, frame: &[u8], buffer_id: Option<BufferId>) -> PacketOut {
        let payload = match buffer_id {
            Some(id) => PacketPayload::Buffered(id),
            None => PacketPayload::Data(frame.to_vec()),
        };
        PacketOut {
            in_port,
            actions: self.actions.clone(),
            payload,
        }
    }
}

/// Decides rewrites, drops and forwarding for packet-ins.
pub struct RewriteEngine {
    store: Arc<MappingStore>,
    topology: Arc<TopologyTracker>,
    flow_hard_timeout: Option<u16>,
}

impl RewriteEngine {
    pub fn new(
        store: Arc<MappingStore>,
        topology: Arc<TopologyTracker>,
        flow_hard_timeout: Option<u16>,
    ) -> Self {
        RewriteEngine {
            store,
            topology,
            flow_hard_timeout,
        }
    }

    pub fn decide(
        &self,
        datapath: DatapathId,
        in_port: PortNo,
        packet: &InboundPacket,
        buffer_id: Option<BufferId>,
    ) -> PacketDecision {
        let mut actions = Vec::new();
        let mapping = self.store.view();
        let generation = mapping.generation();

        let (flow_match, dropped) = match packet.kind {
            PacketKind::Arp { src, dst } => (
                AddressFields::Arp.flow_match(in_port, src, dst),
                self.translate(&mapping, datapath, AddressFields::Arp, src, dst, &mut actions),
            ),
            PacketKind::Ipv4 { src, dst, .. } => (
                AddressFields::Ipv4.flow_match(in_port, src, dst),
                self.translate(&mapping, datapath, AddressFields::Ipv4, src, dst, &mut actions),
            ),
            // No network-layer address: nothing to rewrite and nothing to
            // check locality against.
            PacketKind::Other => (
                FlowMatch {
                    in_port: Some(in_port),
                    eth_type: Some(packet.ethertype),
                    eth_dst: Some(packet.eth_dst),
                    ..FlowMatch::default()
                },
                false,
            ),
        };
        drop(mapping);

        self.topology.update_port(datapath, packet.eth_src, in_port);
        let egress = self
            .topology
            .lookup_port(datapath, packet.eth_dst)
            .map_or(OutputPort::Flood, OutputPort::Port);

        if !dropped {
            actions.push(Action::Output(egress));
        }

        let flow = (egress != OutputPort::Flood).then(|| FlowRule {
            flow_match,
            actions: actions.clone(),
            priority: FLOW_PRIORITY,
            buffer_id,
            hard_timeout: self.flow_hard_timeout,
        });

        debug!(
            datapath = %datapath,
            generation,
            in_port,
            kind = ?packet.kind,
            egress = %egress,
            dropped,
            rewrites = actions.iter().filter(|a| a.output().is_none()).count(),
            "Packet decision"
        );

        PacketDecision {
            actions,
            egress,
            dropped,
            flow,
            generation,
        }
    }

    /// Generation of the mapping currently in force.
    pub fn generation(&self) -> u64 {
        self.store.view().generation()
    }

    /// Push address rewrites for one packet. Returns true if the packet must
    /// be dropped for locality.
    fn translate(
        &self,
        mapping: &AddressState,
        datapath: DatapathId,
        fields: AddressFields,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        actions: &mut Vec<Action>,
    ) -> bool {
        if let Some(virtual_ip) = mapping.lookup_virtual(RealIp(src)) {
            self.topology.record_location(src, datapath);
            actions.push(fields.set_src(virtual_ip.0));
        }

        let reachable = match mapping.lookup_real(VirtualIp(dst)) {
            Some(real) => {
                let reachable = self.topology.is_reachable(datapath, real.0);
                if reachable {
                    actions.push(fields.set_dst(real.0));
                }
                reachable
            }
            None => self.topology.is_reachable(datapath, dst),
        };

        if !reachable {
            debug!(datapath = %datapath, src = %src, dst = %dst, "Destination not local, dropping");
        }
        !reachable
    }
}
