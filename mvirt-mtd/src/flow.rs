//! Flow rule model pushed to datapaths.
//!
//! Mirrors the subset of OpenFlow 1.3 the controller needs: a match over
//! ingress port, ethertype and L3 addresses, a list of apply-actions, and
//! one-shot packet-out messages.

use smoltcp::wire::EthernetAddress;
use std::fmt;
use std::net::Ipv4Addr;

/// Switch port number.
pub type PortNo = u32;

/// Buffer id of a packet held by the datapath.
pub type BufferId = u32;

/// Priority of the match-all rule that sends traffic to the controller.
pub const BASELINE_PRIORITY: u16 = 0;

/// Priority of learned per-flow rules.
pub const FLOW_PRIORITY: u16 = 1;

/// Ethertypes used in matches.
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

/// Rule match. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: Option<PortNo>,
    pub eth_type: Option<u16>,
    pub eth_dst: Option<EthernetAddress>,
    pub ipv4_src: Option<Ipv4Addr>,
    pub ipv4_dst: Option<Ipv4Addr>,
    pub arp_spa: Option<Ipv4Addr>,
    pub arp_tpa: Option<Ipv4Addr>,
}

impl FlowMatch {
    /// Match everything.
    pub fn any() -> Self {
        FlowMatch::default()
    }

    pub fn is_any(&self) -> bool {
        *self == FlowMatch::default()
    }
}

/// Where an output action sends a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputPort {
    Port(PortNo),
    Flood,
    Controller,
}

impl fmt::Display for OutputPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPort::Port(port) => write!(f, "port:{}", port),
            OutputPort::Flood => f.write_str("flood"),
            OutputPort::Controller => f.write_str("controller"),
        }
    }
}

/// Apply-action. A list without [`Action::Output`] drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SetArpSpa(Ipv4Addr),
    SetArpTpa(Ipv4Addr),
    SetIpv4Src(Ipv4Addr),
    SetIpv4Dst(Ipv4Addr),
    Output(OutputPort),
}

impl Action {
    pub fn output(&self) -> Option<OutputPort> {
        match self {
            Action::Output(port) => Some(*port),
            _ => None,
        }
    }
}

/// A persistent rule for `install_rule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRule {
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
    pub priority: u16,
    /// Buffered packet to release through this rule once installed.
    pub buffer_id: Option<BufferId>,
    /// Seconds until the device removes the rule regardless of activity.
    pub hard_timeout: Option<u16>,
}

impl FlowRule {
    /// Match-all rule forwarding unmatched traffic to the controller,
    /// unbuffered so the controller always sees the full frame.
    pub fn baseline() -> Self {
        FlowRule {
            flow_match: FlowMatch::any(),
            actions: vec![Action::Output(OutputPort::Controller)],
            priority: BASELINE_PRIORITY,
            buffer_id: None,
            hard_timeout: None,
        }
    }

    pub fn is_baseline(&self) -> bool {
        *self == FlowRule::baseline()
    }
}

/// Packet-out payload: either a datapath buffer or the raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketPayload {
    Buffered(BufferId),
    Data(Vec<u8>),
}

/// One-shot packet emission, independent of installed rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub in_port: PortNo,
    pub actions: Vec<Action>,
    pub payload: PacketPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_rule() {
        let rule = FlowRule::baseline();
        assert!(rule.flow_match.is_any());
        assert_eq!(rule.priority, BASELINE_PRIORITY);
        assert_eq!(rule.actions, vec![Action::Output(OutputPort::Controller)]);
        assert!(rule.is_baseline());
    }

    #[test]
    fn test_action_output() {
        assert_eq!(
            Action::Output(OutputPort::Port(3)).output(),
            Some(OutputPort::Port(3))
        );
        assert_eq!(Action::SetIpv4Src(Ipv4Addr::LOCALHOST).output(), None);
        assert_eq!(OutputPort::Flood.to_string(), "flood");
        assert_eq!(OutputPort::Port(7).to_string(), "port:7");
    }
}
