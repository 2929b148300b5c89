//! Controller integration tests
//!
//! Drives the full controller (dispatcher, shards, rotation task) with
//! recording datapaths and checks what each datapath receives.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4AddrRange;
use async_trait::async_trait;
use mvirt_mtd::controller::{Controller, ControllerHandle, PacketIn};
use mvirt_mtd::datapath::{Datapath, DatapathId};
use mvirt_mtd::flow::{Action, FlowRule, OutputPort, PacketOut, PacketPayload};
use mvirt_mtd::scheduler::RotationScheduler;
use mvirt_mtd::store::{AddressState, MappingStore, RealIp};
use mvirt_mtd::telemetry::RotationNotice;
use mvirt_mtd::test_util::packets::{
    create_arp_request, create_ipv4_packet, parse_arp_addrs, parse_ipv4_addrs,
};
use mvirt_mtd::test_util::{DatapathCommand, RecordingDatapath};
use mvirt_mtd::topology::TopologyTracker;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Notify, Semaphore, broadcast};

const DP_A: DatapathId = DatapathId(0xa);
const DP_B: DatapathId = DatapathId(0xb);

const MAC_H1: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];
const MAC_H2: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x02];
const MAC_OUTSIDE: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x99];

const H1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const H2: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const OUTSIDE: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 7);

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    handle: ControllerHandle,
    store: Arc<MappingStore>,
    topology: Arc<TopologyTracker>,
    notices: broadcast::Receiver<RotationNotice>,
}

impl Harness {
    fn start(first: Ipv4Addr, last: Ipv4Addr, retirement_limit: u32) -> Self {
        let state = AddressState::new(
            [RealIp(H1), RealIp(H2)],
            Ipv4AddrRange::new(first, last),
            retirement_limit,
        );
        let store = Arc::new(MappingStore::with_rng(state, StdRng::seed_from_u64(42)));
        let controller = Controller::with_store(Arc::clone(&store), None, 64);
        let topology = Arc::clone(controller.topology());
        let handle = controller.spawn();
        let notices = handle.subscribe();
        Harness {
            handle,
            store,
            topology,
            notices,
        }
    }

    fn default_pool() -> Self {
        Self::start(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 40), 3)
    }

    async fn rotate(&mut self) -> RotationNotice {
        self.handle.rotate_now().await.unwrap();
        self.next_notice().await
    }

    async fn next_notice(&mut self) -> RotationNotice {
        tokio::time::timeout(WAIT, self.notices.recv())
            .await
            .expect("no rotation notice")
            .unwrap()
    }

    async fn connect(&self, id: DatapathId) -> Arc<RecordingDatapath> {
        let dp = RecordingDatapath::new(id);
        self.handle.connect(dp.clone()).await.unwrap();
        settle(&dp, 1).await;
        dp
    }

    /// Deliver a packet-in and wait for the resulting packet-out.
    async fn packet_in(&self, dp: &RecordingDatapath, in_port: u32, frame: Vec<u8>) {
        let before = dp.packet_outs().len();
        self.send_packet_in(dp, in_port, frame, None).await;
        tokio::time::timeout(WAIT, async {
            let mut seen = dp.commands().len();
            while dp.packet_outs().len() <= before {
                seen += 1;
                dp.wait_for_commands(seen).await;
            }
        })
        .await
        .expect("no packet-out");
    }

    async fn send_packet_in(
        &self,
        dp: &RecordingDatapath,
        in_port: u32,
        frame: Vec<u8>,
        buffer_id: Option<u32>,
    ) {
        self.handle
            .packet_in(PacketIn {
                datapath: dp.id(),
                in_port,
                frame,
                buffer_id,
            })
            .await
            .unwrap();
    }

    fn virtual_of(&self, real: Ipv4Addr) -> Ipv4Addr {
        self.store.lookup_virtual(RealIp(real)).unwrap().0
    }
}

async fn settle(dp: &RecordingDatapath, count: usize) {
    tokio::time::timeout(WAIT, dp.wait_for_commands(count))
        .await
        .expect("datapath did not receive expected commands");
}

/// Datapath whose learned-rule installs block until the test lets them
/// through. The baseline rule passes straight away.
struct GatedDatapath {
    inner: Arc<RecordingDatapath>,
    held: Notify,
    gate: Semaphore,
}

impl GatedDatapath {
    fn new(inner: Arc<RecordingDatapath>) -> Arc<Self> {
        Arc::new(GatedDatapath {
            inner,
            held: Notify::new(),
            gate: Semaphore::new(0),
        })
    }
}

#[async_trait]
impl Datapath for GatedDatapath {
    fn id(&self) -> DatapathId {
        self.inner.id()
    }

    async fn install_rule(&self, rule: &FlowRule) -> mvirt_mtd::datapath::Result<()> {
        if *rule != FlowRule::baseline() {
            self.held.notify_one();
            self.gate.acquire().await.unwrap().forget();
        }
        self.inner.install_rule(rule).await
    }

    async fn clear_rules(&self) -> mvirt_mtd::datapath::Result<()> {
        self.inner.clear_rules().await
    }

    async fn send_packet(&self, packet: &PacketOut) -> mvirt_mtd::datapath::Result<()> {
        self.inner.send_packet(packet).await
    }
}

fn last_packet_out_actions(dp: &RecordingDatapath) -> Vec<Action> {
    dp.packet_outs().last().expect("no packet-out").actions.clone()
}

#[tokio::test]
async fn test_connect_installs_baseline() {
    let _ = tracing_subscriber::fmt::try_init();
    let h = Harness::default_pool();

    let dp = h.connect(DP_A).await;
    assert_eq!(
        dp.commands(),
        vec![DatapathCommand::InstallRule(FlowRule::baseline())]
    );
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_rotation_resyncs_every_datapath() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    h.rotate().await;
    let v1_before = h.virtual_of(H1);

    let a = h.connect(DP_A).await;
    let b = h.connect(DP_B).await;

    // Learn H2 on port 2 of A, then install a flow towards it
    h.packet_in(&a, 2, create_arp_request(MAC_H2, H2.octets(), OUTSIDE.octets()))
        .await;
    h.packet_in(&a, 1, create_ipv4_packet(MAC_H1, MAC_H2, H1.octets(), OUTSIDE.octets()))
        .await;
    assert_eq!(a.rules().len(), 2);

    match h.rotate().await {
        RotationNotice::Rotated {
            generation,
            mapping,
            datapaths_synced,
            datapaths_failed,
            ..
        } => {
            assert_eq!(generation, 2);
            assert_eq!(mapping.len(), 2);
            assert_eq!(datapaths_synced, 2);
            assert_eq!(datapaths_failed, 0);
        }
        other => panic!("unexpected notice: {other:?}"),
    }

    for dp in [&a, &b] {
        assert_eq!(dp.rules(), vec![FlowRule::baseline()]);
        let commands = dp.commands();
        assert_eq!(
            &commands[commands.len() - 2..],
            &[
                DatapathCommand::ClearRules,
                DatapathCommand::InstallRule(FlowRule::baseline())
            ]
        );
    }
    // A retired address is never handed out again right away
    assert_ne!(h.virtual_of(H1), v1_before);
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_arp_source_rewritten_and_location_recorded_once() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    h.rotate().await;
    let a = h.connect(DP_A).await;
    let b = h.connect(DP_B).await;

    let arp = create_arp_request(MAC_H1, H1.octets(), OUTSIDE.octets());
    h.packet_in(&a, 1, arp.clone()).await;

    let frames = a.emitted_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(parse_arp_addrs(&frames[0]), Some((h.virtual_of(H1), OUTSIDE)));
    assert_eq!(
        last_packet_out_actions(&a),
        vec![
            Action::SetArpSpa(h.virtual_of(H1)),
            Action::Output(OutputPort::Flood)
        ]
    );
    assert_eq!(h.topology.location_of(H1), Some(DP_A));

    // The same host showing up behind B does not move its location
    h.packet_in(&b, 4, arp).await;
    assert_eq!(h.topology.location_of(H1), Some(DP_A));
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_remote_destination_dropped() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    h.rotate().await;
    let a = h.connect(DP_A).await;
    let b = h.connect(DP_B).await;

    // H2 lives behind B
    h.packet_in(&b, 1, create_arp_request(MAC_H2, H2.octets(), OUTSIDE.octets()))
        .await;
    assert_eq!(h.topology.location_of(H2), Some(DP_B));

    // Virtual destination from A: dropped
    let v2 = h.virtual_of(H2);
    h.packet_in(
        &a,
        1,
        create_ipv4_packet(MAC_OUTSIDE, MAC_H2, OUTSIDE.octets(), v2.octets()),
    )
    .await;
    assert!(last_packet_out_actions(&a).is_empty());

    // Literal destination from A: dropped as well
    h.packet_in(
        &a,
        1,
        create_arp_request(MAC_OUTSIDE, OUTSIDE.octets(), H2.octets()),
    )
    .await;
    assert!(last_packet_out_actions(&a).is_empty());
    assert!(a.emitted_frames().is_empty());

    // Reverse translation on B itself
    h.packet_in(
        &b,
        3,
        create_ipv4_packet(MAC_OUTSIDE, MAC_H2, OUTSIDE.octets(), v2.octets()),
    )
    .await;
    let frames = b.emitted_frames();
    assert_eq!(parse_ipv4_addrs(frames.last().unwrap()), Some((OUTSIDE, H2)));
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_unknown_destination_floods_without_rule() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    h.rotate().await;
    let a = h.connect(DP_A).await;

    h.packet_in(
        &a,
        1,
        create_ipv4_packet(MAC_H1, MAC_OUTSIDE, H1.octets(), OUTSIDE.octets()),
    )
    .await;

    assert_eq!(a.rules(), vec![FlowRule::baseline()]);
    let actions = last_packet_out_actions(&a);
    assert_eq!(actions.last(), Some(&Action::Output(OutputPort::Flood)));
    let frames = a.emitted_frames();
    assert_eq!(
        parse_ipv4_addrs(&frames[0]),
        Some((h.virtual_of(H1), OUTSIDE))
    );
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_learned_flow_releases_buffered_packet() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    h.rotate().await;
    let a = h.connect(DP_A).await;

    // H2 is learned on port 2 and located at A
    h.packet_in(&a, 2, create_arp_request(MAC_H2, H2.octets(), OUTSIDE.octets()))
        .await;
    let (v1, v2) = (h.virtual_of(H1), h.virtual_of(H2));

    let before = a.commands().len();
    h.send_packet_in(
        &a,
        1,
        create_ipv4_packet(MAC_H1, MAC_H2, H1.octets(), v2.octets()),
        Some(7),
    )
    .await;
    settle(&a, before + 1).await;

    let rule = match a.commands().last() {
        Some(DatapathCommand::InstallRule(rule)) => rule.clone(),
        other => panic!("expected rule install, got {other:?}"),
    };
    assert_eq!(rule.buffer_id, Some(7));
    assert_eq!(
        rule.actions,
        vec![
            Action::SetIpv4Src(v1),
            Action::SetIpv4Dst(H2),
            Action::Output(OutputPort::Port(2))
        ]
    );

    // Rule released the buffer: no packet-out follows
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        a.commands().last(),
        Some(DatapathCommand::InstallRule(_))
    ));
    assert!(
        a.packet_outs()
            .iter()
            .all(|p| p.payload != PacketPayload::Buffered(7))
    );
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_pool_exhaustion_keeps_mapping() {
    let _ = tracing_subscriber::fmt::try_init();
    // Three addresses for two hosts: the second rotation cannot avoid the
    // currently assigned ones.
    let mut h = Harness::start(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 12), 5);
    assert!(matches!(h.rotate().await, RotationNotice::Rotated { .. }));
    let before = h.store.mapping();

    match h.rotate().await {
        RotationNotice::Failed { reason, .. } => assert!(reason.contains("exhausted")),
        other => panic!("unexpected notice: {other:?}"),
    }
    assert_eq!(h.store.mapping(), before);
    assert_eq!(h.store.view().generation(), 1);

    // The rotation task keeps running
    assert!(matches!(h.rotate().await, RotationNotice::Failed { .. }));
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_drives_rotations() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    let scheduler = RotationScheduler::with_rng(
        Duration::from_millis(1),
        Duration::from_millis(5),
        StdRng::seed_from_u64(1),
    )
    .spawn(h.handle.rotation_ticks());

    for expected in 1..=3 {
        match h.next_notice().await {
            RotationNotice::Rotated { generation, .. } => assert_eq!(generation, expected),
            other => panic!("unexpected notice: {other:?}"),
        }
    }
    scheduler.abort();
    h.handle.shutdown().await;
}

#[tokio::test]
async fn test_slow_flow_install_cannot_outlive_rotation_flush() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut h = Harness::default_pool();
    h.rotate().await;

    let inner = RecordingDatapath::new(DP_A);
    let gated = GatedDatapath::new(Arc::clone(&inner));
    h.handle.connect(gated.clone()).await.unwrap();
    settle(&inner, 1).await;

    h.packet_in(&inner, 2, create_arp_request(MAC_H2, H2.octets(), OUTSIDE.octets()))
        .await;
    let v1_old = h.virtual_of(H1);

    // The rule for this packet is decided at generation 1 and then stalls
    // inside the datapath
    h.send_packet_in(
        &inner,
        1,
        create_ipv4_packet(MAC_H1, MAC_H2, H1.octets(), OUTSIDE.octets()),
        None,
    )
    .await;
    tokio::time::timeout(WAIT, gated.held.notified())
        .await
        .expect("flow install never reached the datapath");

    // The mapping moves on, but the flush waits for the pending install
    h.handle.rotate_now().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.store.view().generation(), 2);
    assert!(matches!(h.notices.try_recv(), Err(TryRecvError::Empty)));

    gated.gate.add_permits(1);
    match h.next_notice().await {
        RotationNotice::Rotated {
            generation,
            datapaths_synced,
            ..
        } => {
            assert_eq!(generation, 2);
            assert_eq!(datapaths_synced, 1);
        }
        other => panic!("unexpected notice: {other:?}"),
    }

    // The old rule landed before the flush and did not survive it
    assert_eq!(inner.rules(), vec![FlowRule::baseline()]);
    let commands = inner.commands();
    let learned = commands
        .iter()
        .position(|c| matches!(c, DatapathCommand::InstallRule(r) if *r != FlowRule::baseline()))
        .expect("learned rule was never installed");
    let flushed = commands
        .iter()
        .rposition(|c| *c == DatapathCommand::ClearRules)
        .expect("datapath was never flushed");
    assert!(learned < flushed);
    assert!(inner.rules().iter().all(|r| {
        !r.actions.contains(&Action::SetIpv4Src(v1_old))
    }));
    h.handle.shutdown().await;
}
