//! Controller event loop.
//!
//! Three entry points drive the controller:
//! - datapath connects and packet-ins arrive on the event channel and are
//!   handled by a dispatcher that owns one shard task per datapath,
//! - rotation ticks arrive on the tick channel and are handled by a single
//!   rotation task.
//!
//! Packet handling for one datapath is sequential; different datapaths run
//! in parallel. The store lock is never held across device I/O. Learned
//! rules carry the mapping generation they were decided against, and the
//! synchronizer drops those that a rotation flush has already overtaken.

use crate::config::MtdConfig;
use crate::datapath::{Datapath, DatapathId};
use crate::flow::{BufferId, PortNo};
use crate::packet::classify;
use crate::rewrite::RewriteEngine;
use crate::scheduler::RotationTick;
use crate::store::MappingStore;
use crate::sync::{DeviceRegistry, FlowInstall, FlowSynchronizer};
use crate::telemetry::{RotationNotice, notice_channel};
use crate::topology::TopologyTracker;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// A packet the datapath could not match and handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub datapath: DatapathId,
    pub in_port: PortNo,
    pub frame: Vec<u8>,
    /// Set when the datapath kept the packet in its own buffer.
    pub buffer_id: Option<BufferId>,
}

pub enum ControllerEvent {
    DeviceConnected(Arc<dyn Datapath>),
    PacketIn(PacketIn),
}

enum ShardEvent {
    Connected(Arc<dyn Datapath>),
    Packet(PacketIn),
}

pub struct Controller {
    store: Arc<MappingStore>,
    topology: Arc<TopologyTracker>,
    sync: Arc<FlowSynchronizer>,
    flow_hard_timeout: Option<u16>,
    queue_depth: usize,
}

impl Controller {
    pub fn new(config: &MtdConfig) -> Self {
        Self::with_store(
            Arc::new(MappingStore::new(config.address_state())),
            config.flow_hard_timeout_secs,
            config.event_queue_depth,
        )
    }

    pub fn with_store(
        store: Arc<MappingStore>,
        flow_hard_timeout: Option<u16>,
        queue_depth: usize,
    ) -> Self {
        Controller {
            store,
            topology: Arc::new(TopologyTracker::new()),
            sync: Arc::new(FlowSynchronizer::new(Arc::new(DeviceRegistry::new()))),
            flow_hard_timeout,
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn topology(&self) -> &Arc<TopologyTracker> {
        &self.topology
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.sync.registry()
    }

    /// Start the dispatcher and rotation tasks.
    pub fn spawn(self) -> ControllerHandle {
        let (events_tx, events_rx) = mpsc::channel(self.queue_depth);
        let (ticks_tx, ticks_rx) = mpsc::channel(1);
        let notices = notice_channel();

        let engine = Arc::new(RewriteEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.topology),
            self.flow_hard_timeout,
        ));

        let dispatcher = Dispatcher {
            engine,
            sync: Arc::clone(&self.sync),
            queue_depth: self.queue_depth,
            shards: HashMap::new(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(events_rx));
        let rotation = tokio::spawn(run_rotations(
            Arc::clone(&self.store),
            Arc::clone(&self.sync),
            notices.clone(),
            ticks_rx,
        ));

        info!("Controller started");
        ControllerHandle {
            events: events_tx,
            ticks: ticks_tx,
            notices,
            tasks: vec![dispatcher, rotation],
        }
    }
}

/// Handle to a running controller.
pub struct ControllerHandle {
    events: mpsc::Sender<ControllerEvent>,
    ticks: mpsc::Sender<RotationTick>,
    notices: broadcast::Sender<RotationNotice>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Sender for transports that deliver datapath events.
    pub fn events(&self) -> mpsc::Sender<ControllerEvent> {
        self.events.clone()
    }

    /// Sender for the rotation scheduler.
    pub fn rotation_ticks(&self) -> mpsc::Sender<RotationTick> {
        self.ticks.clone()
    }

    pub async fn send(&self, event: ControllerEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    pub async fn connect(&self, datapath: Arc<dyn Datapath>) -> Result<()> {
        self.send(ControllerEvent::DeviceConnected(datapath)).await
    }

    pub async fn packet_in(&self, packet: PacketIn) -> Result<()> {
        self.send(ControllerEvent::PacketIn(packet)).await
    }

    /// Request a rotation outside the schedule.
    pub async fn rotate_now(&self) -> Result<()> {
        self.ticks
            .send(RotationTick { seq: 0 })
            .await
            .map_err(|_| ControllerError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RotationNotice> {
        self.notices.subscribe()
    }

    /// Stop accepting events and wait for the controller tasks to end.
    pub async fn shutdown(self) {
        let ControllerHandle {
            events,
            ticks,
            tasks,
            ..
        } = self;
        drop(events);
        drop(ticks);
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("Controller stopped");
    }
}

struct Dispatcher {
    engine: Arc<RewriteEngine>,
    sync: Arc<FlowSynchronizer>,
    queue_depth: usize,
    shards: HashMap<DatapathId, mpsc::Sender<ShardEvent>>,
}

impl Dispatcher {
    async fn run(mut self, mut events: mpsc::Receiver<ControllerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ControllerEvent::DeviceConnected(datapath) => self.connect(datapath).await,
                ControllerEvent::PacketIn(packet) => self.route(packet),
            }
        }
        debug!("Event channel closed, dispatcher stopping");
    }

    async fn connect(&mut self, datapath: Arc<dyn Datapath>) {
        let id = datapath.id();
        let shard = self
            .shards
            .entry(id)
            .or_insert_with(|| spawn_shard(id, &self.engine, &self.sync, self.queue_depth));

        if shard.send(ShardEvent::Connected(datapath)).await.is_err() {
            warn!(datapath = %id, "Shard gone, dropping connect");
            self.shards.remove(&id);
        }
    }

    fn route(&mut self, packet: PacketIn) {
        let id = packet.datapath;
        let Some(shard) = self.shards.get(&id) else {
            warn!(datapath = %id, "Packet-in from unknown datapath");
            return;
        };

        match shard.try_send(ShardEvent::Packet(packet)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(datapath = %id, "Shard queue full, dropping packet-in");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(datapath = %id, "Shard gone, dropping packet-in");
                self.shards.remove(&id);
            }
        }
    }
}

fn spawn_shard(
    id: DatapathId,
    engine: &Arc<RewriteEngine>,
    sync: &Arc<FlowSynchronizer>,
    queue_depth: usize,
) -> mpsc::Sender<ShardEvent> {
    let (tx, mut rx) = mpsc::channel(queue_depth);
    let engine = Arc::clone(engine);
    let sync = Arc::clone(sync);

    tokio::spawn(async move {
        debug!(datapath = %id, "Shard started");
        while let Some(event) = rx.recv().await {
            match event {
                ShardEvent::Connected(datapath) => {
                    if let Err(e) = sync.on_connect(datapath).await {
                        warn!(datapath = %id, error = %e, "Failed to install baseline rule");
                    }
                }
                ShardEvent::Packet(packet) => handle_packet(&engine, &sync, packet).await,
            }
        }
        debug!(datapath = %id, "Shard stopped");
    });
    tx
}

async fn handle_packet(engine: &RewriteEngine, sync: &FlowSynchronizer, packet_in: PacketIn) {
    let id = packet_in.datapath;
    let Some(packet) = classify(&packet_in.frame) else {
        debug!(datapath = %id, len = packet_in.frame.len(), "Malformed frame ignored");
        return;
    };

    let mut decision = engine.decide(id, packet_in.in_port, &packet, packet_in.buffer_id);

    // A rule installed with the buffer reference releases the buffered
    // packet itself.
    let mut released = false;
    let mut stale = false;
    if let Some(rule) = &decision.flow {
        match sync.install_flow(id, rule, decision.generation).await {
            Ok(FlowInstall::Installed) => released = rule.buffer_id.is_some(),
            Ok(FlowInstall::Stale) => stale = true,
            Err(e) => warn!(datapath = %id, error = %e, "Failed to install flow rule"),
        }
    }
    if released {
        return;
    }
    if stale {
        // The mapping rotated after the decision: forward this one packet
        // with the current addresses and let the next packet-in learn the
        // rule again.
        debug!(
            datapath = %id,
            generation = decision.generation,
            "Mapping rotated during install, rule skipped"
        );
        decision = engine.decide(id, packet_in.in_port, &packet, packet_in.buffer_id);
    }

    let Some(datapath) = sync.registry().get(id) else {
        warn!(datapath = %id, "Datapath not registered, dropping packet-out");
        return;
    };
    let out = decision.one_shot(packet_in.in_port, &packet_in.frame, packet_in.buffer_id);
    if let Err(e) = datapath.send_packet(&out).await {
        warn!(datapath = %id, error = %e, "Failed to send packet-out");
    }
}

async fn run_rotations(
    store: Arc<MappingStore>,
    sync: Arc<FlowSynchronizer>,
    notices: broadcast::Sender<RotationNotice>,
    mut ticks: mpsc::Receiver<RotationTick>,
) {
    while let Some(tick) = ticks.recv().await {
        // The store lock is released when rotate() returns, before any
        // device I/O.
        let notice = match store.rotate() {
            Ok(mapping) => {
                let generation = store.view().generation();
                let report = sync.on_rotation(generation).await;
                RotationNotice::rotated(generation, mapping.entries(), report)
            }
            Err(e) => {
                error!(seq = tick.seq, error = %e, "Rotation failed");
                RotationNotice::failed(e.to_string())
            }
        };
        // No subscribers is fine.
        let _ = notices.send(notice);
    }
    debug!("Tick channel closed, rotation task stopping");
}
