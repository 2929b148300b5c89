//! Forwarding synchronizer: keeps datapath rule tables consistent with the
//! current address mapping.
//!
//! The [`DeviceRegistry`] holds every datapath that ever connected together
//! with its baseline state. The [`FlowSynchronizer`] drives the registry:
//! baseline install on connect, flush-and-reseed on every rotation, and
//! per-flow installs requested by the rewrite engine.
//!
//! Rule changes on one datapath are serialized through a per-datapath table
//! lock that also remembers the mapping generation the table was last
//! flushed for. A flow decided against an older generation is refused, and
//! a flow installed just before a flush is removed by that flush.

use crate::datapath::{Datapath, DatapathError, DatapathId, Result};
use crate::flow::FlowRule;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Rule-table state of a datapath as far as the controller knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Connected, baseline rule not (yet) confirmed.
    Uninitialized,
    /// Baseline rule installed; learned flows may come and go on top.
    BaselineInstalled,
}

/// Outcome of a flow install request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowInstall {
    Installed,
    /// The datapath was already flushed for a newer mapping; nothing was
    /// sent.
    Stale,
}

struct DeviceEntry {
    datapath: Arc<dyn Datapath>,
    state: DeviceState,
    /// Generation of the last flush.
    table: Arc<Mutex<u64>>,
}

struct DeviceHandle {
    datapath: Arc<dyn Datapath>,
    table: Arc<Mutex<u64>>,
}

impl DeviceEntry {
    fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            datapath: Arc::clone(&self.datapath),
            table: Arc::clone(&self.table),
        }
    }
}

/// Registry of connected datapaths.
///
/// Entries are never removed; disconnect handling is left to the transport.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DatapathId, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a datapath. A reconnect with the same id replaces the handle
    /// and resets its state.
    pub fn register(&self, datapath: Arc<dyn Datapath>) {
        let id = datapath.id();
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                DeviceEntry {
                    datapath,
                    state: DeviceState::Uninitialized,
                    table: Arc::new(Mutex::new(0)),
                },
            );
    }

    pub fn get(&self, id: DatapathId) -> Option<Arc<dyn Datapath>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| Arc::clone(&entry.datapath))
    }

    pub fn state(&self, id: DatapathId) -> Option<DeviceState> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.state)
    }

    fn set_state(&self, id: DatapathId, state: DeviceState) {
        if let Some(entry) = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            entry.state = state;
        }
    }

    fn handle(&self, id: DatapathId) -> Option<DeviceHandle> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(DeviceEntry::handle)
    }

    /// Handles of all registered datapaths at this instant.
    fn snapshot(&self) -> Vec<DeviceHandle> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(DeviceEntry::handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of resynchronizing all datapaths after a rotation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReport {
    pub synced: usize,
    pub failed: usize,
}

/// Pushes rule changes to datapaths.
pub struct FlowSynchronizer {
    registry: Arc<DeviceRegistry>,
}

impl FlowSynchronizer {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        FlowSynchronizer { registry }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Register a newly connected datapath and install its baseline rule.
    pub async fn on_connect(&self, datapath: Arc<dyn Datapath>) -> Result<()> {
        let id = datapath.id();
        self.registry.register(Arc::clone(&datapath));
        datapath.install_rule(&FlowRule::baseline()).await?;
        self.registry.set_state(id, DeviceState::BaselineInstalled);
        info!(datapath = %id, "Datapath connected, baseline rule installed");
        Ok(())
    }

    /// Flush every datapath and reinstall only the baseline rule, after the
    /// mapping moved to `generation`.
    ///
    /// Works on the device set as of the call; datapaths connecting in the
    /// meantime get their baseline from [`on_connect`](Self::on_connect).
    /// One failing datapath does not stop the others.
    pub async fn on_rotation(&self, generation: u64) -> ResyncReport {
        let mut report = ResyncReport::default();
        for device in self.registry.snapshot() {
            let id = device.datapath.id();
            let mut table = device.table.lock().await;
            // Even a failed flush must refuse flows decided before it.
            *table = (*table).max(generation);
            match Self::reseed(device.datapath.as_ref()).await {
                Ok(()) => {
                    self.registry.set_state(id, DeviceState::BaselineInstalled);
                    report.synced += 1;
                }
                Err(e) => {
                    self.registry.set_state(id, DeviceState::Uninitialized);
                    warn!(datapath = %id, error = %e, "Failed to resync datapath");
                    report.failed += 1;
                }
            }
        }
        debug!(synced = report.synced, failed = report.failed, "Datapaths resynced");
        report
    }

    async fn reseed(datapath: &dyn Datapath) -> Result<()> {
        datapath.clear_rules().await?;
        datapath.install_rule(&FlowRule::baseline()).await
    }

    /// Install (or replace) a rule decided against mapping `generation`.
    ///
    /// Refused with [`FlowInstall::Stale`] when the datapath was already
    /// flushed for a newer generation.
    pub async fn install_flow(
        &self,
        id: DatapathId,
        rule: &FlowRule,
        generation: u64,
    ) -> Result<FlowInstall> {
        let device = self
            .registry
            .handle(id)
            .ok_or(DatapathError::UnknownDatapath(id))?;
        let table = device.table.lock().await;
        if *table > generation {
            debug!(datapath = %id, generation, flushed = *table, "Stale flow rule refused");
            return Ok(FlowInstall::Stale);
        }
        device.datapath.install_rule(rule).await?;
        Ok(FlowInstall::Installed)
    }
}
