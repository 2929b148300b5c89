//! In-memory datapath that records every command it receives.
//!
//! Keeps a rule table with replace-on-same-match semantics and applies
//! set-field actions to packet-outs so tests can inspect what a real switch
//! would have emitted.

use crate::datapath::{Datapath, DatapathError, DatapathId, Result};
use crate::flow::{FlowRule, PacketOut, PacketPayload};
use crate::packet::apply_actions;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// A command as received by the datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapathCommand {
    InstallRule(FlowRule),
    ClearRules,
    SendPacket(PacketOut),
}

#[derive(Default)]
struct Recorded {
    commands: Vec<DatapathCommand>,
    rules: Vec<FlowRule>,
}

pub struct RecordingDatapath {
    id: DatapathId,
    recorded: Mutex<Recorded>,
    failing: AtomicBool,
    changed: Notify,
}

impl RecordingDatapath {
    pub fn new(id: DatapathId) -> Arc<Self> {
        Arc::new(RecordingDatapath {
            id,
            recorded: Mutex::new(Recorded::default()),
            failing: AtomicBool::new(false),
            changed: Notify::new(),
        })
    }

    /// Make every subsequent command fail with `Disconnected`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, command: DatapathCommand) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DatapathError::Disconnected(self.id));
        }
        {
            let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
            match &command {
                DatapathCommand::InstallRule(rule) => {
                    recorded.rules.retain(|r| {
                        r.flow_match != rule.flow_match || r.priority != rule.priority
                    });
                    recorded.rules.push(rule.clone());
                }
                DatapathCommand::ClearRules => recorded.rules.clear(),
                DatapathCommand::SendPacket(_) => {}
            }
            recorded.commands.push(command);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn commands(&self) -> Vec<DatapathCommand> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commands
            .clone()
    }

    /// Currently installed rules, in install order.
    pub fn rules(&self) -> Vec<FlowRule> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rules
            .clone()
    }

    pub fn packet_outs(&self) -> Vec<PacketOut> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                DatapathCommand::SendPacket(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Frames emitted by packet-outs that carried data, after set-field
    /// actions were applied. Dropped packets (no output action) are skipped.
    pub fn emitted_frames(&self) -> Vec<Vec<u8>> {
        self.packet_outs()
            .into_iter()
            .filter(|p| p.actions.iter().any(|a| a.output().is_some()))
            .filter_map(|p| match p.payload {
                PacketPayload::Data(data) => Some(apply_actions(&data, &p.actions)),
                PacketPayload::Buffered(_) => None,
            })
            .collect()
    }

    /// Wait until at least `count` commands were recorded.
    pub async fn wait_for_commands(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.commands().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Datapath for RecordingDatapath {
    fn id(&self) -> DatapathId {
        self.id
    }

    async fn install_rule(&self, rule: &FlowRule) -> Result<()> {
        self.record(DatapathCommand::InstallRule(rule.clone()))
    }

    async fn clear_rules(&self) -> Result<()> {
        self.record(DatapathCommand::ClearRules)
    }

    async fn send_packet(&self, packet: &PacketOut) -> Result<()> {
        self.record(DatapathCommand::SendPacket(packet.clone()))
    }
}
