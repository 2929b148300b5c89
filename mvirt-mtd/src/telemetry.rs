//! Rotation notices for external observers.
//!
//! Notices are broadcast fire-and-forget: nobody acknowledges them, and a
//! receiver that falls behind simply misses the oldest ones.

use crate::store::MappingEntry;
use crate::sync::ResyncReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default number of notices buffered per receiver.
pub const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RotationNotice {
    Rotated {
        generation: u64,
        at: DateTime<Utc>,
        mapping: Vec<MappingEntry>,
        datapaths_synced: usize,
        datapaths_failed: usize,
    },
    Failed {
        at: DateTime<Utc>,
        reason: String,
    },
}

impl RotationNotice {
    pub fn rotated(generation: u64, mapping: Vec<MappingEntry>, report: ResyncReport) -> Self {
        RotationNotice::Rotated {
            generation,
            at: Utc::now(),
            mapping,
            datapaths_synced: report.synced,
            datapaths_failed: report.failed,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        RotationNotice::Failed {
            at: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Broadcast channel for rotation notices.
pub fn notice_channel() -> broadcast::Sender<RotationNotice> {
    let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
    tx
}

/// Log every notice as one JSON line until the sender is dropped.
pub fn log_notices(mut rx: broadcast::Receiver<RotationNotice>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    let json = serde_json::to_string(&notice).unwrap_or_default();
                    match notice {
                        RotationNotice::Rotated { .. } => info!(notice = %json, "Rotation notice"),
                        RotationNotice::Failed { .. } => error!(notice = %json, "Rotation notice"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Rotation notice log lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
