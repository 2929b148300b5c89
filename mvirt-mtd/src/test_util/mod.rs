//! Test utilities: a recording in-memory datapath and frame builders.

pub mod datapath;
pub mod packets;

pub use datapath::{DatapathCommand, RecordingDatapath};
