//! mvirt-mtd: moving-target-defense controller.
//!
//! Periodically re-randomizes the externally visible (virtual) IPv4 address
//! of every protected host and rewrites ARP and IPv4 traffic on the
//! connected datapaths so that hosts keep talking to each other by their
//! real addresses while outsiders only ever see virtual ones.

pub mod config;
pub mod controller;
pub mod datapath;
pub mod flow;
pub mod packet;
pub mod rewrite;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod test_util;
pub mod topology;
