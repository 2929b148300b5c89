//! Controller configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!     "real_hosts": ["10.0.0.1", "10.0.0.2"],
//!     "virtual_pool": { "first": "10.0.0.10", "last": "10.0.0.21" },
//!     "rotation_interval": { "min_secs": 10, "max_secs": 30 },
//!     "retirement_limit": 3
//! }
//! ```

use crate::store::{AddressState, RealIp};
use ipnet::{Ipv4AddrRange, Ipv4Net};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Largest virtual pool accepted; each rotation walks the whole range.
pub const MAX_POOL_SIZE: u64 = 1 << 16;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Read(String, #[source] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("At least one real host is required")]
    NoHosts,

    #[error("Real host {0} listed more than once")]
    DuplicateHost(Ipv4Addr),

    #[error("Virtual pool is empty: {0}")]
    EmptyPool(String),

    #[error("Virtual pool has {0} addresses, at most {MAX_POOL_SIZE} allowed")]
    PoolTooLarge(u64),

    #[error("Invalid rotation interval: {0}")]
    InvalidInterval(String),

    #[error("Retirement limit must be at least 1")]
    ZeroRetirementLimit,

    #[error("Event queue depth must be at least 1")]
    ZeroQueueDepth,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Virtual address range, given either as explicit bounds or as a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum VirtualPool {
    /// Inclusive bounds.
    Range { first: Ipv4Addr, last: Ipv4Addr },
    /// Usable host addresses of the prefix.
    Cidr { cidr: Ipv4Net },
}

impl VirtualPool {
    pub fn range(&self) -> Ipv4AddrRange {
        match self {
            VirtualPool::Range { first, last } => Ipv4AddrRange::new(*first, *last),
            VirtualPool::Cidr { cidr } => cidr.hosts(),
        }
    }

    /// Number of addresses in the pool.
    pub fn size(&self) -> u64 {
        match self {
            VirtualPool::Range { first, last } => {
                let (first, last) = (u32::from(*first) as u64, u32::from(*last) as u64);
                if last < first { 0 } else { last - first + 1 }
            }
            VirtualPool::Cidr { cidr } => {
                let total = 1u64 << (32 - cidr.prefix_len());
                if cidr.prefix_len() >= 31 { total } else { total - 2 }
            }
        }
    }
}

/// Bounds for the random pause between rotations, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationInterval {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl Default for RotationInterval {
    fn default() -> Self {
        RotationInterval {
            min_secs: 10.0,
            max_secs: 30.0,
        }
    }
}

impl RotationInterval {
    pub fn bounds(&self) -> Result<(Duration, Duration)> {
        let to_duration = |secs: f64| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| ConfigError::InvalidInterval(format!("{}: {}", secs, e)))
        };
        let (min, max) = (to_duration(self.min_secs)?, to_duration(self.max_secs)?);
        if min > max {
            return Err(ConfigError::InvalidInterval(format!(
                "min {}s exceeds max {}s",
                self.min_secs, self.max_secs
            )));
        }
        if max.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "max must be greater than zero".to_string(),
            ));
        }
        Ok((min, max))
    }
}

fn default_retirement_limit() -> u32 {
    3
}

fn default_event_queue_depth() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MtdConfig {
    /// Protected hosts.
    pub real_hosts: Vec<Ipv4Addr>,
    pub virtual_pool: VirtualPool,
    #[serde(default)]
    pub rotation_interval: RotationInterval,
    /// Rotations before retired virtual addresses may be reused.
    #[serde(default = "default_retirement_limit")]
    pub retirement_limit: u32,
    /// Hard timeout for learned flow rules; none means rules live until the
    /// next rotation flushes them.
    #[serde(default)]
    pub flow_hard_timeout_secs: Option<u16>,
    /// Capacity of the controller and per-datapath event queues.
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

impl MtdConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: MtdConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Whether the pool is large enough for the host
    /// count is only known at rotation time.
    pub fn validate(&self) -> Result<()> {
        if self.real_hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        let mut seen = HashSet::new();
        for host in &self.real_hosts {
            if !seen.insert(host) {
                return Err(ConfigError::DuplicateHost(*host));
            }
        }

        match self.virtual_pool.size() {
            0 => return Err(ConfigError::EmptyPool(format!("{:?}", self.virtual_pool))),
            n if n > MAX_POOL_SIZE => return Err(ConfigError::PoolTooLarge(n)),
            _ => {}
        }

        self.rotation_interval.bounds()?;

        if self.retirement_limit == 0 {
            return Err(ConfigError::ZeroRetirementLimit);
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        Ok(())
    }

    /// Fresh address state for the configured hosts and pool.
    pub fn address_state(&self) -> AddressState {
        AddressState::new(
            self.real_hosts.iter().copied().map(RealIp),
            self.virtual_pool.range(),
            self.retirement_limit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"{
        "real_hosts": ["10.10.10.1", "10.10.10.2"],
        "virtual_pool": { "first": "10.10.10.10", "last": "10.10.10.21" }
    }"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = MtdConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.real_hosts.len(), 2);
        assert_eq!(config.virtual_pool.size(), 12);
        assert_eq!(config.retirement_limit, 3);
        assert_eq!(config.flow_hard_timeout_secs, None);
        assert_eq!(config.event_queue_depth, 1024);
        assert_eq!(
            config.rotation_interval.bounds().unwrap(),
            (Duration::from_secs(10), Duration::from_secs(30))
        );
    }

    #[test]
    fn test_cidr_pool() {
        let config = MtdConfig::from_json(
            r#"{
                "real_hosts": ["10.0.0.1"],
                "virtual_pool": { "cidr": "10.0.1.0/28" },
                "rotation_interval": { "min_secs": 0.5, "max_secs": 2 },
                "retirement_limit": 2,
                "flow_hard_timeout_secs": 60
            }"#,
        )
        .unwrap();
        assert_eq!(config.virtual_pool.size(), 14);
        assert_eq!(config.virtual_pool.range().count(), 14);
        assert_eq!(config.flow_hard_timeout_secs, Some(60));
        assert_eq!(
            config.rotation_interval.bounds().unwrap(),
            (Duration::from_millis(500), Duration::from_secs(2))
        );
    }

    #[test]
    fn test_rejects_bad_configs() {
        let cases = [
            (
                r#"{"real_hosts": [], "virtual_pool": {"first": "10.0.0.10", "last": "10.0.0.20"}}"#,
                "At least one real host",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1", "10.0.0.1"], "virtual_pool": {"first": "10.0.0.10", "last": "10.0.0.20"}}"#,
                "listed more than once",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"first": "10.0.0.20", "last": "10.0.0.10"}}"#,
                "Virtual pool is empty",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"cidr": "10.0.0.0/8"}}"#,
                "at most 65536 allowed",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"cidr": "10.0.0.0/24"}, "rotation_interval": {"min_secs": 30, "max_secs": 10}}"#,
                "exceeds max",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"cidr": "10.0.0.0/24"}, "rotation_interval": {"min_secs": -1, "max_secs": 10}}"#,
                "Invalid rotation interval",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"cidr": "10.0.0.0/24"}, "retirement_limit": 0}"#,
                "Retirement limit",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"cidr": "10.0.0.0/24"}, "event_queue_depth": 0}"#,
                "Event queue depth",
            ),
            (
                r#"{"real_hosts": ["10.0.0.1"], "virtual_pool": {"cidr": "10.0.0.0/24"}, "swap_limit": 3}"#,
                "Invalid config",
            ),
        ];

        for (raw, expected) in cases {
            let err = MtdConfig::from_json(raw).unwrap_err().to_string();
            assert!(err.contains(expected), "{raw}: got '{err}'");
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = MtdConfig::load(file.path()).unwrap();
        let state = config.address_state();
        assert_eq!(state.tracked_hosts().count(), 2);
        assert_eq!(state.pool().len(), 12);

        let missing = MtdConfig::load(Path::new("/nonexistent/mtd.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read(..)));
    }
}
