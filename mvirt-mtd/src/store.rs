//! Address mapping store: real ↔ virtual assignments, the virtual address
//! pool and rotation bookkeeping.
//!
//! All state lives in [`AddressState`]. [`MappingStore`] guards it with a
//! single `RwLock`: a rotation holds the write lock for its whole computation
//! and packet classification holds one read guard per packet (see
//! [`MappingStore::view`]), so a packet is never classified against a
//! half-rotated mapping.

use ipnet::Ipv4AddrRange;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;
use tracing::{debug, info};

/// Real address of a protected host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RealIp(pub Ipv4Addr);

/// Externally visible stand-in address, drawn from the virtual pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VirtualIp(pub Ipv4Addr);

impl fmt::Display for RealIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VirtualIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Ipv4Addr> for RealIp {
    fn from(addr: Ipv4Addr) -> Self {
        RealIp(addr)
    }
}

impl From<Ipv4Addr> for VirtualIp {
    fn from(addr: Ipv4Addr) -> Self {
        VirtualIp(addr)
    }
}

/// Rotation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RotationError {
    #[error("virtual pool exhausted: {needed} hosts need an address, {available} available")]
    PoolExhausted { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, RotationError>;

/// One row of a mapping, as reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MappingEntry {
    pub real: RealIp,
    #[serde(rename = "virtual")]
    pub virtual_ip: VirtualIp,
}

/// Bidirectional real ↔ virtual association.
///
/// Built only through [`AddressMapping::from_pairs`], which keeps both
/// directions in sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMapping {
    real_to_virtual: HashMap<RealIp, VirtualIp>,
    virtual_to_real: HashMap<VirtualIp, RealIp>,
}

impl AddressMapping {
    fn from_pairs(pairs: impl IntoIterator<Item = (RealIp, VirtualIp)>) -> Self {
        let mut mapping = AddressMapping::default();
        for (real, virtual_ip) in pairs {
            mapping.real_to_virtual.insert(real, virtual_ip);
            mapping.virtual_to_real.insert(virtual_ip, real);
        }
        mapping
    }

    pub fn virtual_of(&self, real: RealIp) -> Option<VirtualIp> {
        self.real_to_virtual.get(&real).copied()
    }

    pub fn real_of(&self, virtual_ip: VirtualIp) -> Option<RealIp> {
        self.virtual_to_real.get(&virtual_ip).copied()
    }

    pub fn len(&self) -> usize {
        self.real_to_virtual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.real_to_virtual.is_empty()
    }

    /// Virtual addresses currently assigned.
    pub fn assigned(&self) -> impl Iterator<Item = VirtualIp> + '_ {
        self.virtual_to_real.keys().copied()
    }

    /// Entries sorted by real address.
    pub fn entries(&self) -> Vec<MappingEntry> {
        let mut entries: Vec<_> = self
            .real_to_virtual
            .iter()
            .map(|(&real, &virtual_ip)| MappingEntry { real, virtual_ip })
            .collect();
        entries.sort_by_key(|e| e.real);
        entries
    }
}

/// Retired set plus the number of rotations since it was last cleared.
#[derive(Debug, Clone, Default)]
struct Retirement {
    retired: BTreeSet<VirtualIp>,
    rotation_counter: u32,
}

impl Retirement {
    fn reclaim_if_due(&mut self, limit: u32) -> bool {
        if self.rotation_counter < limit {
            return false;
        }
        self.retired.clear();
        self.rotation_counter = 0;
        true
    }
}

/// Mapping, pool and rotation bookkeeping for one controller.
#[derive(Debug)]
pub struct AddressState {
    range: Ipv4AddrRange,
    hosts: BTreeSet<RealIp>,
    mapping: AddressMapping,
    retirement: Retirement,
    retirement_limit: u32,
    generation: u64,
}

impl AddressState {
    /// Create state for the given hosts and virtual range. No host has a
    /// virtual address until the first [`rotate`](Self::rotate).
    pub fn new(
        hosts: impl IntoIterator<Item = RealIp>,
        range: Ipv4AddrRange,
        retirement_limit: u32,
    ) -> Self {
        AddressState {
            range,
            hosts: hosts.into_iter().collect(),
            mapping: AddressMapping::default(),
            retirement: Retirement::default(),
            retirement_limit,
            generation: 0,
        }
    }

    /// Reassign a fresh virtual address to every tracked host.
    ///
    /// The rotation is computed on staged bookkeeping and committed only when
    /// every host got an address. A failed attempt still counts towards the
    /// retirement limit so the next due reclaim can refill the pool; the
    /// mapping, retired set and generation stay untouched.
    pub fn rotate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<AddressMapping> {
        let mut retirement = self.retirement.clone();
        let reclaimed = retirement.reclaim_if_due(self.retirement_limit);
        retirement.rotation_counter += 1;

        // Tracked real addresses are never handed out, which also rules out
        // a host being mapped onto its own literal address.
        let mut candidates: Vec<VirtualIp> = self
            .range
            .map(VirtualIp)
            .filter(|v| {
                self.mapping.real_of(*v).is_none()
                    && !retirement.retired.contains(v)
                    && !self.hosts.contains(&RealIp(v.0))
            })
            .collect();

        if candidates.len() < self.hosts.len() {
            self.retirement.rotation_counter = self.retirement.rotation_counter.saturating_add(1);
            return Err(RotationError::PoolExhausted {
                needed: self.hosts.len(),
                available: candidates.len(),
            });
        }

        let mut pairs = Vec::with_capacity(self.hosts.len());
        for &real in &self.hosts {
            let idx = rng.gen_range(0..candidates.len());
            let virtual_ip = candidates.swap_remove(idx);
            pairs.push((real, virtual_ip));
        }

        retirement.retired.extend(self.mapping.assigned());
        self.mapping = AddressMapping::from_pairs(pairs);
        self.retirement = retirement;
        self.generation += 1;

        debug!(
            generation = self.generation,
            reclaimed,
            retired = self.retirement.retired.len(),
            counter = self.retirement.rotation_counter,
            "Rotation committed"
        );
        Ok(self.mapping.clone())
    }

    /// Return retired addresses to the pool once the retirement limit is hit.
    pub fn reclaim_if_due(&mut self) -> bool {
        self.retirement.reclaim_if_due(self.retirement_limit)
    }

    /// Start tracking a host. It gets a virtual address at the next rotation.
    pub fn track_host(&mut self, real: RealIp) -> bool {
        self.hosts.insert(real)
    }

    pub fn lookup_virtual(&self, real: RealIp) -> Option<VirtualIp> {
        self.mapping.virtual_of(real)
    }

    pub fn lookup_real(&self, virtual_ip: VirtualIp) -> Option<RealIp> {
        self.mapping.real_of(virtual_ip)
    }

    pub fn is_real(&self, addr: Ipv4Addr) -> bool {
        self.mapping.virtual_of(RealIp(addr)).is_some()
    }

    pub fn is_virtual(&self, addr: Ipv4Addr) -> bool {
        self.mapping.real_of(VirtualIp(addr)).is_some()
    }

    pub fn mapping(&self) -> &AddressMapping {
        &self.mapping
    }

    pub fn tracked_hosts(&self) -> impl Iterator<Item = RealIp> + '_ {
        self.hosts.iter().copied()
    }

    /// Configured range minus assigned minus retired addresses.
    pub fn pool(&self) -> BTreeSet<VirtualIp> {
        self.range
            .map(VirtualIp)
            .filter(|v| self.mapping.real_of(*v).is_none() && !self.retirement.retired.contains(v))
            .collect()
    }

    pub fn retired(&self) -> &BTreeSet<VirtualIp> {
        &self.retirement.retired
    }

    pub fn rotation_counter(&self) -> u32 {
        self.retirement.rotation_counter
    }

    /// Number of successful rotations since start-up.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Lock-guarded [`AddressState`] shared between the rotation task and the
/// packet handlers.
pub struct MappingStore {
    state: RwLock<AddressState>,
    rng: Mutex<StdRng>,
}

impl MappingStore {
    pub fn new(state: AddressState) -> Self {
        Self::with_rng(state, StdRng::from_entropy())
    }

    /// Use a caller-provided RNG (seeded in tests).
    pub fn with_rng(state: AddressState, rng: StdRng) -> Self {
        MappingStore {
            state: RwLock::new(state),
            rng: Mutex::new(rng),
        }
    }

    pub fn rotate(&self) -> Result<AddressMapping> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let result = state.rotate(&mut *rng);
        if let Ok(mapping) = &result {
            info!(
                generation = state.generation(),
                hosts = mapping.len(),
                "Virtual addresses rotated"
            );
        }
        result
    }

    /// Read guard for a consistent multi-lookup view of the current state.
    ///
    /// Hold it for the whole classification of one packet and never across
    /// device I/O.
    pub fn view(&self) -> RwLockReadGuard<'_, AddressState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup_virtual(&self, real: RealIp) -> Option<VirtualIp> {
        self.view().lookup_virtual(real)
    }

    pub fn lookup_real(&self, virtual_ip: VirtualIp) -> Option<RealIp> {
        self.view().lookup_real(virtual_ip)
    }

    pub fn is_real(&self, addr: Ipv4Addr) -> bool {
        self.view().is_real(addr)
    }

    pub fn is_virtual(&self, addr: Ipv4Addr) -> bool {
        self.view().is_virtual(addr)
    }

    pub fn mapping(&self) -> AddressMapping {
        self.view().mapping().clone()
    }
}
