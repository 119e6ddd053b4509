//! Memory registration cache.
//!
//! Pinning memory is expensive, so each module keeps a reference-counted
//! cache of registered ranges. A registration request that falls inside an
//! already registered range reuses it; the device is only asked to unpin when
//! the last reference goes away.
//!
//! Lookups try a small direct-mapped hints table first (indexed by the page
//! number of the start address) and then walk an index ordered by start
//! address. The walk only visits regions starting within the longest live
//! region's length of the request, so disjoint registrations cost a bounded
//! number of probes however many regions are live.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::error::{VerbsError, VerbsResult};
use crate::memory::HostBuffer;
use crate::verbs::{AccessFlags, Verbs};

const PAGE_SHIFT: u32 = 12;

/// Identifies one cached registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RegionId(u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mr{}", self.0)
    }
}

/// A registered range as seen by its users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegionHandle {
    /// Cache entry.
    pub id: RegionId,
    /// Start of the registered range.
    pub addr: u64,
    /// Length of the registered range.
    pub len: usize,
    /// Local key.
    pub lkey: u32,
    /// Remote key.
    pub rkey: u32,
}

impl RegionHandle {
    /// Returns true if `[addr, addr + len)` lies inside the region.
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr && addr + len as u64 <= self.addr + self.len as u64
    }
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Live regions.
    pub regions: usize,
    /// Bytes currently pinned.
    pub pinned_bytes: u64,
    /// Requests answered from the hints table.
    pub hint_hits: u64,
    /// Requests answered from the ordered index.
    pub tree_hits: u64,
    /// Regions examined while walking the ordered index.
    pub tree_probes: u64,
    /// Requests that pinned new memory.
    pub misses: u64,
    /// Device registrations that failed.
    pub failures: u64,
}

struct Entry {
    handle: RegionHandle,
    buf: HostBuffer,
    refs: usize,
}

/// Reference-counted registration cache for one device.
pub struct MemRegistry {
    device: Arc<dyn Verbs>,
    hints: Vec<Option<RegionId>>,
    by_start: BTreeSet<(u64, RegionId)>,
    /// Live region count per length; the last key bounds the ordered walk.
    lens: BTreeMap<usize, usize>,
    entries: HashMap<RegionId, Entry>,
    next_id: u64,
    stats: RegistryStats,
}

impl MemRegistry {
    /// Creates a registry with a hints table of `hints_size` slots
    /// (rounded up to a power of two).
    pub fn new(device: Arc<dyn Verbs>, hints_size: usize) -> Self {
        Self {
            device,
            hints: vec![None; hints_size.max(1).next_power_of_two()],
            by_start: BTreeSet::new(),
            lens: BTreeMap::new(),
            entries: HashMap::new(),
            next_id: 1,
            stats: RegistryStats::default(),
        }
    }

    fn hint_slot(&self, addr: u64) -> usize {
        ((addr >> PAGE_SHIFT) as usize) & (self.hints.len() - 1)
    }

    fn find(&mut self, buf: &HostBuffer, addr: u64, len: usize) -> Option<RegionId> {
        let slot = self.hint_slot(addr);
        if let Some(id) = self.hints[slot] {
            if let Some(e) = self.entries.get(&id) {
                if e.handle.covers(addr, len) && e.buf.same_memory(buf) {
                    self.stats.hint_hits += 1;
                    return Some(id);
                }
            }
        }
        let mut probes = 0;
        let found = self
            .candidates(addr, len)
            .find(|e| {
                probes += 1;
                e.handle.covers(addr, len) && e.buf.same_memory(buf)
            })
            .map(|e| e.handle.id);
        self.stats.tree_probes += probes;
        let found = found?;
        self.stats.tree_hits += 1;
        self.hints[slot] = Some(found);
        Some(found)
    }

    /// Entries that may cover `[addr, addr + len)`, nearest start first. A
    /// region starting more than the longest live length below the end of
    /// the range cannot reach it.
    fn candidates(&self, addr: u64, len: usize) -> impl Iterator<Item = &Entry> + '_ {
        let longest = self.lens.keys().next_back().copied().unwrap_or(0);
        let window = (len <= longest).then(|| {
            let floor = addr.saturating_add(len as u64).saturating_sub(longest as u64);
            self.by_start
                .range((floor, RegionId(0))..=(addr, RegionId(u64::MAX)))
        });
        window
            .into_iter()
            .flatten()
            .rev()
            .filter_map(move |(_, id)| self.entries.get(id))
    }

    /// Returns a handle covering `buf[offset..offset + len]`, pinning memory
    /// only if no cached region covers the range.
    pub fn register(
        &mut self,
        buf: &HostBuffer,
        offset: usize,
        len: usize,
    ) -> VerbsResult<RegionHandle> {
        let addr = buf.addr_at(offset);
        if let Some(id) = self.find(buf, addr, len) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.refs += 1;
                trace!(region = %id, refs = entry.refs, "registration reused");
                return Ok(entry.handle);
            }
        }

        let keys = match self.device.reg_mr(buf, offset, len, AccessFlags::ALL) {
            Ok(keys) => keys,
            Err(e) => {
                self.stats.failures += 1;
                warn!(device = self.device.device_name(), addr, len, error = %e, "memory registration failed");
                return Err(e);
            }
        };
        let id = RegionId(self.next_id);
        self.next_id += 1;
        let handle = RegionHandle {
            id,
            addr,
            len,
            lkey: keys.lkey,
            rkey: keys.rkey,
        };
        self.entries.insert(
            id,
            Entry {
                handle,
                buf: buf.clone(),
                refs: 1,
            },
        );
        self.by_start.insert((addr, id));
        *self.lens.entry(len).or_insert(0) += 1;
        let slot = self.hint_slot(addr);
        self.hints[slot] = Some(id);
        self.stats.misses += 1;
        self.stats.regions = self.entries.len();
        self.stats.pinned_bytes += len as u64;
        debug!(region = %id, addr, len, lkey = keys.lkey, "memory pinned");
        Ok(handle)
    }

    /// Drops one reference; unpins at zero. Returns true if the region was
    /// unpinned.
    pub fn deregister(&mut self, handle: &RegionHandle) -> VerbsResult<bool> {
        let entry = self
            .entries
            .get_mut(&handle.id)
            .ok_or(VerbsError::InvalidKey(handle.lkey))?;
        entry.refs -= 1;
        if entry.refs > 0 {
            trace!(region = %handle.id, refs = entry.refs, "registration released");
            return Ok(false);
        }
        self.remove(handle.id)?;
        Ok(true)
    }

    fn remove(&mut self, id: RegionId) -> VerbsResult<()> {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(());
        };
        self.by_start.remove(&(entry.handle.addr, id));
        if let Some(count) = self.lens.get_mut(&entry.handle.len) {
            *count -= 1;
            if *count == 0 {
                self.lens.remove(&entry.handle.len);
            }
        }
        for hint in self.hints.iter_mut().filter(|h| **h == Some(id)) {
            *hint = None;
        }
        self.stats.regions = self.entries.len();
        self.stats.pinned_bytes -= entry.handle.len as u64;
        debug!(region = %id, addr = entry.handle.addr, "memory unpinned");
        self.device.dereg_mr(entry.handle.lkey)
    }

    /// Finds a cached region covering the range without taking a reference.
    pub fn lookup(&self, addr: u64, len: usize) -> Option<RegionHandle> {
        self.candidates(addr, len)
            .find(|e| e.handle.covers(addr, len))
            .map(|e| e.handle)
    }

    /// Current reference count of a region, zero if unknown.
    pub fn refs(&self, id: RegionId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.refs)
    }

    /// Counters.
    pub fn stats(&self) -> RegistryStats {
        self.stats.clone()
    }

    /// Unpins every region regardless of references. Returns how many
    /// regions were still registered.
    pub fn clear(&mut self) -> usize {
        let ids: Vec<RegionId> = self.entries.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.remove(id) {
                warn!(region = %id, error = %e, "unpin at teardown failed");
            }
        }
        count
    }
}

impl fmt::Debug for MemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegistry")
            .field("device", &self.device.device_name())
            .field("hints", &self.hints.len())
            .field("stats", &self.stats)
            .finish()
    }
}
