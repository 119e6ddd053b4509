//! Bounded, growable descriptor pools.
//!
//! A [`FreeList`] owns an arena of descriptors addressed by generation-tagged
//! [`DescriptorId`]s. Every slot is either free (on the free stack) or in use
//! (owned by exactly one operation); the in-use flag and the generation make a
//! second release of the same id, or a release through a stale id, detectable
//! instead of corrupting the pool.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// Sizing of a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeListConfig {
    /// Descriptors constructed up front.
    pub initial: usize,
    /// Descriptors added per growth step.
    pub increment: usize,
    /// Hard upper bound on descriptors.
    pub max: usize,
}

/// Errors returned by [`FreeList::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FreeListError {
    /// The descriptor is already on the free list.
    #[error("double release of descriptor {0}")]
    DoubleRelease(DescriptorId),

    /// The id names a slot that was recycled since it was handed out.
    #[error("stale descriptor handle {0}")]
    StaleHandle(DescriptorId),

    /// The id does not name a slot of this list.
    #[error("descriptor {0} out of range")]
    OutOfRange(DescriptorId),
}

/// Stable handle to a descriptor: slot index plus the slot generation at the
/// time it was allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DescriptorId {
    index: u32,
    generation: u32,
}

impl DescriptorId {
    /// Packs the id into a 64-bit work request cookie.
    pub fn to_wr_id(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Inverse of [`DescriptorId::to_wr_id`].
    pub fn from_wr_id(wr_id: u64) -> Self {
        Self {
            index: wr_id as u32,
            generation: (wr_id >> 32) as u32,
        }
    }

    /// Slot index.
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// Descriptors clear per-use state when they go back to their list.
pub trait Reset {
    /// Drops ownership markers and per-use metadata; keeps reusable
    /// resources such as registered buffers.
    fn reset(&mut self);
}

struct Slot<T> {
    value: T,
    generation: u32,
    in_use: bool,
}

/// Counters for a free list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreeListStats {
    /// Descriptors constructed so far.
    pub capacity: usize,
    /// Descriptors handed out.
    pub in_use: usize,
    /// Descriptors available without growing.
    pub available: usize,
    /// Times the list grew.
    pub grow_events: u64,
    /// Allocations refused at the maximum.
    pub exhausted: u64,
}

/// A bounded pool of reusable descriptors.
pub struct FreeList<T> {
    name: &'static str,
    config: FreeListConfig,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    ctor: Box<dyn Fn() -> T + Send>,
    grow_events: u64,
    exhausted: u64,
}

impl<T: Reset> FreeList<T> {
    /// Creates the list and constructs `config.initial` descriptors.
    pub fn new(
        name: &'static str,
        config: FreeListConfig,
        ctor: impl Fn() -> T + Send + 'static,
    ) -> Self {
        let mut list = Self {
            name,
            config,
            slots: Vec::with_capacity(config.initial),
            free: Vec::with_capacity(config.initial),
            ctor: Box::new(ctor),
            grow_events: 0,
            exhausted: 0,
        };
        list.grow(config.initial.min(config.max));
        list
    }

    fn grow(&mut self, count: usize) -> usize {
        let count = count.min(self.config.max - self.slots.len());
        for _ in 0..count {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                value: (self.ctor)(),
                generation: 0,
                in_use: false,
            });
            self.free.push(index);
        }
        count
    }

    /// Hands out a free descriptor, growing the list if allowed.
    /// `None` means the list is at its maximum and empty.
    pub fn allocate(&mut self) -> Option<DescriptorId> {
        if self.free.is_empty() {
            let step = self.config.increment.max(1);
            if self.grow(step) == 0 {
                self.exhausted += 1;
                trace!(list = self.name, max = self.config.max, "free list exhausted");
                return None;
            }
            self.grow_events += 1;
            debug!(list = self.name, capacity = self.slots.len(), "free list grew");
        }
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.in_use = true;
        Some(DescriptorId {
            index,
            generation: slot.generation,
        })
    }

    /// Resets the descriptor and returns it to the list.
    pub fn release(&mut self, id: DescriptorId) -> Result<(), FreeListError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .ok_or(FreeListError::OutOfRange(id))?;
        if slot.generation != id.generation {
            return Err(FreeListError::StaleHandle(id));
        }
        if !slot.in_use {
            return Err(FreeListError::DoubleRelease(id));
        }
        slot.value.reset();
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(())
    }
}

impl<T> FreeList<T> {
    /// The descriptor behind a live id.
    pub fn get(&self, id: DescriptorId) -> Option<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.in_use && s.generation == id.generation)
            .map(|s| &s.value)
    }

    /// Mutable access to the descriptor behind a live id.
    pub fn get_mut(&mut self, id: DescriptorId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.in_use && s.generation == id.generation)
            .map(|s| &mut s.value)
    }

    /// Returns true if `id` names a descriptor currently handed out.
    pub fn is_live(&self, id: DescriptorId) -> bool {
        self.get(id).is_some()
    }

    /// Ids of every descriptor currently handed out.
    pub fn live_ids(&self) -> Vec<DescriptorId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, s)| DescriptorId {
                index: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Every constructed descriptor, free or not.
    pub fn iter_all_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().map(|s| &mut s.value)
    }

    /// List name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current counters.
    pub fn stats(&self) -> FreeListStats {
        FreeListStats {
            capacity: self.slots.len(),
            in_use: self.slots.len() - self.free.len(),
            available: self.free.len(),
            grow_events: self.grow_events,
            exhausted: self.exhausted,
        }
    }
}

impl<T> fmt::Debug for FreeList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[derive(Default)]
    struct Desc {
        owner: Option<u64>,
        resets: u32,
    }

    impl Reset for Desc {
        fn reset(&mut self) {
            self.owner = None;
            self.resets += 1;
        }
    }

    fn list(initial: usize, increment: usize, max: usize) -> FreeList<Desc> {
        FreeList::new(
            "test",
            FreeListConfig {
                initial,
                increment,
                max,
            },
            Desc::default,
        )
    }

    #[test]
    fn test_initial_allocation() {
        let fl = list(4, 2, 6);
        let stats = fl.stats();
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.available, 4);
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_grow_to_max_then_unavailable() {
        let mut fl = list(4, 2, 6);
        let ids: Vec<_> = (0..6).map(|_| fl.allocate().unwrap()).collect();
        assert_eq!(fl.stats().capacity, 6);
        assert_eq!(fl.stats().grow_events, 1);
        assert!(fl.allocate().is_none());
        assert_eq!(fl.stats().exhausted, 1);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_concurrent_allocate_four_two_six() {
        let fl = Arc::new(Mutex::new(list(4, 2, 6)));
        let handles: Vec<_> = (0..7)
            .map(|_| {
                let fl = Arc::clone(&fl);
                std::thread::spawn(move || fl.lock().allocate())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let granted: HashSet<_> = results.iter().flatten().copied().collect();
        assert_eq!(granted.len(), 6);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
        assert_eq!(fl.lock().stats().capacity, 6);
    }

    #[test]
    fn test_release_resets_descriptor() {
        let mut fl = list(1, 1, 1);
        let id = fl.allocate().unwrap();
        fl.get_mut(id).unwrap().owner = Some(42);
        fl.release(id).unwrap();
        let again = fl.allocate().unwrap();
        assert_ne!(again, id);
        let desc = fl.get(again).unwrap();
        assert_eq!(desc.owner, None);
        assert_eq!(desc.resets, 1);
    }

    #[test]
    fn test_double_release_detected() {
        let mut fl = list(2, 1, 2);
        let id = fl.allocate().unwrap();
        fl.release(id).unwrap();
        let before = fl.stats();
        assert_eq!(fl.release(id), Err(FreeListError::StaleHandle(id)));
        assert_eq!(fl.stats(), before);
    }

    #[test]
    fn test_double_release_of_fresh_generation() {
        let mut fl = list(1, 1, 1);
        let id = fl.allocate().unwrap();
        fl.release(id).unwrap();
        // forge an id with the current generation of a free slot
        let forged = DescriptorId {
            index: id.index,
            generation: id.generation + 1,
        };
        assert_eq!(fl.release(forged), Err(FreeListError::DoubleRelease(forged)));
        assert_eq!(fl.stats().available, 1);
    }

    #[test]
    fn test_stale_id_not_readable() {
        let mut fl = list(1, 1, 1);
        let id = fl.allocate().unwrap();
        fl.release(id).unwrap();
        let reused = fl.allocate().unwrap();
        assert!(fl.get(id).is_none());
        assert!(fl.get(reused).is_some());
        assert!(!fl.is_live(id));
    }

    #[test]
    fn test_out_of_range() {
        let mut fl = list(1, 1, 1);
        let bogus = DescriptorId::from_wr_id(99);
        assert_eq!(fl.release(bogus), Err(FreeListError::OutOfRange(bogus)));
    }

    #[test]
    fn test_wr_id_roundtrip() {
        let id = DescriptorId {
            index: 17,
            generation: 3,
        };
        assert_eq!(DescriptorId::from_wr_id(id.to_wr_id()), id);
    }

    #[test]
    fn test_live_ids() {
        let mut fl = list(3, 1, 3);
        let a = fl.allocate().unwrap();
        let b = fl.allocate().unwrap();
        fl.release(a).unwrap();
        assert_eq!(fl.live_ids(), vec![b]);
    }

    proptest! {
        #[test]
        fn prop_never_two_owners(ops in prop::collection::vec(any::<bool>(), 1..200)) {
            let mut fl = list(2, 3, 10);
            let mut held: Vec<DescriptorId> = Vec::new();
            for allocate in ops {
                if allocate || held.is_empty() {
                    if let Some(id) = fl.allocate() {
                        prop_assert!(!held.iter().any(|h| h.index() == id.index()));
                        held.push(id);
                    } else {
                        prop_assert_eq!(held.len(), 10);
                    }
                } else {
                    let id = held.remove(0);
                    prop_assert!(fl.release(id).is_ok());
                    prop_assert!(fl.release(id).is_err());
                }
                let stats = fl.stats();
                prop_assert_eq!(stats.in_use, held.len());
                prop_assert!(stats.capacity <= 10);
            }
        }
    }
}
