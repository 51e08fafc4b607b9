//! Space allocation collaborator.
//!
//! [`ExtentAllocator`] keeps a first-fit free-extent map per top-level
//! device. A configurable maximum segment size models a fragmented pool:
//! requests larger than it fail with `NoSpace`, which is what pushes the
//! write pipeline into its gang fallback.

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::common::config::{p2roundup, Txg, VdevId};
use crate::common::exception::ZioError;
use crate::storage::blkptr::Dva;

/// Device class an allocation is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum AllocClass {
    #[default]
    Normal,
    Log,
    Special,
}

impl AllocClass {
    pub const ALL: [AllocClass; 3] = [AllocClass::Normal, AllocClass::Log, AllocClass::Special];
}

pub trait SpaceAllocator: Send + Sync {
    /// Registers a top-level device's space under `class`.
    fn add_vdev(&self, id: VdevId, class: AllocClass, size: u64, ashift: u32);

    /// Allocates `copies` distinct extents of `psize` bytes (rounded to each
    /// device's sector size).
    fn allocate(&self, class: AllocClass, psize: u64, copies: usize, txg: Txg) -> Result<Vec<Dva>, ZioError>;

    fn free(&self, dvas: &[Dva], txg: Txg);

    /// Marks space already described by `dvas` as allocated.
    fn claim(&self, dvas: &[Dva], txg: Txg) -> Result<(), ZioError>;

    fn free_space(&self) -> u64;

    /// Stops new allocations landing on `vdev`.
    fn set_cant_write(&self, vdev: VdevId, cant_write: bool);
}

struct Space {
    id: VdevId,
    class: AllocClass,
    ashift: u32,
    free: BTreeMap<u64, u64>,
    cant_write: bool,
}

impl Space {
    fn take_first_fit(&mut self, asize: u64) -> Option<u64> {
        let (&start, &len) = self.free.iter().find(|(_, len)| **len >= asize)?;
        self.free.remove(&start);
        if len > asize {
            self.free.insert(start + asize, len - asize);
        }
        Some(start)
    }

    fn insert(&mut self, offset: u64, len: u64) {
        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &plen)) = self.free.range(..offset).next_back() {
            debug_assert!(prev + plen <= offset, "double free at {}:{}", self.id, offset);
            if prev + plen == offset {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(&next_len) = self.free.get(&end) {
            self.free.remove(&end);
            end += next_len;
        }
        self.free.insert(start, end - start);
    }

    /// Removes `[offset, offset + len)` from the free map if wholly free.
    fn remove_exact(&mut self, offset: u64, len: u64) -> bool {
        let Some((&start, &flen)) = self.free.range(..=offset).next_back() else {
            return false;
        };
        if start + flen < offset + len {
            return false;
        }
        self.free.remove(&start);
        if start < offset {
            self.free.insert(start, offset - start);
        }
        if offset + len < start + flen {
            self.free.insert(offset + len, start + flen - offset - len);
        }
        true
    }

    fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

struct AllocatorState {
    spaces: Vec<Space>,
    index: HashMap<VdevId, usize>,
    rotor: usize,
}

pub struct ExtentAllocator {
    state: Mutex<AllocatorState>,
    max_segment: Mutex<Option<u64>>,
}

impl ExtentAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                spaces: Vec::new(),
                index: HashMap::new(),
                rotor: 0,
            }),
            max_segment: Mutex::new(None),
        }
    }

    fn add_space(&self, id: VdevId, class: AllocClass, size: u64, ashift: u32) {
        let mut state = self.state.lock();
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        let idx = state.spaces.len();
        state.spaces.push(Space {
            id,
            class,
            ashift,
            free,
            cant_write: false,
        });
        state.index.insert(id, idx);
    }

    /// Refuses any single allocation larger than `max` bytes.
    pub fn set_max_segment(&self, max: Option<u64>) {
        *self.max_segment.lock() = max;
    }

    pub fn vdev_free_space(&self, id: VdevId) -> Option<u64> {
        let state = self.state.lock();
        state.index.get(&id).map(|&i| state.spaces[i].free_bytes())
    }

    fn allocate_class(&self, state: &mut AllocatorState, class: AllocClass, psize: u64, copies: usize) -> Result<Vec<Dva>, ZioError> {
        let max_segment = *self.max_segment.lock();
        let candidates: Vec<usize> = (0..state.spaces.len())
            .map(|i| (state.rotor + i) % state.spaces.len().max(1))
            .filter(|&i| state.spaces[i].class == class && !state.spaces[i].cant_write)
            .collect();
        if candidates.is_empty() {
            return Err(ZioError::NoSpace);
        }

        let mut dvas: Vec<Dva> = Vec::with_capacity(copies);
        // Spread copies across devices; reuse devices only when there are
        // fewer devices than copies.
        for round in 0..copies {
            let mut placed = false;
            for pass in 0..2 {
                for &i in &candidates {
                    let space = &mut state.spaces[i];
                    if pass == 0 && dvas.iter().any(|d| d.vdev == space.id) {
                        continue;
                    }
                    let asize = p2roundup(psize, 1 << space.ashift);
                    if max_segment.is_some_and(|max| asize > max) {
                        continue;
                    }
                    if let Some(offset) = space.take_first_fit(asize) {
                        dvas.push(Dva {
                            vdev: space.id,
                            offset,
                            asize,
                            gang: false,
                        });
                        placed = true;
                        break;
                    }
                }
                if placed {
                    break;
                }
            }
            if !placed {
                trace!("allocation of copy {} ({} bytes) failed", round, psize);
                self.release(state, &dvas);
                return Err(ZioError::NoSpace);
            }
        }

        state.rotor = state.rotor.wrapping_add(1);
        Ok(dvas)
    }

    fn release(&self, state: &mut AllocatorState, dvas: &[Dva]) {
        for dva in dvas {
            if let Some(&i) = state.index.get(&dva.vdev) {
                state.spaces[i].insert(dva.offset, dva.asize);
            }
        }
    }
}

impl Default for ExtentAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceAllocator for ExtentAllocator {
    fn add_vdev(&self, id: VdevId, class: AllocClass, size: u64, ashift: u32) {
        self.add_space(id, class, size, ashift);
    }

    fn allocate(&self, class: AllocClass, psize: u64, copies: usize, txg: Txg) -> Result<Vec<Dva>, ZioError> {
        let mut state = self.state.lock();
        match self.allocate_class(&mut state, class, psize, copies) {
            Err(ZioError::NoSpace) if class != AllocClass::Normal => {
                debug!("class {:?} full at txg {}, falling back to normal", class, txg);
                self.allocate_class(&mut state, AllocClass::Normal, psize, copies)
            }
            other => other,
        }
    }

    fn free(&self, dvas: &[Dva], txg: Txg) {
        trace!("freeing {} extents at txg {}", dvas.len(), txg);
        let mut state = self.state.lock();
        self.release(&mut state, dvas);
    }

    fn claim(&self, dvas: &[Dva], _txg: Txg) -> Result<(), ZioError> {
        let mut state = self.state.lock();
        for (n, dva) in dvas.iter().enumerate() {
            let claimed = match state.index.get(&dva.vdev) {
                Some(&i) => state.spaces[i].remove_exact(dva.offset, dva.asize),
                None => false,
            };
            if !claimed {
                self.release(&mut state, &dvas[..n]);
                return Err(ZioError::NotFound);
            }
        }
        Ok(())
    }

    fn free_space(&self) -> u64 {
        self.state.lock().spaces.iter().map(Space::free_bytes).sum()
    }

    fn set_cant_write(&self, vdev: VdevId, cant_write: bool) {
        let mut state = self.state.lock();
        if let Some(&i) = state.index.get(&vdev) {
            state.spaces[i].cant_write = cant_write;
        }
    }
}
